use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use relay_client::{RelayClient, StatusSource};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod output;

const DEFAULT_LOG_FILTER: &str = "threatwatch=info,relay=info,poller=info,reconcile=info";

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

impl OutputFormat {
    fn from_config(s: Option<&str>) -> Option<OutputFormat> {
        match s? {
            "text" => Some(OutputFormat::Text),
            "json" => Some(OutputFormat::Json),
            "jsonl" => Some(OutputFormat::Jsonl),
            _ => None,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "threatwatch", version, about = "Threat batch relay and live run watcher")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./threatwatch.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Relay base URL (default: $THREATWATCH_RELAY_URL, config relay_url, or http://127.0.0.1:5050)
    #[arg(long, global = true)]
    relay: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Run the relay the workflow pushes batches into
    #[cfg(feature = "relay")]
    Relay {
        /// Listen address
        #[arg(long)]
        listen: Option<String>,
        /// Workflow webhook that /start forwards to. Omit for dry mode.
        #[arg(long)]
        workflow_url: Option<String>,
        /// Callback URL handed to the workflow when a start request names none
        #[arg(long)]
        callback_url: Option<String>,
        /// Seconds an execution is kept before eviction
        #[arg(long)]
        retention_secs: Option<u64>,
    },
    /// Start (or attach to) a run and follow it until it completes
    #[cfg(feature = "watch")]
    Watch {
        /// Dataset path handed to the workflow
        #[arg(long)]
        source: Option<String>,
        /// Items per batch
        #[arg(long)]
        batch_size: Option<u32>,
        /// Maximum items to process
        #[arg(long)]
        item_limit: Option<u32>,
        /// Poll interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Per-request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Follow an execution that is already running instead of starting one
        #[arg(long)]
        execution_id: Option<String>,
        /// Output format: text, json, or jsonl
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
        /// Write the final results to FILE (JSONL unless --csv)
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        /// Write CSV instead of JSONL when --out is provided
        #[arg(long, default_value_t = false)]
        csv: bool,
    },
    /// Show one execution, or all tracked executions
    Status {
        /// Execution id; lists everything when omitted
        id: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Check that the relay is up
    Health {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let cfg = config::load_config(cli.config.as_deref())?;
    let relay_url = config::relay_url(cli.relay.as_deref(), std::env::var(config::RELAY_URL_ENV).ok(), &cfg);

    match cli.command {
        Commands::Version => {
            println!("threatwatch {} (core {})", env!("CARGO_PKG_VERSION"), threatwatch_core::version());
        }
        #[cfg(feature = "relay")]
        Commands::Relay { listen, workflow_url, callback_url, retention_secs } => {
            let section = cfg.relay();
            let mut relay_cfg = relay::RelayConfig::default();
            let listen = listen.or(section.listen).unwrap_or_else(|| relay::DEFAULT_LISTEN.to_string());
            relay_cfg.listen = listen.parse().with_context(|| format!("invalid listen address {}", listen))?;
            relay_cfg.workflow_url = workflow_url.or(section.workflow_url);
            relay_cfg.callback_url = callback_url.or(section.callback_url);
            relay_cfg.retention =
                Duration::from_secs(retention_secs.or(section.retention_secs).unwrap_or(relay::DEFAULT_RETENTION_SECS));
            if let Some(ms) = section.trigger_timeout_ms {
                relay_cfg.trigger_timeout = Duration::from_millis(ms);
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(relay::serve(relay_cfg))?;
        }
        #[cfg(feature = "watch")]
        Commands::Watch { source, batch_size, item_limit, interval_ms, timeout_ms, execution_id, format, out, csv } => {
            let section = cfg.watch();
            let opts = watch::WatchOpts {
                relay_url,
                source: source.or(section.source),
                batch_size: batch_size.or(section.batch_size).unwrap_or(10),
                item_limit: item_limit.or(section.item_limit).unwrap_or(100),
                interval: Duration::from_millis(interval_ms.or(section.interval_ms).unwrap_or(1000)),
                timeout: Duration::from_millis(timeout_ms.or(section.timeout_ms).unwrap_or(10_000)),
                max_failures: section.max_failures.unwrap_or(10),
                execution_id,
                format: format.or(OutputFormat::from_config(section.format.as_deref())).unwrap_or(OutputFormat::Text),
            };
            if csv && out.is_none() {
                return Err(anyhow!("--csv requires --out <file>"));
            }
            let rt = tokio::runtime::Runtime::new()?;
            let state = rt.block_on(watch::run(opts))?;
            if let Some(path) = out {
                export(&path, &state.results, csv)?;
                tracing::info!(path = %path.display(), records = state.results.len(), "results written");
            }
        }
        Commands::Status { id, format } => {
            let client = RelayClient::new(&relay_url, Duration::from_secs(10))?;
            let rt = tokio::runtime::Runtime::new()?;
            match id {
                Some(id) => {
                    let snap = rt.block_on(client.snapshot(&id))?;
                    match format {
                        OutputFormat::Text => {
                            if !snap.found {
                                return Err(anyhow!("execution {} not found", id));
                            }
                            let count = snap.total_results_count.unwrap_or(snap.all_results.len());
                            println!("{}: {}, {} batches, {} results", snap.execution_id, snap.status.as_str(), snap.batches_received, count);
                        }
                        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snap)?),
                        OutputFormat::Jsonl => println!("{}", serde_json::to_string(&snap)?),
                    }
                }
                None => {
                    let list = rt.block_on(client.list())?;
                    match format {
                        OutputFormat::Text => {
                            if list.executions.is_empty() {
                                println!("no executions tracked at {}", relay_url);
                            }
                            for e in &list.executions {
                                println!("{}", output::entry_line(e));
                            }
                        }
                        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&list)?),
                        OutputFormat::Jsonl => {
                            for e in &list.executions {
                                println!("{}", serde_json::to_string(e)?);
                            }
                        }
                    }
                }
            }
        }
        Commands::Health { format } => {
            let client = RelayClient::new(&relay_url, Duration::from_secs(5))?;
            let rt = tokio::runtime::Runtime::new()?;
            let health = rt.block_on(client.health())?;
            match format {
                OutputFormat::Text => println!("relay {} at {} ({} executions, {})", health.status, relay_url, health.executions, health.timestamp),
                OutputFormat::Json | OutputFormat::Jsonl => println!("{}", serde_json::to_string(&health)?),
            }
            if !health.is_running() {
                return Err(anyhow!("relay reported status {:?}", health.status));
            }
        }
    }
    Ok(())
}

#[cfg(feature = "watch")]
fn export(path: &std::path::Path, records: &[threatwatch_core::ThreatRecord], csv: bool) -> Result<()> {
    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let w = std::io::BufWriter::new(file);
    if csv { output::write_csv(w, records) } else { output::write_jsonl(w, records) }
}

#[cfg(feature = "watch")]
mod watch {
    use super::{output, OutputFormat};
    use anyhow::{anyhow, Result};
    use poller::{Controller, PollerConfig};
    use reconcile::ExecutionState;
    use relay_client::RelayClient;
    use std::time::Duration;
    use threatwatch_core::{RunPlan, StartRequest};

    pub struct WatchOpts {
        pub relay_url: String,
        pub source: Option<String>,
        pub batch_size: u32,
        pub item_limit: u32,
        pub interval: Duration,
        pub timeout: Duration,
        pub max_failures: u32,
        pub execution_id: Option<String>,
        pub format: OutputFormat,
    }

    /// Follow one run to the end and return its final state. Ctrl-c stops following.
    pub async fn run(opts: WatchOpts) -> Result<ExecutionState> {
        let client = RelayClient::new(&opts.relay_url, opts.timeout)?;
        let poller_cfg = PollerConfig {
            interval: opts.interval,
            request_timeout: opts.timeout,
            max_consecutive_failures: opts.max_failures,
            ..PollerConfig::default()
        };
        let controller = Controller::new(client, poller_cfg);

        match opts.execution_id {
            Some(id) => {
                tracing::info!(execution_id = %id, "attaching to running execution");
                controller.attach(id, RunPlan::new(opts.item_limit, opts.batch_size));
            }
            None => {
                let source = opts.source.ok_or_else(|| anyhow!("--source is required to start a run"))?;
                let req = StartRequest { source_path: source, callback_target: None, batch_size: opts.batch_size, item_limit: opts.item_limit };
                controller.start(req).await?;
            }
        }

        let mut rx = controller.subscribe();
        let mut last: Option<(u8, usize, u32, bool)> = None;
        let view = loop {
            let view = rx.borrow_and_update().clone();
            if let Some(state) = &view.state {
                let key = (view.progress, state.results.len(), state.batches_received, view.error.is_some());
                if last != Some(key) {
                    last = Some(key);
                    match opts.format {
                        OutputFormat::Text => println!("{}", output::progress_line(view.progress, state, view.error.as_deref())),
                        OutputFormat::Jsonl => println!("{}", output::progress_json(view.progress, state, view.error.as_deref())),
                        OutputFormat::Json => {}
                    }
                }
            }
            if !view.polling {
                break view;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break controller.view();
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("interrupted, no longer following");
                    let current = controller.view();
                    controller.reset();
                    break current;
                }
            }
        };

        let state = view.state.clone().ok_or_else(|| anyhow!("no execution was tracked"))?;
        match opts.format {
            OutputFormat::Text => print!("{}", output::summary_text(&state)),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
            OutputFormat::Jsonl => {}
        }
        if let Some(e) = view.error {
            return Err(anyhow!("{}: {}", state.execution_id, e));
        }
        if view.anomalies > 0 {
            tracing::warn!(anomalies = view.anomalies, "relay snapshots were inconsistent during the run");
        }
        Ok(state)
    }
}
