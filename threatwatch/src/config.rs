use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG: &str = "threatwatch.yaml";
pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:5050";
pub const RELAY_URL_ENV: &str = "THREATWATCH_RELAY_URL";

#[derive(Debug, Default, Deserialize, Clone)]
pub struct RelaySection {
    pub listen: Option<String>,
    pub workflow_url: Option<String>,
    pub callback_url: Option<String>,
    pub retention_secs: Option<u64>,
    pub trigger_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct WatchSection {
    pub source: Option<String>,
    pub batch_size: Option<u32>,
    pub item_limit: Option<u32>,
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub max_failures: Option<u32>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub relay_url: Option<String>,
    pub relay: Option<RelaySection>,
    pub watch: Option<WatchSection>,
}

impl Config {
    pub fn relay(&self) -> RelaySection {
        self.relay.clone().unwrap_or_default()
    }

    pub fn watch(&self) -> WatchSection {
        self.watch.clone().unwrap_or_default()
    }
}

/// An explicit path must load; the default file is only read if present.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG);
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    parse(&s).with_context(|| format!("parsing {}", path.display()))
}

fn parse(s: &str) -> Result<Config> {
    if s.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(s)?)
}

/// Flag, then environment, then config file, then the local default.
pub fn relay_url(flag: Option<&str>, env: Option<String>, cfg: &Config) -> String {
    flag.map(str::to_string)
        .or(env.filter(|v| !v.trim().is_empty()))
        .or_else(|| cfg.relay_url.clone())
        .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
relay_url: http://relay.internal:5050
relay:
  listen: 0.0.0.0:5050
  workflow_url: http://n8n.internal:5678/webhook/threat-start
  retention_secs: 600
watch:
  source: data/cyber_attacks.csv
  batch_size: 25
  item_limit: 100
  format: jsonl
"#;

    #[test]
    fn parses_sections() {
        let cfg = parse(SAMPLE).unwrap();
        assert_eq!(cfg.relay().retention_secs, Some(600));
        assert_eq!(cfg.relay().callback_url, None);
        assert_eq!(cfg.watch().batch_size, Some(25));
        assert_eq!(cfg.watch().format.as_deref(), Some("jsonl"));
        assert!(parse("").unwrap().relay.is_none());
        assert!(parse("relay: [1, 2]").is_err());
    }

    #[test]
    fn relay_url_precedence() {
        let cfg = parse(SAMPLE).unwrap();
        assert_eq!(relay_url(Some("http://flag:1"), Some("http://env:2".into()), &cfg), "http://flag:1");
        assert_eq!(relay_url(None, Some("http://env:2".into()), &cfg), "http://env:2");
        assert_eq!(relay_url(None, Some(" ".into()), &cfg), "http://relay.internal:5050");
        assert_eq!(relay_url(None, None, &Config::default()), DEFAULT_RELAY_URL);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/threatwatch.yaml"))).is_err());
    }
}
