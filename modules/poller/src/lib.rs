//! Polling controller: decides when to ask the relay for a fresh snapshot, feeds the
//! answers to the reconciliation engine and publishes the resulting view.
//!
//! One background task per tracked execution ticks on a tokio interval. Each tick spawns
//! its query into a `JoinSet`, so a slow response never holds back the next tick, and
//! responses are applied in the order they come back. Every response is tagged with the
//! generation it was issued under; once a new run starts (or the controller is reset)
//! the generation moves on and late answers for the old execution are dropped.

use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use reconcile::{Directive, ExecutionState, Reconciler, StopReason};
use relay_client::{ClientError, StatusSource};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use threatwatch_core::{InvalidRequest, RunPlan, Snapshot, StartRequest, StartResponse};
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub request_timeout: Duration,
    /// Queries allowed to be outstanding at once; ticks beyond that are skipped.
    pub max_in_flight: usize,
    /// Transport failures in a row before polling halts and waits for `retry()`.
    pub max_consecutive_failures: u32,
    pub start_retry_delay: Duration,
    pub require_health: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            interval: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(10),
            max_in_flight: 2,
            max_consecutive_failures: 10,
            start_retry_delay: Duration::from_millis(500),
            require_health: true,
        }
    }
}

/// What the presentation layer reads. `state.results` only grows, or resets with the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardView {
    pub execution_id: Option<String>,
    pub state: Option<ExecutionState>,
    pub progress: u8,
    pub polling: bool,
    pub error: Option<String>,
    pub anomalies: u64,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("relay is not running (reported {0:?})")]
    RelayUnavailable(String),
    #[error("invalid run request: {0}")]
    Invalid(#[from] InvalidRequest),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("no execution is being tracked")]
    NoActiveRun,
    #[error("start of execution {0} was superseded by a newer run")]
    Superseded(String),
}

pub const NOT_FOUND_MESSAGE: &str = "execution not found";

struct Session {
    generation: u64,
    /// Bumped by every start, attach and reset; a start response only attaches if the
    /// ticket it was issued under is still current.
    start_ticket: u64,
    reconciler: Option<Reconciler>,
    task: Option<JoinHandle<()>>,
    failures: u32,
}

impl Session {
    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation += 1;
    }
}

struct Shared {
    session: Mutex<Session>,
    view: watch::Sender<DashboardView>,
    refresh: Notify,
}

enum Flow {
    Continue,
    Stop,
}

impl Shared {
    /// Read, merge and publish under one lock so concurrent appliers cannot interleave.
    fn apply(&self, generation: u64, result: Result<Snapshot, ClientError>, max_failures: u32) -> Flow {
        let mut session = self.session.lock();
        if session.generation != generation {
            tracing::debug!(generation, current = session.generation, "dropping response for abandoned run");
            return Flow::Stop;
        }
        match result {
            Ok(snap) => {
                session.failures = 0;
                let Some(reconciler) = session.reconciler.as_mut() else { return Flow::Stop };
                let outcome = reconciler.apply(&snap);
                let had_error = self.view.borrow().error.is_some();
                let (polling, error, flow) = match outcome.directive {
                    Directive::Continue => (true, None, Flow::Continue),
                    Directive::Stop(StopReason::Completed) => {
                        tracing::info!(execution_id = %reconciler.execution_id(), results = reconciler.state().results.len(), "execution completed");
                        (false, None, Flow::Stop)
                    }
                    Directive::Stop(StopReason::NotFound) => {
                        tracing::warn!(execution_id = %reconciler.execution_id(), "execution not found on relay");
                        (false, Some(NOT_FOUND_MESSAGE.to_string()), Flow::Stop)
                    }
                };
                if outcome.changed || had_error || !polling {
                    let view = DashboardView {
                        execution_id: Some(reconciler.execution_id().to_string()),
                        state: Some(reconciler.state().clone()),
                        progress: reconciler.progress(),
                        polling,
                        error,
                        anomalies: reconciler.anomaly_count(),
                    };
                    self.view.send_replace(view);
                }
                flow
            }
            Err(e) => {
                session.failures += 1;
                let failures = session.failures;
                let halted = failures >= max_failures.max(1);
                tracing::warn!(error = %e, failures, halted, "status query failed");
                self.view.send_modify(|v| {
                    v.error = Some(e.to_string());
                    if halted { v.polling = false; }
                });
                if halted { Flow::Stop } else { Flow::Continue }
            }
        }
    }
}

pub struct Controller<S: StatusSource> {
    source: Arc<S>,
    config: PollerConfig,
    shared: Arc<Shared>,
}

impl<S: StatusSource> Controller<S> {
    pub fn new(source: S, config: PollerConfig) -> Self {
        let (view, _) = watch::channel(DashboardView::default());
        let shared = Arc::new(Shared {
            session: Mutex::new(Session { generation: 0, start_ticket: 0, reconciler: None, task: None, failures: 0 }),
            view,
            refresh: Notify::new(),
        });
        Controller { source: Arc::new(source), config, shared }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardView> {
        self.shared.view.subscribe()
    }

    pub fn view(&self) -> DashboardView {
        self.shared.view.borrow().clone()
    }

    pub fn is_polling(&self) -> bool {
        self.shared.view.borrow().polling
    }

    /// Ask the workflow for a new run and start tracking it. The run tracked so far keeps
    /// polling until the new execution id comes back, and survives a failed start. If
    /// another start, attach or reset happens meanwhile, this response is dropped.
    pub async fn start(&self, req: StartRequest) -> Result<StartResponse, PollError> {
        req.validate()?;
        let ticket = {
            let mut session = self.shared.session.lock();
            session.start_ticket += 1;
            session.start_ticket
        };
        let result = self.request_run(&req).await;

        let mut session = self.shared.session.lock();
        if session.start_ticket != ticket {
            let abandoned = result.as_ref().map(|r| r.execution_id.clone()).unwrap_or_default();
            tracing::warn!(execution_id = %abandoned, "start response arrived after a newer request, dropped");
            return Err(result.err().unwrap_or(PollError::Superseded(abandoned)));
        }
        match result {
            Ok(resp) => {
                tracing::info!(execution_id = %resp.execution_id, batch_size = req.batch_size, item_limit = req.item_limit, "run started");
                self.attach_locked(&mut session, resp.execution_id.clone(), req.plan());
                Ok(resp)
            }
            Err(e) => {
                self.shared.view.send_modify(|v| v.error = Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn request_run(&self, req: &StartRequest) -> Result<StartResponse, PollError> {
        self.ensure_healthy().await?;
        self.start_with_retry(req).await
    }

    async fn ensure_healthy(&self) -> Result<(), PollError> {
        if !self.config.require_health {
            return Ok(());
        }
        let health = match timeout(self.config.request_timeout, self.source.health()).await {
            Ok(r) => r?,
            Err(_) => return Err(ClientError::Timeout(self.config.request_timeout).into()),
        };
        if health.is_running() { Ok(()) } else { Err(PollError::RelayUnavailable(health.status)) }
    }

    /// One retry with jittered backoff for transient failures, never more.
    async fn start_with_retry(&self, req: &StartRequest) -> Result<StartResponse, PollError> {
        let mut attempt = 0u32;
        loop {
            let result = match timeout(self.config.request_timeout, self.source.start(req)).await {
                Ok(r) => r,
                Err(_) => Err(ClientError::Timeout(self.config.request_timeout)),
            };
            match result {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt == 0 => {
                    attempt += 1;
                    let delay = backoff(self.config.start_retry_delay, attempt);
                    tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "start request failed, retrying once");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Track an execution that is already running. Must be called inside a tokio runtime.
    pub fn attach(&self, execution_id: impl Into<String>, plan: RunPlan) {
        let mut session = self.shared.session.lock();
        session.start_ticket += 1;
        self.attach_locked(&mut session, execution_id.into(), plan);
    }

    fn attach_locked(&self, session: &mut Session, execution_id: String, plan: RunPlan) {
        session.cancel();
        session.failures = 0;
        let reconciler = Reconciler::new(execution_id.clone(), plan);
        self.shared.view.send_replace(DashboardView {
            execution_id: Some(execution_id.clone()),
            state: Some(reconciler.state().clone()),
            progress: 0,
            polling: true,
            error: None,
            anomalies: 0,
        });
        session.reconciler = Some(reconciler);
        session.task = Some(self.spawn_loop(session.generation, execution_id));
    }

    /// Force a fresh query now and re-publish what is already known.
    pub fn refresh(&self) -> Result<(), PollError> {
        if self.is_polling() {
            self.shared.view.send_modify(|_| {});
            self.shared.refresh.notify_one();
            Ok(())
        } else {
            self.retry()
        }
    }

    /// Resume polling after it halted on repeated transport failures. Terminal runs
    /// (completed or not found) stay as they are.
    pub fn retry(&self) -> Result<(), PollError> {
        let mut session = self.shared.session.lock();
        let (execution_id, directive) = match session.reconciler.as_ref() {
            Some(r) => (r.execution_id().to_string(), r.directive()),
            None => return Err(PollError::NoActiveRun),
        };
        if directive != Directive::Continue || self.shared.view.borrow().polling {
            return Ok(());
        }
        session.cancel();
        session.failures = 0;
        self.shared.view.send_modify(|v| {
            v.polling = true;
            v.error = None;
        });
        tracing::info!(%execution_id, "polling resumed");
        session.task = Some(self.spawn_loop(session.generation, execution_id));
        Ok(())
    }

    /// Stop scheduling and forget the tracked execution.
    pub fn reset(&self) {
        let mut session = self.shared.session.lock();
        session.start_ticket += 1;
        session.cancel();
        session.reconciler = None;
        session.failures = 0;
        self.shared.view.send_replace(DashboardView::default());
    }

    /// Resolves once polling has stopped, returning the final view.
    pub async fn wait_until_idle(&self) -> DashboardView {
        let mut rx = self.subscribe();
        let idle = rx.wait_for(|v| !v.polling).await.map(|v| v.clone());
        idle.unwrap_or_else(|_| self.view())
    }

    fn spawn_loop(&self, generation: u64, execution_id: String) -> JoinHandle<()> {
        let source = self.source.clone();
        let shared = self.shared.clone();
        let config = self.config.clone();
        tokio::spawn(poll_loop(source, shared, config, generation, execution_id))
    }
}

impl<S: StatusSource> Drop for Controller<S> {
    fn drop(&mut self) {
        self.shared.session.lock().cancel();
    }
}

async fn poll_loop<S: StatusSource>(source: Arc<S>, shared: Arc<Shared>, config: PollerConfig, generation: u64, execution_id: String) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let max_in_flight = config.max_in_flight.max(1);
    let mut queries: JoinSet<Result<Snapshot, ClientError>> = JoinSet::new();
    tracing::debug!(%execution_id, generation, interval_ms = config.interval.as_millis() as u64, "polling");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if queries.len() < max_in_flight {
                    queries.spawn(query(source.clone(), execution_id.clone(), config.request_timeout));
                } else {
                    tracing::debug!(in_flight = queries.len(), "tick skipped, queries outstanding");
                }
            }
            _ = shared.refresh.notified() => {
                if queries.len() < max_in_flight {
                    queries.spawn(query(source.clone(), execution_id.clone(), config.request_timeout));
                    ticker.reset();
                } else {
                    tracing::debug!(in_flight = queries.len(), "refresh skipped, queries outstanding");
                }
            }
            Some(joined) = queries.join_next() => {
                let result = match joined {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "status query task failed");
                        continue;
                    }
                };
                if let Flow::Stop = shared.apply(generation, result, config.max_consecutive_failures) {
                    break;
                }
            }
        }
    }
    tracing::debug!(%execution_id, generation, "polling stopped");
}

async fn query<S: StatusSource>(source: Arc<S>, execution_id: String, limit: Duration) -> Result<Snapshot, ClientError> {
    match timeout(limit, source.snapshot(&execution_id)).await {
        Ok(r) => r,
        Err(_) => Err(ClientError::Timeout(limit)),
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    let base = base.as_millis() as u64;
    let exp = base.saturating_mul(1u64 << attempt.min(6));
    let jitter = thread_rng().gen_range(0..(exp / 4 + 1));
    Duration::from_millis(exp + jitter)
}
