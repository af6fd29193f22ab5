use crate::error::RelayResult;
use crate::handlers;
use crate::store::Store;
use crate::trigger::WorkflowTrigger;
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:5050";
pub const DEFAULT_RETENTION_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Workflow engine webhook that `/start` forwards to.
    pub workflow_url: Option<String>,
    /// Where the workflow should push batches, when the start request names none.
    pub callback_url: Option<String>,
    pub retention: Duration,
    pub trigger_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], 5050)),
            workflow_url: None,
            callback_url: None,
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            trigger_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub trigger: Arc<WorkflowTrigger>,
}

impl AppState {
    pub fn new(config: &RelayConfig) -> RelayResult<Self> {
        let trigger = WorkflowTrigger::new(config.workflow_url.clone(), config.callback_url.clone(), config.trigger_timeout)?;
        Ok(AppState { store: Arc::new(Store::new(config.retention)), trigger: Arc::new(trigger) })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/start", post(handlers::start))
        .route("/webhook/batch", post(handlers::batch))
        .route("/webhook/complete", post(handlers::complete))
        .route("/status", get(handlers::list))
        .route("/status/:id", get(handlers::status).delete(handlers::remove))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_on<F>(listener: TcpListener, state: AppState, shutdown: F) -> RelayResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

/// Bind `config.listen` and serve until ctrl-c.
pub async fn serve(config: RelayConfig) -> RelayResult<()> {
    let state = AppState::new(&config)?;
    let listener = TcpListener::bind(config.listen).await?;
    tracing::info!(
        listen = %listener.local_addr()?,
        workflow = config.workflow_url.as_deref().unwrap_or("none (dry mode)"),
        retention_secs = config.retention.as_secs(),
        "relay listening"
    );
    serve_on(listener, state, shutdown_signal()).await?;
    tracing::info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("ctrl-c handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}
