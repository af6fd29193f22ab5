//! Collector the workflow engine pushes classified batches into, and the status endpoints
//! pollers read from.

mod error;
mod handlers;
mod server;
mod store;
mod trigger;

pub use error::{RelayError, RelayResult};
pub use server::{router, serve, serve_on, AppState, RelayConfig, DEFAULT_LISTEN, DEFAULT_RETENTION_SECS};
pub use store::Store;
pub use trigger::{Triggered, WorkflowTrigger};
