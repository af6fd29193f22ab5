//! Shared data model and wire protocol for threatwatch.

pub mod protocol;
pub mod record;

pub use protocol::*;
pub use record::{Column, RecordKey, Severity, ThreatRecord, UNKNOWN};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| String::new())
}
