//! Wire shapes exchanged between the workflow, the relay and polling clients.
//!
//! The relay always answers a status query with the *full* accumulated result list for an
//! execution, never a delta. Results are appended in arrival order and are never
//! reordered or rewritten; clients may rely on that and nothing stronger (no ordering by
//! timestamp, no exactly-once delivery).

use crate::record::{lenient, Severity, ThreatRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[serde(alias = "NOT_FOUND", alias = "notfound")]
    NotFound,
    #[default]
    #[serde(alias = "PROCESSING", alias = "running")]
    Processing,
    #[serde(alias = "COMPLETED", alias = "complete", alias = "done")]
    Completed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::NotFound => "not_found",
            ExecutionStatus::Processing => "processing",
            ExecutionStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalSummary {
    pub total_items: u64,
    pub true_positives: u64,
    pub false_positives: u64,
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

impl FinalSummary {
    /// Derive a summary from delivered records, for completions that arrive without one.
    pub fn from_records(records: &[ThreatRecord]) -> FinalSummary {
        let mut s = FinalSummary { total_items: records.len() as u64, ..FinalSummary::default() };
        for r in records {
            match r.is_malicious() {
                Some(true) => s.true_positives += 1,
                Some(false) => s.false_positives += 1,
                None => {}
            }
            match r.severity() {
                Severity::Critical => s.critical += 1,
                Severity::High => s.high += 1,
                Severity::Medium => s.medium += 1,
                Severity::Low => s.low += 1,
                Severity::Unknown => {}
            }
        }
        s
    }
}

/// One status query response for a single execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub found: bool,
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub status: ExecutionStatus,
    #[serde(default)]
    pub batches_received: u32,
    #[serde(default, deserialize_with = "lenient::records")]
    pub all_results: Vec<ThreatRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_summary: Option<FinalSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_results_count: Option<usize>,
}

impl Snapshot {
    pub fn not_found(execution_id: impl Into<String>) -> Snapshot {
        Snapshot {
            found: false,
            execution_id: execution_id.into(),
            status: ExecutionStatus::NotFound,
            ..Snapshot::default()
        }
    }
}

/// One execution as listed by `GET /status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEntry {
    pub execution_id: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_time: Option<String>,
    #[serde(default)]
    pub batches_received: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_summary: Option<FinalSummary>,
    #[serde(default, deserialize_with = "lenient::records")]
    pub all_results: Vec<ThreatRecord>,
    #[serde(default)]
    pub total_results_count: usize,
}

impl ExecutionEntry {
    pub fn status(&self) -> ExecutionStatus {
        if self.completed_time.is_some() { ExecutionStatus::Completed } else { ExecutionStatus::Processing }
    }

    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            found: true,
            execution_id: self.execution_id.clone(),
            status: self.status(),
            batches_received: self.batches_received,
            all_results: self.all_results.clone(),
            final_summary: self.final_summary.clone(),
            start_time: Some(self.start_time.clone()).filter(|s| !s.is_empty()),
            completed_time: self.completed_time.clone(),
            total_results_count: Some(self.total_results_count),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusList {
    #[serde(default)]
    pub executions: Vec<ExecutionEntry>,
}

impl StatusList {
    pub fn find(&self, execution_id: &str) -> Option<&ExecutionEntry> {
        self.executions.iter().find(|e| e.execution_id == execution_id)
    }

    /// Filter the list down to one execution, `found = false` when absent.
    pub fn snapshot_for(&self, execution_id: &str) -> Snapshot {
        self.find(execution_id).map(ExecutionEntry::to_snapshot).unwrap_or_else(|| Snapshot::not_found(execution_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub source_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_target: Option<String>,
    pub batch_size: u32,
    pub item_limit: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidRequest {
    #[error("source_path must not be empty")]
    EmptySource,
    #[error("batch_size must be > 0")]
    ZeroBatchSize,
    #[error("item_limit must be > 0")]
    ZeroItemLimit,
}

impl StartRequest {
    pub fn validate(&self) -> Result<(), InvalidRequest> {
        if self.source_path.trim().is_empty() { return Err(InvalidRequest::EmptySource); }
        if self.batch_size == 0 { return Err(InvalidRequest::ZeroBatchSize); }
        if self.item_limit == 0 { return Err(InvalidRequest::ZeroItemLimit); }
        Ok(())
    }

    pub fn plan(&self) -> RunPlan {
        RunPlan::new(self.item_limit, self.batch_size)
    }
}

/// What a run is expected to deliver, used only for progress estimation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPlan {
    pub expected_total: u32,
    pub expected_batches: u32,
}

impl RunPlan {
    pub fn new(item_limit: u32, batch_size: u32) -> RunPlan {
        let expected_batches = if batch_size == 0 { 0 } else { item_limit.div_ceil(batch_size) };
        RunPlan { expected_total: item_limit, expected_batches }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub status: ExecutionStatus,
    pub config: StartRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    #[serde(default)]
    pub executions: usize,
}

impl HealthResponse {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }
}

/// Pushed by the workflow each time a batch of items finishes classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchEvent {
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<u32>,
    #[serde(default, alias = "items", alias = "batch_results", deserialize_with = "lenient::records")]
    pub results: Vec<ThreatRecord>,
}

/// Pushed by the workflow once the whole execution is done.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_summary: Option<FinalSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAck {
    pub execution_id: String,
    pub accepted: usize,
    pub skipped: usize,
    pub duplicate_batch: bool,
    pub batches_received: u32,
    pub total_results: usize,
}
