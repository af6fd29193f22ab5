//! Turns a stream of full-state relay snapshots into one growing, deduplicated view of an
//! execution.
//!
//! Every snapshot carries the *entire* accumulated result list. The merge rule is
//! content-blind: a longer list replaces the stored one wholesale, an equal-length list is
//! a no-op for the collection, and a shorter list is ignored and flagged. That is only
//! correct because the relay appends results and never reorders, rewrites or removes
//! them. A blake3 digest of the stored list is kept so silent rewrites at least show up
//! as [`Anomaly::ContentDrift`]; they never change what is displayed.

mod progress;
mod stats;

pub use progress::progress;
pub use stats::{GeoIndex, ThreatStats, HIGH_RISK_THRESHOLD};

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use threatwatch_core::{now_rfc3339, ExecutionStatus, FinalSummary, RecordKey, RunPlan, Snapshot, ThreatRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionState {
    pub execution_id: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub status: ExecutionStatus,
    pub batches_received: u32,
    /// Arrival order, not timestamp order.
    pub results: Vec<ThreatRecord>,
    pub final_summary: Option<FinalSummary>,
    pub stats: ThreatStats,
    pub digest: String,
}

impl ExecutionState {
    pub fn new(execution_id: impl Into<String>) -> ExecutionState {
        ExecutionState {
            execution_id: execution_id.into(),
            started_at: None,
            completed_at: None,
            status: ExecutionStatus::Processing,
            batches_received: 0,
            results: Vec::new(),
            final_summary: None,
            stats: ThreatStats::default(),
            digest: digest(&[]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    Stop(StopReason),
}

/// Snapshot oddities. None of them are fatal; the stored state is clamped and merging
/// carries on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    ForeignExecution { received: String },
    ResultsShrank { stored: usize, received: usize },
    ContentDrift { compared: usize },
    BatchesRegressed { stored: u32, received: u32 },
    BatchesExceeded { received: u32, expected: u32 },
    CountMismatch { listed: usize, reported: usize },
    DuplicateIdentity { key: RecordKey },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::ForeignExecution { received } => write!(f, "snapshot for foreign execution {}", received),
            Anomaly::ResultsShrank { stored, received } => write!(f, "result count dropped from {} to {}", stored, received),
            Anomaly::ContentDrift { compared } => write!(f, "first {} results changed content", compared),
            Anomaly::BatchesRegressed { stored, received } => write!(f, "batches_received went back from {} to {}", stored, received),
            Anomaly::BatchesExceeded { received, expected } => write!(f, "{} batches received, {} expected", received, expected),
            Anomaly::CountMismatch { listed, reported } => write!(f, "{} results listed, {} reported", listed, reported),
            Anomaly::DuplicateIdentity { key } => write!(f, "duplicate record identity {}", key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub changed: bool,
    pub directive: Directive,
    pub anomalies: Vec<Anomaly>,
}

impl MergeOutcome {
    fn unchanged(directive: Directive) -> MergeOutcome {
        MergeOutcome { changed: false, directive, anomalies: Vec::new() }
    }
}

/// Reconciliation state for one tracked execution.
pub struct Reconciler {
    plan: RunPlan,
    state: ExecutionState,
    seen_ids: HashSet<String>,
    flagged: HashSet<RecordKey>,
    last_mismatch: Option<(usize, usize)>,
    last_drift: Option<String>,
    anomaly_count: u64,
}

impl Reconciler {
    pub fn new(execution_id: impl Into<String>, plan: RunPlan) -> Reconciler {
        Reconciler {
            plan,
            state: ExecutionState::new(execution_id),
            seen_ids: HashSet::new(),
            flagged: HashSet::new(),
            last_mismatch: None,
            last_drift: None,
            anomaly_count: 0,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.state.execution_id
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn into_state(self) -> ExecutionState {
        self.state
    }

    pub fn anomaly_count(&self) -> u64 {
        self.anomaly_count
    }

    pub fn progress(&self) -> u8 {
        progress(self.state.results.len(), self.state.batches_received, &self.plan, self.state.status)
    }

    /// Whether polling can still learn anything.
    pub fn directive(&self) -> Directive {
        match self.state.status {
            ExecutionStatus::Processing => Directive::Continue,
            ExecutionStatus::Completed => Directive::Stop(StopReason::Completed),
            ExecutionStatus::NotFound => Directive::Stop(StopReason::NotFound),
        }
    }

    pub fn apply(&mut self, snap: &Snapshot) -> MergeOutcome {
        if !snap.execution_id.is_empty() && snap.execution_id != self.state.execution_id {
            let mut out = MergeOutcome::unchanged(self.directive());
            out.anomalies.push(Anomaly::ForeignExecution { received: snap.execution_id.clone() });
            self.record(&out.anomalies);
            return out;
        }
        if self.state.status == ExecutionStatus::Completed {
            return MergeOutcome::unchanged(Directive::Stop(StopReason::Completed));
        }
        if !snap.found || snap.status == ExecutionStatus::NotFound {
            let changed = self.state.status != ExecutionStatus::NotFound;
            self.state.status = ExecutionStatus::NotFound;
            return MergeOutcome { changed, directive: Directive::Stop(StopReason::NotFound), anomalies: Vec::new() };
        }

        let mut anomalies = Vec::new();
        let mut changed = self.merge_results(&snap.all_results, &mut anomalies);

        match snap.batches_received.cmp(&self.state.batches_received) {
            std::cmp::Ordering::Greater => {
                self.state.batches_received = snap.batches_received;
                changed = true;
                if self.plan.expected_batches > 0 && snap.batches_received > self.plan.expected_batches {
                    anomalies.push(Anomaly::BatchesExceeded { received: snap.batches_received, expected: self.plan.expected_batches });
                }
            }
            std::cmp::Ordering::Less => anomalies.push(Anomaly::BatchesRegressed {
                stored: self.state.batches_received,
                received: snap.batches_received,
            }),
            std::cmp::Ordering::Equal => {}
        }

        if let Some(reported) = snap.total_results_count {
            let pair = (snap.all_results.len(), reported);
            if pair.0 != pair.1 && self.last_mismatch != Some(pair) {
                anomalies.push(Anomaly::CountMismatch { listed: pair.0, reported });
            }
            self.last_mismatch = Some(pair);
        }

        if self.state.started_at.is_none() && snap.start_time.is_some() {
            self.state.started_at = snap.start_time.clone();
            changed = true;
        }

        let directive = if snap.status == ExecutionStatus::Completed {
            self.state.status = ExecutionStatus::Completed;
            self.state.final_summary =
                Some(snap.final_summary.clone().unwrap_or_else(|| FinalSummary::from_records(&self.state.results)));
            self.state.completed_at = snap.completed_time.clone().or_else(|| Some(now_rfc3339()));
            changed = true;
            Directive::Stop(StopReason::Completed)
        } else {
            if self.state.status != ExecutionStatus::Processing {
                self.state.status = ExecutionStatus::Processing;
                changed = true;
            }
            Directive::Continue
        };

        self.record(&anomalies);
        MergeOutcome { changed, directive, anomalies }
    }

    fn merge_results(&mut self, incoming: &[ThreatRecord], anomalies: &mut Vec<Anomaly>) -> bool {
        let stored = self.state.results.len();
        if incoming.len() < stored {
            anomalies.push(Anomaly::ResultsShrank { stored, received: incoming.len() });
            return false;
        }
        if stored > 0 {
            let prefix = digest(&incoming[..stored]);
            if prefix == self.state.digest {
                self.last_drift = None;
            } else {
                // a persisting rewrite is reported once, not on every poll
                if self.last_drift.as_deref() != Some(prefix.as_str()) {
                    anomalies.push(Anomaly::ContentDrift { compared: stored });
                }
                self.last_drift = Some(prefix);
            }
        }
        if incoming.len() == stored {
            return false;
        }

        for (i, r) in incoming.iter().enumerate().skip(stored) {
            if let Some(id) = &r.unique_id {
                if !self.seen_ids.insert(id.clone()) {
                    let key = r.key(i);
                    if self.flagged.insert(key.clone()) {
                        anomalies.push(Anomaly::DuplicateIdentity { key });
                    }
                }
            }
        }
        self.state.results = incoming.to_vec();
        self.state.digest = digest(&self.state.results);
        self.state.stats = ThreatStats::from_records(&self.state.results);
        true
    }

    fn record(&mut self, anomalies: &[Anomaly]) {
        for a in anomalies {
            self.anomaly_count += 1;
            tracing::warn!(execution_id = %self.state.execution_id, anomaly = %a, "snapshot anomaly");
        }
    }
}

/// Digest over the serialized records, in order.
pub fn digest(records: &[ThreatRecord]) -> String {
    let mut h = blake3::Hasher::new();
    for r in records {
        match serde_json::to_vec(r) {
            Ok(bytes) => {
                h.update(&(bytes.len() as u64).to_le_bytes());
                h.update(&bytes);
            }
            Err(_) => {
                h.update(&0u64.to_le_bytes());
            }
        }
    }
    h.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(ids: std::ops::Range<usize>) -> Vec<ThreatRecord> {
        ids.map(|i| ThreatRecord {
            unique_id: Some(format!("evt-{}", i)),
            severity_level: Some(if i % 2 == 0 { "High" } else { "Low" }.into()),
            malicious: Some(i % 3 == 0),
            ..Default::default()
        })
        .collect()
    }

    fn snap(id: &str, n: usize, batches: u32, status: ExecutionStatus) -> Snapshot {
        Snapshot {
            found: true,
            execution_id: id.into(),
            status,
            batches_received: batches,
            all_results: records(0..n),
            total_results_count: Some(n),
            ..Default::default()
        }
    }

    fn engine() -> Reconciler {
        Reconciler::new("A", RunPlan::new(200, 50))
    }

    #[test]
    fn monotonic_growth_tracks_latest_length() {
        let mut r = engine();
        let mut last = 0;
        for (n, b) in [(0, 0), (50, 1), (50, 1), (100, 2), (150, 3), (200, 4)] {
            r.apply(&snap("A", n, b, ExecutionStatus::Processing));
            assert!(r.state().results.len() >= last);
            assert_eq!(r.state().results.len(), n);
            last = n;
        }
        assert_eq!(r.state().stats.total, 200);
        assert_eq!(r.anomaly_count(), 0);
    }

    #[test]
    fn repeated_snapshot_is_idempotent() {
        let mut r = engine();
        let s = Snapshot { start_time: Some("2026-01-01T00:00:00Z".into()), ..snap("A", 60, 2, ExecutionStatus::Processing) };
        assert!(r.apply(&s).changed);
        let before = r.state().clone();
        let out = r.apply(&s);
        assert!(!out.changed);
        assert_eq!(out.directive, Directive::Continue);
        assert_eq!(r.state(), &before);
        assert_eq!(serde_json::to_vec(r.state()).unwrap(), serde_json::to_vec(&before).unwrap());
    }

    #[test]
    fn completion_freezes_state() {
        let mut r = engine();
        r.apply(&snap("A", 100, 2, ExecutionStatus::Processing));
        let done = Snapshot {
            final_summary: Some(FinalSummary { total_items: 120, true_positives: 40, ..Default::default() }),
            completed_time: Some("2026-01-01T00:05:00Z".into()),
            ..snap("A", 120, 3, ExecutionStatus::Completed)
        };
        let out = r.apply(&done);
        assert!(out.changed);
        assert_eq!(out.directive, Directive::Stop(StopReason::Completed));
        assert_eq!(r.progress(), 100);
        let frozen = r.state().clone();

        let later = r.apply(&snap("A", 180, 4, ExecutionStatus::Processing));
        assert!(!later.changed);
        assert_eq!(later.directive, Directive::Stop(StopReason::Completed));
        assert_eq!(r.state(), &frozen);
        assert_eq!(r.state().final_summary.as_ref().map(|s| s.total_items), Some(120));
    }

    #[test]
    fn completion_without_summary_derives_one() {
        let mut r = engine();
        r.apply(&snap("A", 6, 1, ExecutionStatus::Completed));
        let s = r.state().final_summary.clone().unwrap();
        assert_eq!(s.total_items, 6);
        assert_eq!(s.true_positives, 2);
        assert_eq!(s.high, 3);
        assert!(r.state().completed_at.is_some());
    }

    #[test]
    fn not_found_stops() {
        let mut r = engine();
        let out = r.apply(&Snapshot::not_found("A"));
        assert!(out.changed);
        assert_eq!(out.directive, Directive::Stop(StopReason::NotFound));
        assert_eq!(r.state().status, ExecutionStatus::NotFound);
        assert!(!r.apply(&Snapshot::not_found("A")).changed);
    }

    #[test]
    fn not_found_keeps_collected_results() {
        let mut r = engine();
        r.apply(&snap("A", 30, 1, ExecutionStatus::Processing));
        r.apply(&Snapshot::not_found("A"));
        assert_eq!(r.state().results.len(), 30);
    }

    #[test]
    fn shrinking_snapshot_is_clamped_and_flagged() {
        let mut r = engine();
        r.apply(&snap("A", 100, 2, ExecutionStatus::Processing));
        let out = r.apply(&snap("A", 40, 2, ExecutionStatus::Processing));
        assert!(!out.changed);
        assert!(out.anomalies.contains(&Anomaly::ResultsShrank { stored: 100, received: 40 }));
        assert_eq!(r.state().results.len(), 100);
        assert_eq!(r.progress(), 50);
    }

    #[test]
    fn shrinking_completion_keeps_larger_collection() {
        let mut r = engine();
        r.apply(&snap("A", 100, 2, ExecutionStatus::Processing));
        let out = r.apply(&snap("A", 90, 2, ExecutionStatus::Completed));
        assert_eq!(out.directive, Directive::Stop(StopReason::Completed));
        assert_eq!(r.state().results.len(), 100);
    }

    #[test]
    fn foreign_execution_is_ignored() {
        let mut r = engine();
        r.apply(&snap("A", 10, 1, ExecutionStatus::Processing));
        let before = r.state().clone();
        let out = r.apply(&snap("B", 90, 3, ExecutionStatus::Completed));
        assert!(!out.changed);
        assert_eq!(out.directive, Directive::Continue);
        assert_eq!(r.state(), &before);
    }

    #[test]
    fn batch_anomalies() {
        let mut r = engine();
        r.apply(&snap("A", 50, 2, ExecutionStatus::Processing));
        let out = r.apply(&snap("A", 50, 1, ExecutionStatus::Processing));
        assert!(out.anomalies.contains(&Anomaly::BatchesRegressed { stored: 2, received: 1 }));
        assert_eq!(r.state().batches_received, 2);
        let out = r.apply(&snap("A", 60, 5, ExecutionStatus::Processing));
        assert!(out.anomalies.contains(&Anomaly::BatchesExceeded { received: 5, expected: 4 }));
        assert_eq!(r.progress(), 99);
    }

    #[test]
    fn rewritten_prefix_is_flagged_but_kept_by_length_rule() {
        let mut r = engine();
        r.apply(&snap("A", 3, 1, ExecutionStatus::Processing));
        let mut rewritten = snap("A", 3, 1, ExecutionStatus::Processing);
        rewritten.all_results[0].attack_type = Some("Intrusion".into());
        let out = r.apply(&rewritten);
        assert!(!out.changed);
        assert_eq!(out.anomalies, vec![Anomaly::ContentDrift { compared: 3 }]);
        assert_eq!(r.state().results[0].attack_type, None);
    }

    #[test]
    fn persisting_drift_is_reported_once() {
        let mut r = engine();
        r.apply(&snap("A", 3, 1, ExecutionStatus::Processing));
        let mut rewritten = snap("A", 3, 1, ExecutionStatus::Processing);
        rewritten.all_results[1].protocol = Some("UDP".into());
        assert_eq!(r.apply(&rewritten).anomalies.len(), 1);
        for _ in 0..5 {
            assert!(r.apply(&rewritten).anomalies.is_empty());
        }
        assert_eq!(r.anomaly_count(), 1);

        // drift clears, then a different rewrite shows up
        r.apply(&snap("A", 3, 1, ExecutionStatus::Processing));
        rewritten.all_results[2].protocol = Some("ICMP".into());
        assert_eq!(r.apply(&rewritten).anomalies, vec![Anomaly::ContentDrift { compared: 3 }]);
        assert_eq!(r.anomaly_count(), 2);
    }

    #[test]
    fn duplicate_identities_flagged_once() {
        let mut r = engine();
        let mut s = snap("A", 2, 1, ExecutionStatus::Processing);
        s.all_results.push(s.all_results[0].clone());
        s.total_results_count = Some(3);
        let out = r.apply(&s);
        assert!(out.changed);
        assert_eq!(out.anomalies, vec![Anomaly::DuplicateIdentity { key: RecordKey::Id("evt-0".into()) }]);
        assert_eq!(r.state().results.len(), 3);
    }

    #[test]
    fn count_mismatch_flagged_on_change_only() {
        let mut r = engine();
        let s = Snapshot { total_results_count: Some(12), ..snap("A", 10, 1, ExecutionStatus::Processing) };
        assert_eq!(r.apply(&s).anomalies, vec![Anomaly::CountMismatch { listed: 10, reported: 12 }]);
        assert!(r.apply(&s).anomalies.is_empty());
    }

    #[test]
    fn example_progress_scenario() {
        let mut r = Reconciler::new("A", RunPlan::new(200, 50));
        r.apply(&snap("A", 100, 2, ExecutionStatus::Processing));
        assert_eq!(r.progress(), 50);
        r.apply(&snap("A", 100, 2, ExecutionStatus::Completed));
        assert_eq!(r.progress(), 100);
    }
}
