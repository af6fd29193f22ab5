//! In-memory accumulation of workflow pushes, keyed by execution id.
//!
//! Results are only ever appended. A batch the workflow redelivers (same `batch_number`)
//! is acknowledged and dropped, and a record whose `unique_id` is already stored for the
//! execution is skipped, so at-least-once delivery upstream does not inflate counts.

use crate::error::{RelayError, RelayResult};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use threatwatch_core::{
    now_rfc3339, BatchEvent, CompletionEvent, ExecutionEntry, FinalSummary, IngestAck, Snapshot, StartRequest, StatusList,
    ThreatRecord,
};

struct Execution {
    execution_id: String,
    workflow_id: Option<String>,
    config: Option<StartRequest>,
    start_time: String,
    last_activity: Instant,
    seq: u64,
    completed_time: Option<String>,
    batches_received: u32,
    seen_batches: HashSet<u32>,
    seen_ids: HashSet<String>,
    results: Vec<ThreatRecord>,
    final_summary: Option<FinalSummary>,
}

impl Execution {
    fn new(execution_id: String, seq: u64, now: Instant) -> Execution {
        Execution {
            execution_id,
            workflow_id: None,
            config: None,
            start_time: now_rfc3339(),
            last_activity: now,
            seq,
            completed_time: None,
            batches_received: 0,
            seen_batches: HashSet::new(),
            seen_ids: HashSet::new(),
            results: Vec::new(),
            final_summary: None,
        }
    }

    fn entry(&self) -> ExecutionEntry {
        ExecutionEntry {
            execution_id: self.execution_id.clone(),
            start_time: self.start_time.clone(),
            completed_time: self.completed_time.clone(),
            batches_received: self.batches_received,
            final_summary: self.final_summary.clone(),
            all_results: self.results.clone(),
            total_results_count: self.results.len(),
        }
    }

    fn ack(&self, accepted: usize, skipped: usize, duplicate_batch: bool) -> IngestAck {
        IngestAck {
            execution_id: self.execution_id.clone(),
            accepted,
            skipped,
            duplicate_batch,
            batches_received: self.batches_received,
            total_results: self.results.len(),
        }
    }
}

#[derive(Default)]
struct Inner {
    executions: HashMap<String, Execution>,
    next_seq: u64,
}

impl Inner {
    fn upsert(&mut self, execution_id: &str) -> &mut Execution {
        let seq = self.next_seq;
        let exec = self.executions.entry(execution_id.to_string()).or_insert_with(|| {
            tracing::info!(execution_id, "tracking new execution");
            Execution::new(execution_id.to_string(), seq, Instant::now())
        });
        if exec.seq == seq {
            self.next_seq += 1;
        }
        exec.last_activity = Instant::now();
        exec
    }
}

pub struct Store {
    inner: RwLock<Inner>,
    retention: Duration,
}

impl Store {
    pub fn new(retention: Duration) -> Self {
        Store { inner: RwLock::new(Inner::default()), retention }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn len(&self) -> usize {
        self.inner.read().executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make an execution known before its first batch so early status queries find it.
    pub fn register(&self, execution_id: &str, workflow_id: Option<String>, config: Option<StartRequest>) {
        let mut inner = self.inner.write();
        let exec = inner.upsert(execution_id);
        if workflow_id.is_some() {
            exec.workflow_id = workflow_id;
        }
        if config.is_some() {
            exec.config = config;
        }
    }

    pub fn ingest_batch(&self, ev: BatchEvent) -> RelayResult<IngestAck> {
        let execution_id = require_id(&ev.execution_id)?;
        let mut inner = self.inner.write();
        let exec = inner.upsert(execution_id);

        if exec.completed_time.is_some() {
            tracing::warn!(execution_id, batch = ?ev.batch_number, "batch after completion ignored");
            return Ok(exec.ack(0, ev.results.len(), false));
        }
        if let Some(n) = ev.batch_number {
            if !exec.seen_batches.insert(n) {
                tracing::debug!(execution_id, batch = n, "redelivered batch dropped");
                return Ok(exec.ack(0, ev.results.len(), true));
            }
        }

        let mut accepted = 0;
        let mut skipped = 0;
        for record in ev.results {
            if let Some(id) = &record.unique_id {
                if !exec.seen_ids.insert(id.clone()) {
                    skipped += 1;
                    continue;
                }
            }
            exec.results.push(record);
            accepted += 1;
        }
        exec.batches_received += 1;
        tracing::debug!(execution_id, accepted, skipped, batches = exec.batches_received, "batch stored");
        Ok(exec.ack(accepted, skipped, false))
    }

    pub fn complete(&self, ev: CompletionEvent) -> RelayResult<IngestAck> {
        let execution_id = require_id(&ev.execution_id)?;
        let mut inner = self.inner.write();
        let exec = inner.upsert(execution_id);
        if exec.completed_time.is_none() {
            exec.final_summary = Some(ev.final_summary.unwrap_or_else(|| FinalSummary::from_records(&exec.results)));
            exec.completed_time = Some(now_rfc3339());
            tracing::info!(execution_id, results = exec.results.len(), batches = exec.batches_received, "execution completed");
        }
        Ok(exec.ack(0, 0, false))
    }

    pub fn snapshot(&self, execution_id: &str) -> Snapshot {
        match self.inner.read().executions.get(execution_id) {
            Some(exec) => exec.entry().to_snapshot(),
            None => Snapshot::not_found(execution_id),
        }
    }

    /// All tracked executions, oldest first.
    pub fn list(&self) -> StatusList {
        let inner = self.inner.read();
        let mut execs: Vec<&Execution> = inner.executions.values().collect();
        execs.sort_by_key(|e| e.seq);
        StatusList { executions: execs.into_iter().map(Execution::entry).collect() }
    }

    pub fn config_of(&self, execution_id: &str) -> Option<StartRequest> {
        self.inner.read().executions.get(execution_id).and_then(|e| e.config.clone())
    }

    pub fn workflow_of(&self, execution_id: &str) -> Option<String> {
        self.inner.read().executions.get(execution_id).and_then(|e| e.workflow_id.clone())
    }

    pub fn remove(&self, execution_id: &str) -> bool {
        self.inner.write().executions.remove(execution_id).is_some()
    }

    /// Drop executions that have seen no register, batch or completion within the
    /// retention window, so a run that keeps receiving batches stays.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut inner = self.inner.write();
        let before = inner.executions.len();
        let retention = self.retention;
        inner.executions.retain(|_, e| now.saturating_duration_since(e.last_activity) < retention);
        let evicted = before - inner.executions.len();
        if evicted > 0 {
            tracing::info!(evicted, "expired executions evicted");
        }
        evicted
    }
}

fn require_id(id: &str) -> RelayResult<&str> {
    let id = id.trim();
    if id.is_empty() {
        return Err(RelayError::BadRequest("execution_id is required".into()));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use threatwatch_core::ExecutionStatus;

    fn rec(id: Option<&str>) -> ThreatRecord {
        ThreatRecord { unique_id: id.map(str::to_string), severity_level: Some("High".into()), malicious: Some(true), ..Default::default() }
    }

    fn batch(n: Option<u32>, ids: &[Option<&str>]) -> BatchEvent {
        BatchEvent { execution_id: "A".into(), batch_number: n, results: ids.iter().map(|i| rec(*i)).collect() }
    }

    fn store() -> Store {
        Store::new(Duration::from_secs(3600))
    }

    #[test]
    fn batches_append_in_arrival_order() {
        let s = store();
        s.ingest_batch(batch(Some(1), &[Some("a"), Some("b")])).unwrap();
        let ack = s.ingest_batch(batch(Some(2), &[Some("c"), None, None])).unwrap();
        assert_eq!((ack.accepted, ack.batches_received, ack.total_results), (3, 2, 5));
        let snap = s.snapshot("A");
        assert!(snap.found);
        assert_eq!(snap.status, ExecutionStatus::Processing);
        let ids: Vec<_> = snap.all_results.iter().map(|r| r.unique_id.clone()).collect();
        assert_eq!(ids, vec![Some("a".into()), Some("b".into()), Some("c".into()), None, None]);
        assert_eq!(snap.total_results_count, Some(5));
    }

    #[test]
    fn redelivered_batch_is_dropped() {
        let s = store();
        s.ingest_batch(batch(Some(1), &[Some("a"), Some("b")])).unwrap();
        let ack = s.ingest_batch(batch(Some(1), &[Some("a"), Some("b")])).unwrap();
        assert!(ack.duplicate_batch);
        assert_eq!((ack.accepted, ack.skipped, ack.batches_received, ack.total_results), (0, 2, 1, 2));
    }

    #[test]
    fn repeated_identities_are_skipped() {
        let s = store();
        s.ingest_batch(batch(None, &[Some("a")])).unwrap();
        let ack = s.ingest_batch(batch(None, &[Some("a"), Some("z")])).unwrap();
        assert_eq!((ack.accepted, ack.skipped), (1, 1));
        assert_eq!(s.snapshot("A").all_results.len(), 2);
    }

    #[test]
    fn completion_derives_summary_and_freezes() {
        let s = store();
        s.ingest_batch(batch(Some(1), &[Some("a"), Some("b")])).unwrap();
        s.complete(CompletionEvent { execution_id: "A".into(), final_summary: None }).unwrap();
        let snap = s.snapshot("A");
        assert_eq!(snap.status, ExecutionStatus::Completed);
        let summary = snap.final_summary.unwrap();
        assert_eq!((summary.total_items, summary.true_positives, summary.high), (2, 2, 2));

        let ack = s.ingest_batch(batch(Some(2), &[Some("c")])).unwrap();
        assert_eq!(ack.accepted, 0);
        assert_eq!(s.snapshot("A").all_results.len(), 2);

        let given = FinalSummary { total_items: 99, ..Default::default() };
        s.complete(CompletionEvent { execution_id: "A".into(), final_summary: Some(given) }).unwrap();
        assert_eq!(s.snapshot("A").final_summary.unwrap().total_items, 2);
    }

    #[test]
    fn unknown_and_blank_ids() {
        let s = store();
        assert!(!s.snapshot("nope").found);
        let err = s.ingest_batch(BatchEvent { execution_id: "  ".into(), ..Default::default() });
        assert!(matches!(err, Err(RelayError::BadRequest(_))));
        assert!(s.is_empty());
    }

    #[test]
    fn register_makes_execution_visible_before_first_batch() {
        let s = store();
        s.register("B", Some("wf-1".into()), None);
        s.register("A", None, None);
        s.register("B", None, None);
        let snap = s.snapshot("B");
        assert!(snap.found);
        assert_eq!(snap.batches_received, 0);
        assert_eq!(s.workflow_of("B").as_deref(), Some("wf-1"));
        let order: Vec<_> = s.list().executions.into_iter().map(|e| e.execution_id).collect();
        assert_eq!(order, vec!["B", "A"]);
    }

    #[test]
    fn retention_evicts_old_executions() {
        let s = Store::new(Duration::from_secs(60));
        s.register("A", None, None);
        assert_eq!(s.evict_expired(Instant::now()), 0);
        assert_eq!(s.evict_expired(Instant::now() + Duration::from_secs(61)), 1);
        assert!(!s.snapshot("A").found);
        assert!(!s.remove("A"));
    }

    #[test]
    fn retention_counts_from_last_activity() {
        let s = Store::new(Duration::from_secs(60));
        s.register("live", None, None);
        s.register("idle", None, None);
        for exec in s.inner.write().executions.values_mut() {
            exec.last_activity = exec.last_activity.checked_sub(Duration::from_secs(61)).unwrap();
        }
        s.ingest_batch(BatchEvent { execution_id: "live".into(), batch_number: Some(1), results: vec![rec(Some("a"))] }).unwrap();

        assert_eq!(s.evict_expired(Instant::now()), 1);
        assert!(s.snapshot("live").found);
        assert!(!s.snapshot("idle").found);
    }
}
