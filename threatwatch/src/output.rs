use anyhow::Result;
use reconcile::ExecutionState;
use serde_json::json;
use std::io::Write;
use threatwatch_core::{Column, ExecutionEntry, FinalSummary, ThreatRecord};

pub fn write_csv<W: Write>(w: W, records: &[ThreatRecord]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(w);
    wtr.write_record(Column::ALL.iter().map(|c| c.header()))?;
    for r in records {
        wtr.write_record(Column::ALL.iter().map(|c| r.render(*c)))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_jsonl<W: Write>(mut w: W, records: &[ThreatRecord]) -> Result<()> {
    for r in records {
        serde_json::to_writer(&mut w, r)?;
        w.write_all(b"\n")?;
    }
    w.flush()?;
    Ok(())
}

pub fn progress_line(progress: u8, state: &ExecutionState, error: Option<&str>) -> String {
    let mut line = format!(
        "[{:>3}%] {}: {} results, {} batches, {}",
        progress,
        state.execution_id,
        state.results.len(),
        state.batches_received,
        state.status.as_str()
    );
    if let Some(e) = error {
        line.push_str(&format!(" (error: {})", e));
    }
    line
}

pub fn progress_json(progress: u8, state: &ExecutionState, error: Option<&str>) -> serde_json::Value {
    json!({
        "execution_id": state.execution_id,
        "status": state.status,
        "progress": progress,
        "results": state.results.len(),
        "batches_received": state.batches_received,
        "error": error,
    })
}

pub fn summary_text(state: &ExecutionState) -> String {
    let mut out = String::new();
    let stats = &state.stats;
    out.push_str(&format!("execution {} {}\n", state.execution_id, state.status.as_str()));
    if let Some(s) = &state.final_summary {
        out.push_str(&summary_counts(s));
    }
    out.push_str(&format!(
        "classified: {} malicious, {} benign, {} unclassified; {} high risk",
        stats.malicious, stats.benign, stats.unclassified, stats.high_risk
    ));
    if let Some(mean) = stats.mean_risk_score {
        out.push_str(&format!(", mean risk {:.1}", mean));
    }
    out.push('\n');
    if let Some(top) = top_entry(&stats.by_attack_type) {
        out.push_str(&format!("top attack type: {} ({})\n", top.0, top.1));
    }
    let geo = stats.geo.top(3);
    if !geo.is_empty() {
        let list = geo.iter().map(|(city, n)| format!("{} ({})", city, n)).collect::<Vec<_>>().join(", ");
        out.push_str(&format!("top locations: {}\n", list));
    }
    out
}

fn summary_counts(s: &FinalSummary) -> String {
    format!(
        "total {}: {} true positives, {} false positives; critical {}, high {}, medium {}, low {}\n",
        s.total_items, s.true_positives, s.false_positives, s.critical, s.high, s.medium, s.low
    )
}

fn top_entry(counts: &std::collections::BTreeMap<String, usize>) -> Option<(&str, usize)> {
    counts.iter().max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0))).map(|(k, v)| (k.as_str(), *v))
}

pub fn entry_line(e: &ExecutionEntry) -> String {
    format!(
        "{}  {:<10} {:>3} batches {:>6} results  started {}",
        e.execution_id,
        e.status().as_str(),
        e.batches_received,
        e.total_results_count,
        e.start_time
    )
}
