use threatwatch_core::{ExecutionStatus, RunPlan};

/// Percentage shown while a run is in flight.
///
/// The workflow reports no progress of its own, so two estimators are combined: items
/// received against the item limit, and batches received against the expected batch
/// count. The larger wins because a short final batch would otherwise under-report. The
/// value never reaches 100 until the relay says the run is completed.
pub fn progress(results_received: usize, batches_received: u32, plan: &RunPlan, status: ExecutionStatus) -> u8 {
    if status == ExecutionStatus::Completed {
        return 100;
    }
    let items = ratio(results_received as f64, plan.expected_total);
    let batches = ratio(batches_received as f64, plan.expected_batches);
    (items.max(batches) * 100.0).floor().clamp(0.0, 99.0) as u8
}

fn ratio(received: f64, expected: u32) -> f64 {
    if expected == 0 { 0.0 } else { received / expected as f64 }
}
