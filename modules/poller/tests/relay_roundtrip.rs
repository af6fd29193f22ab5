use poller::{Controller, PollerConfig, NOT_FOUND_MESSAGE};
use relay::{AppState, RelayConfig};
use relay_client::RelayClient;
use std::time::Duration;
use threatwatch_core::{BatchEvent, CompletionEvent, ExecutionStatus, RunPlan, StartRequest, ThreatRecord};
use tokio::net::TcpListener;

async fn spawn_relay() -> (AppState, String) {
    let state = AppState::new(&RelayConfig::default()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = state.clone();
    tokio::spawn(async move { relay::serve_on(listener, served, std::future::pending()).await });
    (state, format!("http://{}", addr))
}

fn config() -> PollerConfig {
    PollerConfig { interval: Duration::from_millis(20), request_timeout: Duration::from_secs(2), ..PollerConfig::default() }
}

fn batch(execution_id: &str, n: u32, ids: std::ops::Range<u32>) -> BatchEvent {
    BatchEvent {
        execution_id: execution_id.into(),
        batch_number: Some(n),
        results: ids
            .map(|i| ThreatRecord {
                unique_id: Some(format!("evt-{}", i)),
                severity_level: Some(if i % 2 == 0 { "Critical" } else { "Low" }.into()),
                malicious: Some(i % 2 == 0),
                ..Default::default()
            })
            .collect(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_is_tracked_to_completion_through_the_relay() {
    let (relay, url) = spawn_relay().await;
    let client = RelayClient::new(&url, Duration::from_secs(2)).unwrap();
    let controller = Controller::new(client, config());

    let req = StartRequest { source_path: "cyber_attacks.csv".into(), callback_target: None, batch_size: 2, item_limit: 4 };
    let started = controller.start(req).await.unwrap();
    let id = started.execution_id;
    assert!(controller.is_polling());

    relay.store.ingest_batch(batch(&id, 1, 0..2)).unwrap();
    // redelivery of the same batch must not double the results
    relay.store.ingest_batch(batch(&id, 1, 0..2)).unwrap();
    relay.store.ingest_batch(batch(&id, 2, 2..4)).unwrap();
    relay.store.complete(CompletionEvent { execution_id: id.clone(), final_summary: None }).unwrap();

    let view = tokio::time::timeout(Duration::from_secs(10), controller.wait_until_idle()).await.unwrap();
    assert_eq!(view.execution_id.as_deref(), Some(id.as_str()));
    assert_eq!(view.progress, 100);
    assert!(view.error.is_none());
    let state = view.state.unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.results.len(), 4);
    assert_eq!(state.batches_received, 2);
    let summary = state.final_summary.unwrap();
    assert_eq!((summary.total_items, summary.true_positives, summary.critical), (4, 2, 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_execution_stops_with_not_found() {
    let (_relay, url) = spawn_relay().await;
    let client = RelayClient::new(&url, Duration::from_secs(2)).unwrap();
    let controller = Controller::new(client, config());

    controller.attach("never-started", RunPlan::new(10, 5));
    let view = tokio::time::timeout(Duration::from_secs(10), controller.wait_until_idle()).await.unwrap();
    assert!(!view.polling);
    assert_eq!(view.error.as_deref(), Some(NOT_FOUND_MESSAGE));
}
