use crate::error::{RelayError, RelayResult};
use crate::server::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::time::Instant;
use threatwatch_core::{
    now_rfc3339, BatchEvent, CompletionEvent, ExecutionStatus, HealthResponse, IngestAck, Snapshot, StartRequest,
    StartResponse, StatusList,
};
use uuid::Uuid;

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    state.store.evict_expired(Instant::now());
    Json(HealthResponse { status: "running".into(), timestamp: now_rfc3339(), executions: state.store.len() })
}

pub async fn start(State(state): State<AppState>, Json(req): Json<StartRequest>) -> RelayResult<Json<StartResponse>> {
    req.validate()?;
    let proposed = Uuid::now_v7().to_string();
    let triggered = state.trigger.fire(&proposed, &req).await?;
    state.store.register(&triggered.execution_id, triggered.workflow_id.clone(), Some(req.clone()));
    Ok(Json(StartResponse {
        execution_id: triggered.execution_id,
        workflow_id: triggered.workflow_id,
        status: ExecutionStatus::Processing,
        config: req,
    }))
}

pub async fn batch(State(state): State<AppState>, Json(ev): Json<BatchEvent>) -> RelayResult<Json<IngestAck>> {
    Ok(Json(state.store.ingest_batch(ev)?))
}

pub async fn complete(State(state): State<AppState>, Json(ev): Json<CompletionEvent>) -> RelayResult<Json<IngestAck>> {
    Ok(Json(state.store.complete(ev)?))
}

pub async fn list(State(state): State<AppState>) -> Json<StatusList> {
    state.store.evict_expired(Instant::now());
    Json(state.store.list())
}

/// Unknown ids answer 200 with `found: false`; pollers treat that as terminal.
pub async fn status(State(state): State<AppState>, Path(id): Path<String>) -> Json<Snapshot> {
    state.store.evict_expired(Instant::now());
    Json(state.store.snapshot(&id))
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> RelayResult<StatusCode> {
    if state.store.remove(&id) {
        tracing::info!(execution_id = %id, "execution dropped");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RelayError::NotFound(format!("execution {} not found", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::RelayConfig;
    use axum::{response::IntoResponse, routing::post, Router};
    use serde_json::{json, Value};
    use threatwatch_core::ThreatRecord;

    fn test_state() -> AppState {
        AppState::new(&RelayConfig::default()).unwrap()
    }

    fn start_req() -> StartRequest {
        StartRequest { source_path: "data/cyber.csv".into(), callback_target: None, batch_size: 50, item_limit: 200 }
    }

    #[tokio::test]
    async fn health_reports_running() {
        let state = test_state();
        let Json(body) = health(State(state)).await;
        assert!(body.is_running());
        assert_eq!(body.executions, 0);
    }

    #[tokio::test]
    async fn dry_start_registers_execution() {
        let state = test_state();
        let Json(resp) = start(State(state.clone()), Json(start_req())).await.unwrap();
        assert_eq!(resp.status, ExecutionStatus::Processing);
        assert_eq!(resp.config.item_limit, 200);
        let Json(snap) = status(State(state.clone()), Path(resp.execution_id.clone())).await;
        assert!(snap.found);
        assert_eq!(snap.batches_received, 0);
        assert_eq!(state.store.config_of(&resp.execution_id), Some(start_req()));
    }

    #[tokio::test]
    async fn start_rejects_invalid_request() {
        let state = test_state();
        let req = StartRequest { batch_size: 0, ..start_req() };
        let err = start(State(state.clone()), Json(req)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        assert!(state.store.is_empty());
    }

    #[tokio::test]
    async fn start_takes_id_from_workflow_response() {
        let hook = Router::new().route(
            "/webhook/start",
            post(|Json(body): Json<Value>| async move {
                assert!(body["execution_id"].is_string());
                Json(json!({"executionId": "n8n-42", "workflowId": "wf-7"}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, hook).await });

        let config = RelayConfig { workflow_url: Some(format!("http://{}/webhook/start", addr)), ..RelayConfig::default() };
        let state = AppState::new(&config).unwrap();
        let Json(resp) = start(State(state.clone()), Json(start_req())).await.unwrap();
        assert_eq!(resp.execution_id, "n8n-42");
        assert_eq!(resp.workflow_id.as_deref(), Some("wf-7"));
        assert!(state.store.snapshot("n8n-42").found);
    }

    #[tokio::test]
    async fn failing_workflow_is_bad_gateway() {
        let config = RelayConfig { workflow_url: Some("http://127.0.0.1:9/none".into()), ..RelayConfig::default() };
        let state = AppState::new(&config).unwrap();
        let err = start(State(state.clone()), Json(start_req())).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
        assert!(state.store.is_empty());
    }

    #[tokio::test]
    async fn webhooks_feed_status() {
        let state = test_state();
        let ev = BatchEvent {
            execution_id: "run-1".into(),
            batch_number: Some(1),
            results: vec![ThreatRecord { unique_id: Some("t1".into()), ..Default::default() }],
        };
        let Json(ack) = batch(State(state.clone()), Json(ev)).await.unwrap();
        assert_eq!((ack.accepted, ack.batches_received), (1, 1));
        complete(State(state.clone()), Json(CompletionEvent { execution_id: "run-1".into(), final_summary: None }))
            .await
            .unwrap();

        let Json(list) = list(State(state.clone())).await;
        assert_eq!(list.executions.len(), 1);
        let Json(snap) = status(State(state), Path("run-1".into())).await;
        assert_eq!(snap.status, ExecutionStatus::Completed);
        assert_eq!(snap.final_summary.unwrap().total_items, 1);
    }

    #[tokio::test]
    async fn unknown_status_is_not_found_snapshot() {
        let Json(snap) = status(State(test_state()), Path("ghost".into())).await;
        assert!(!snap.found);
        assert_eq!(snap.status, ExecutionStatus::NotFound);
    }

    #[tokio::test]
    async fn remove_known_and_unknown() {
        let state = test_state();
        state.store.register("run-1", None, None);
        assert_eq!(remove(State(state.clone()), Path("run-1".into())).await.unwrap(), StatusCode::NO_CONTENT);
        let err = remove(State(state), Path("run-1".into())).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
