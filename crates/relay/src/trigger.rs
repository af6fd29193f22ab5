//! Forwards start requests to the workflow engine's webhook.

use crate::error::{RelayError, RelayResult};
use serde_json::{json, Value};
use std::time::Duration;
use threatwatch_core::StartRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triggered {
    pub execution_id: String,
    pub workflow_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkflowTrigger {
    http: reqwest::Client,
    url: Option<String>,
    callback: Option<String>,
}

impl WorkflowTrigger {
    /// With no `url` every start is registered locally only.
    pub fn new(url: Option<String>, callback: Option<String>, timeout: Duration) -> RelayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("threatwatch-relay/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(WorkflowTrigger { http, url: url.filter(|u| !u.trim().is_empty()), callback })
    }

    pub fn is_dry(&self) -> bool {
        self.url.is_none()
    }

    /// `proposed_id` is sent along so the workflow can echo it on its pushes; an id the
    /// engine returns takes precedence.
    pub async fn fire(&self, proposed_id: &str, req: &StartRequest) -> RelayResult<Triggered> {
        let Some(url) = &self.url else {
            tracing::info!(execution_id = proposed_id, "dry start, no workflow configured");
            return Ok(Triggered { execution_id: proposed_id.to_string(), workflow_id: None });
        };

        let payload = json!({
            "execution_id": proposed_id,
            "source_path": req.source_path,
            "batch_size": req.batch_size,
            "item_limit": req.item_limit,
            "callback_target": req.callback_target.as_ref().or(self.callback.as_ref()),
        });
        let resp = self.http.post(url).json(&payload).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            let snippet: String = body.trim().chars().take(200).collect();
            return Err(RelayError::Upstream(format!("{} {}", status.as_u16(), snippet)));
        }

        let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
        let triggered = Triggered {
            execution_id: pick(&parsed, &["execution_id", "executionId"]).unwrap_or_else(|| proposed_id.to_string()),
            workflow_id: pick(&parsed, &["workflow_id", "workflowId"]),
        };
        tracing::info!(execution_id = %triggered.execution_id, workflow = ?triggered.workflow_id, "workflow started");
        Ok(triggered)
    }
}

/// First non-empty string or number among `keys`.
fn pick(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match v.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_ids_in_either_casing() {
        assert_eq!(pick(&json!({"executionId": 4711}), &["execution_id", "executionId"]), Some("4711".into()));
        assert_eq!(pick(&json!({"execution_id": " run-1 "}), &["execution_id", "executionId"]), Some("run-1".into()));
        assert_eq!(pick(&json!({"execution_id": ""}), &["execution_id"]), None);
        assert_eq!(pick(&Value::Null, &["execution_id"]), None);
    }

    #[tokio::test]
    async fn dry_mode_keeps_proposed_id() {
        let t = WorkflowTrigger::new(Some("  ".into()), None, Duration::from_secs(1)).unwrap();
        assert!(t.is_dry());
        let req = StartRequest { source_path: "cyber.csv".into(), callback_target: None, batch_size: 10, item_limit: 20 };
        let out = t.fire("abc", &req).await.unwrap();
        assert_eq!(out, Triggered { execution_id: "abc".into(), workflow_id: None });
    }
}
