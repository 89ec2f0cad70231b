//! The synchronous, in-process backend. Supports exactly one task type —
//! `demo_sleep` — used to exercise the queueing protocol without any
//! external system. Grounded on the reference worker's sleep-and-echo job.

use async_trait::async_trait;
use taskq_core::{BackendAdapter, ExecutionKind, Task};

pub const BACKEND_NAME: &str = "local";

pub struct LocalBackend;

#[async_trait]
impl BackendAdapter for LocalBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn supports(&self, task_type: &str) -> bool {
        task_type == "demo_sleep"
    }

    async fn execute(&self, task: &Task) -> anyhow::Result<ExecutionKind> {
        let result = run_demo_sleep(&task.payload).await;
        Ok(ExecutionKind::Synchronous(result))
    }
}

async fn run_demo_sleep(payload: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
    let sleep_s = parse_sleep_seconds(payload)?;
    tokio::time::sleep(std::time::Duration::from_secs(sleep_s)).await;

    Ok(serde_json::json!({
        "ok": true,
        "task_type": "demo_sleep",
        "slept": sleep_s,
        "echo": payload,
    }))
}

fn parse_sleep_seconds(payload: &serde_json::Value) -> anyhow::Result<u64> {
    let raw = payload.get("sleep_s").unwrap_or(&serde_json::Value::Null);
    let sleep_s = raw
        .as_i64()
        .ok_or_else(|| anyhow::anyhow!("payload.sleep_s must be an integer, got: {raw}"))?;

    if !(0..=3600).contains(&sleep_s) {
        anyhow::bail!("payload.sleep_s out of range (0..=3600): {sleep_s}");
    }

    Ok(sleep_s as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskq_core::TaskStatus;
    use uuid::Uuid;

    fn task_with_payload(payload: serde_json::Value) -> Task {
        let now = chrono::Utc::now();
        Task {
            id: Uuid::new_v4(),
            task_type: "demo_sleep".to_string(),
            status: TaskStatus::Leased,
            n: 1,
            priority: 0,
            attempts: 1,
            max_attempts: 3,
            target_backend: Some("local".to_string()),
            backend: None,
            backend_job_id: None,
            leased_by: Some("host:uuid".to_string()),
            leased_at: Some(now),
            lease_expires_at: Some(now),
            last_heartbeat_at: Some(now),
            payload,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            worker_meta: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            run_id: None,
        }
    }

    #[test]
    fn supports_only_demo_sleep() {
        let backend = LocalBackend;
        assert!(backend.supports("demo_sleep"));
        assert!(!backend.supports("search_mols"));
    }

    #[tokio::test]
    async fn execute_echoes_payload_and_slept_seconds() {
        let backend = LocalBackend;
        let task = task_with_payload(serde_json::json!({"sleep_s": 0, "note": "hi"}));

        match backend.execute(&task).await.unwrap() {
            ExecutionKind::Synchronous(Ok(value)) => {
                assert_eq!(value["ok"], true);
                assert_eq!(value["slept"], 0);
                assert_eq!(value["echo"]["note"], "hi");
            }
            other => panic!("expected a synchronous ok result: {}", describe(other)),
        }
    }

    #[tokio::test]
    async fn execute_rejects_out_of_range_sleep() {
        let backend = LocalBackend;
        let task = task_with_payload(serde_json::json!({"sleep_s": 999_999}));

        match backend.execute(&task).await.unwrap() {
            ExecutionKind::Synchronous(Err(_)) => {}
            other => panic!("expected a synchronous error: {}", describe(other)),
        }
    }

    fn describe(kind: ExecutionKind) -> &'static str {
        match kind {
            ExecutionKind::Synchronous(_) => "synchronous",
            ExecutionKind::Detached(_) => "detached",
        }
    }
}
