//! The orchestrator loop: lease, dispatch to a backend, reconcile outcome,
//! repeat. Generic over `TaskStore` so it can be driven against
//! `taskq_core::testing::InMemoryTaskStore` in tests and `PgTaskStore` in
//! production, without duplicating the state machine.

use std::sync::Arc;
use std::time::Duration;

use taskq_core::{BackendAdapter, ExecutionKind, JobState, Task, TaskStore};
use tracing::{info, warn};

/// Everything the loop needs to know about how long to wait between things,
/// unified across both backend kinds rather than split per backend.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    pub lease_seconds: i64,
    pub poll_interval: Duration,
    pub job_poll_interval: Duration,
    pub finished_grace: Duration,
    pub idle_exit: Option<Duration>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 120,
            poll_interval: Duration::from_secs(1),
            job_poll_interval: Duration::from_secs(2),
            finished_grace: Duration::from_secs(20),
            idle_exit: None,
        }
    }
}

/// Run the outer lease loop until `idle_exit` elapses with nothing leased
/// (demo mode), or forever (`idle_exit: None`, real mode).
pub async fn run<S: TaskStore + ?Sized>(
    store: &S,
    backend: &(dyn BackendAdapter),
    leased_by: &str,
    target_backend: Option<&str>,
    config: LoopConfig,
) -> anyhow::Result<()> {
    let mut idle_since: Option<std::time::Instant> = None;

    loop {
        let task = store
            .lease_one(leased_by, config.lease_seconds, target_backend)
            .await?;

        let Some(task) = task else {
            if let Some(idle_exit) = config.idle_exit {
                let since = *idle_since.get_or_insert_with(std::time::Instant::now);
                if since.elapsed() >= idle_exit {
                    info!(idle_exit_seconds = idle_exit.as_secs(), "idle, exiting (demo mode)");
                    return Ok(());
                }
            }
            tokio::time::sleep(config.poll_interval).await;
            continue;
        };

        idle_since = None;
        execute_one(store, backend, leased_by, task, &config).await;
    }
}

/// Drive a single leased task to a terminal (or requeued) outcome. Errors
/// from the store itself propagate nowhere further up than a log line — a
/// transient store error just means the lease expires and the janitor or a
/// future `lease_one` recovers the row.
async fn execute_one<S: TaskStore + ?Sized>(
    store: &S,
    backend: &(dyn BackendAdapter),
    leased_by: &str,
    task: Task,
    config: &LoopConfig,
) {
    let task_id = task.id;

    if !backend.supports(&task.task_type) {
        warn!(%task_id, task_type = %task.task_type, backend = backend.name(), "unsupported task_type, releasing");
        if let Err(e) = store
            .mark_failed(
                task_id,
                leased_by,
                &format!(
                    "task_type '{}' is not supported by backend '{}'",
                    task.task_type,
                    backend.name()
                ),
                true,
            )
            .await
        {
            warn!(%task_id, error = %e, "failed to release unsupported task");
        }
        return;
    }

    if let Err(e) = run_on_backend(store, backend, leased_by, &task, config).await {
        warn!(%task_id, error = %e, "orchestrator loop iteration failed");
    }
}

async fn run_on_backend<S: TaskStore + ?Sized>(
    store: &S,
    backend: &(dyn BackendAdapter),
    leased_by: &str,
    task: &Task,
    config: &LoopConfig,
) -> anyhow::Result<()> {
    let task_id = task.id;

    if !store
        .mark_running(task_id, leased_by, backend.name(), "")
        .await?
    {
        warn!(%task_id, "lost lease before mark_running, abandoning");
        return Ok(());
    }
    store
        .heartbeat(
            task_id,
            leased_by,
            config.lease_seconds,
            serde_json::json!({"stage": "executing"}),
        )
        .await?;

    match backend.execute(task).await {
        Ok(ExecutionKind::Synchronous(result)) => {
            finalize_synchronous(store, leased_by, task, result).await
        }
        Ok(ExecutionKind::Detached(handle)) => {
            if !store
                .mark_running(task_id, leased_by, backend.name(), &handle.external_handle)
                .await?
            {
                warn!(%task_id, "lost lease after submission, abandoning reconciliation");
                return Ok(());
            }
            store
                .heartbeat(
                    task_id,
                    leased_by,
                    config.lease_seconds,
                    serde_json::json!({"stage": "submitted", "external_handle": handle.external_handle}),
                )
                .await?;
            reconcile_detached(store, leased_by, task, handle, config).await
        }
        Err(e) => {
            let retry = !task.retry_budget_exhausted();
            let updated = store
                .mark_failed(task_id, leased_by, &format!("{e:#}"), retry)
                .await?;
            if updated {
                info!(%task_id, retry, "submission/execution failed");
            }
            Ok(())
        }
    }
}

async fn finalize_synchronous<S: TaskStore + ?Sized>(
    store: &S,
    leased_by: &str,
    task: &Task,
    result: anyhow::Result<serde_json::Value>,
) -> anyhow::Result<()> {
    let task_id = task.id;
    match result {
        Ok(value) => {
            store.mark_done(task_id, leased_by, value).await?;
            info!(%task_id, "done");
        }
        Err(e) => {
            let retry = !task.retry_budget_exhausted();
            store
                .mark_failed(task_id, leased_by, &format!("{e:#}"), retry)
                .await?;
            info!(%task_id, retry, "failed");
        }
    }
    Ok(())
}

/// The reconciliation loop for a detached submission: poll the store and the
/// external job state until the row reaches a terminal status, returns to
/// queued, or the callback never arrives within `finished_grace`.
async fn reconcile_detached<S: TaskStore + ?Sized>(
    store: &S,
    leased_by: &str,
    task: &Task,
    handle: taskq_core::DetachedHandle,
    config: &LoopConfig,
) -> anyhow::Result<()> {
    let task_id = task.id;
    let poll = Arc::new(handle.poll);
    let mut finished_since: Option<std::time::Instant> = None;

    loop {
        let Some(current) = store.get(task_id).await? else {
            info!(%task_id, "row disappeared during reconciliation");
            return Ok(());
        };

        if current.status.is_terminal() {
            info!(%task_id, status = current.status.as_str(), "finished via store");
            return Ok(());
        }
        if current.status == taskq_core::TaskStatus::Queued {
            info!(%task_id, "returned to queued, stop waiting");
            return Ok(());
        }

        let state = {
            let poll = Arc::clone(&poll);
            tokio::task::spawn_blocking(move || poll()).await?
        };

        store
            .heartbeat(
                task_id,
                leased_by,
                config.lease_seconds,
                serde_json::json!({"stage": "waiting", "job_state": job_state_label(state)}),
            )
            .await?;

        if state == JobState::Finished {
            let since = *finished_since.get_or_insert_with(std::time::Instant::now);
            if since.elapsed() >= config.finished_grace {
                let err = format!(
                    "external job finished but no callback updated the store; \
                     check RESULT_BASE_URL/RESULT_SECRET are reachable from the job. \
                     external_handle={}",
                    handle.external_handle
                );
                store.mark_failed(task_id, leased_by, &err, false).await?;
                warn!(%task_id, "failed: no callback arrived after job finished");
                return Ok(());
            }
        } else {
            finished_since = None;
        }

        tokio::time::sleep(config.job_poll_interval).await;
    }
}

fn job_state_label(state: JobState) -> &'static str {
    match state {
        JobState::Pending => "pending",
        JobState::Running => "running",
        JobState::Finished => "finished",
        JobState::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalBackend;
    use taskq_core::testing::InMemoryTaskStore;
    use taskq_core::TaskStatus;
    use uuid::Uuid;

    fn fresh_task(task_type: &str, target_backend: Option<&str>, max_attempts: i32) -> Task {
        let now = chrono::Utc::now();
        Task {
            id: Uuid::nil(),
            task_type: task_type.to_string(),
            status: TaskStatus::Queued,
            n: 1,
            priority: 0,
            attempts: 0,
            max_attempts,
            target_backend: target_backend.map(str::to_string),
            backend: None,
            backend_job_id: None,
            leased_by: None,
            leased_at: None,
            lease_expires_at: None,
            last_heartbeat_at: None,
            payload: serde_json::json!({"sleep_s": 0}),
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

    #[tokio::test]
    async fn demo_mode_runs_one_task_to_completion_then_exits() {
        let store = InMemoryTaskStore::new();
        let id = store.insert(fresh_task("demo_sleep", Some("local"), 3));
        let backend = LocalBackend;

        let config = LoopConfig {
            poll_interval: Duration::from_millis(5),
            idle_exit: Some(Duration::from_millis(20)),
            ..LoopConfig::default()
        };

        run(&store, &backend, "host:test", Some("local"), config)
            .await
            .unwrap();

        let row = store.get(id).unwrap();
        assert_eq!(row.status, TaskStatus::Done);
        assert_eq!(row.attempts, 1);
        assert_eq!(row.result.unwrap()["slept"], 0);
    }

    #[tokio::test]
    async fn unsupported_task_type_is_released_with_retry() {
        let store = InMemoryTaskStore::new();
        let id = store.insert(fresh_task("search_mols", Some("local"), 3));
        let backend = LocalBackend;

        let config = LoopConfig {
            poll_interval: Duration::from_millis(5),
            idle_exit: Some(Duration::from_millis(20)),
            ..LoopConfig::default()
        };

        run(&store, &backend, "host:test", Some("local"), config)
            .await
            .unwrap();

        let row = store.get(id).unwrap();
        assert_eq!(row.status, TaskStatus::Queued);
        assert!(row.error.is_some());
    }

    /// A backend that always submits detached, handing back a fixed external
    /// handle and a poll closure that reports `Finished` from the first
    /// call — used to exercise the submit-then-stamp path without a real
    /// external scheduler.
    struct DetachedTestBackend {
        external_handle: &'static str,
    }

    #[async_trait::async_trait]
    impl BackendAdapter for DetachedTestBackend {
        fn name(&self) -> &str {
            "test-detached"
        }

        fn supports(&self, task_type: &str) -> bool {
            task_type == "search_mols"
        }

        async fn execute(&self, _task: &Task) -> anyhow::Result<ExecutionKind> {
            let handle = self.external_handle.to_string();
            Ok(ExecutionKind::Detached(taskq_core::DetachedHandle {
                external_handle: handle,
                poll: Box::new(|| JobState::Finished),
            }))
        }
    }

    #[tokio::test]
    async fn detached_submission_persists_the_external_handle() {
        let store = InMemoryTaskStore::new();
        let id = store.insert(fresh_task("search_mols", Some("slurm"), 3));
        let backend = DetachedTestBackend { external_handle: "job-123" };

        let config = LoopConfig {
            poll_interval: Duration::from_millis(5),
            job_poll_interval: Duration::from_millis(5),
            finished_grace: Duration::from_millis(5),
            idle_exit: Some(Duration::from_millis(20)),
            ..LoopConfig::default()
        };

        run(&store, &backend, "host:test", Some("slurm"), config)
            .await
            .unwrap();

        let row = store.get(id).unwrap();
        assert_eq!(row.backend_job_id.as_deref(), Some("job-123"));
        assert_eq!(row.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_ends_in_failed() {
        let store = InMemoryTaskStore::new();
        let mut task = fresh_task("demo_sleep", Some("local"), 1);
        task.payload = serde_json::json!({"sleep_s": -1});
        let id = store.insert(task);
        let backend = LocalBackend;

        let config = LoopConfig {
            poll_interval: Duration::from_millis(5),
            idle_exit: Some(Duration::from_millis(20)),
            ..LoopConfig::default()
        };

        run(&store, &backend, "host:test", Some("local"), config)
            .await
            .unwrap();

        let row = store.get(id).unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert_eq!(row.attempts, 1);
    }
}
