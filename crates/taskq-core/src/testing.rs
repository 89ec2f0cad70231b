//! An in-memory [`TaskStore`] double, for testing the orchestrator state
//! machine and backend adapters without a Postgres instance. It honors the
//! same preconditions and sticky-terminal rules as `taskq-postgres::
//! PgTaskStore` — tests written against this double exercise real protocol
//! semantics, just not the SQL.
//!
//! Per-row mutations go through a [`dashmap::DashMap`] entry, which gives
//! each row its own lock the way a real row-level `UPDATE` would. Selecting
//! *which* row to lease needs to see a consistent snapshot across rows the
//! way `FOR UPDATE SKIP LOCKED` does, so `lease_one` additionally serializes
//! through a dedicated [`tokio::sync::Mutex`].

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::store::{CancelOutcome, RequeueReport, TaskStore};
use crate::task::{Task, TaskStatus};

pub struct InMemoryTaskStore {
    rows: DashMap<Uuid, Task>,
    lease_lock: tokio::sync::Mutex<()>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            lease_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Insert a task directly (as an external producer would via `INSERT`).
    /// Returns the id assigned if the caller didn't set one.
    pub fn insert(&self, mut task: Task) -> Uuid {
        if task.id.is_nil() {
            task.id = Uuid::new_v4();
        }
        let id = task.id;
        self.rows.insert(id, task);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<Task> {
        self.rows.get(&id).map(|r| r.clone())
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn shallow_merge(base: &mut serde_json::Value, incoming: &serde_json::Value) {
    let (Some(base_obj), Some(incoming_obj)) = (base.as_object_mut(), incoming.as_object()) else {
        return;
    };
    for (k, v) in incoming_obj {
        base_obj.insert(k.clone(), v.clone());
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Task>> {
        Ok(self.rows.get(&id).map(|r| r.clone()))
    }

    async fn lease_one(
        &self,
        leased_by: &str,
        lease_seconds: i64,
        target_backend: Option<&str>,
    ) -> anyhow::Result<Option<Task>> {
        let _guard = self.lease_lock.lock().await;
        let now = Utc::now();

        let mut candidate_id = None;
        let mut best: Option<(i32, chrono::DateTime<Utc>)> = None;

        for entry in self.rows.iter() {
            let t = entry.value();
            if t.status == TaskStatus::Canceled {
                continue;
            }
            if t.attempts >= t.max_attempts {
                continue;
            }
            let eligible = t.status == TaskStatus::Queued
                || (t.status == TaskStatus::Leased
                    && t.lease_expires_at.map(|e| e < now).unwrap_or(false));
            if !eligible {
                continue;
            }
            if t.target_backend.as_deref() != target_backend {
                continue;
            }

            let key = (t.priority, t.created_at);
            let better = match best {
                None => true,
                Some((bp, bc)) => key.0 > bp || (key.0 == bp && key.1 < bc),
            };
            if better {
                best = Some(key);
                candidate_id = Some(t.id);
            }
        }

        let Some(id) = candidate_id else {
            return Ok(None);
        };

        let mut entry = self.rows.get_mut(&id).unwrap();
        let t = entry.value_mut();
        if t.status == TaskStatus::Queued {
            t.attempts += 1;
        }
        t.status = TaskStatus::Leased;
        t.leased_by = Some(leased_by.to_string());
        t.leased_at = Some(now);
        t.last_heartbeat_at = Some(now);
        t.lease_expires_at = Some(now + chrono::Duration::seconds(lease_seconds));
        t.updated_at = now;
        Ok(Some(t.clone()))
    }

    async fn mark_running(
        &self,
        id: Uuid,
        leased_by: &str,
        backend: &str,
        backend_job_id: &str,
    ) -> anyhow::Result<bool> {
        let Some(mut entry) = self.rows.get_mut(&id) else {
            return Ok(false);
        };
        let t = entry.value_mut();
        if t.leased_by.as_deref() != Some(leased_by)
            || !matches!(t.status, TaskStatus::Leased | TaskStatus::Running)
        {
            return Ok(false);
        }
        let now = Utc::now();
        t.status = TaskStatus::Running;
        t.backend = Some(backend.to_string());
        t.backend_job_id = Some(backend_job_id.to_string());
        if t.started_at.is_none() {
            t.started_at = Some(now);
        }
        t.last_heartbeat_at = Some(now);
        t.updated_at = now;
        Ok(true)
    }

    async fn heartbeat(
        &self,
        id: Uuid,
        leased_by: &str,
        lease_seconds: i64,
        meta: serde_json::Value,
    ) -> anyhow::Result<bool> {
        let Some(mut entry) = self.rows.get_mut(&id) else {
            return Ok(false);
        };
        let t = entry.value_mut();
        let owned = t.leased_by.as_deref() == Some(leased_by)
            && matches!(t.status, TaskStatus::Leased | TaskStatus::Running);
        if !owned {
            return Ok(false);
        }
        let now = Utc::now();
        t.lease_expires_at = Some(now + chrono::Duration::seconds(lease_seconds));
        t.last_heartbeat_at = Some(now);
        shallow_merge(&mut t.worker_meta, &meta);
        t.updated_at = now;
        Ok(true)
    }

    async fn mark_done(
        &self,
        id: Uuid,
        leased_by: &str,
        result: serde_json::Value,
    ) -> anyhow::Result<bool> {
        let Some(mut entry) = self.rows.get_mut(&id) else {
            return Ok(false);
        };
        let t = entry.value_mut();
        if t.leased_by.as_deref() != Some(leased_by) {
            return Ok(false);
        }
        let now = Utc::now();
        t.status = TaskStatus::Done;
        t.result = Some(result);
        t.error = None;
        t.finished_at = Some(now);
        t.exit_code = Some(0);
        t.lease_expires_at = None;
        t.updated_at = now;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        leased_by: &str,
        error: &str,
        retry: bool,
    ) -> anyhow::Result<bool> {
        let Some(mut entry) = self.rows.get_mut(&id) else {
            return Ok(false);
        };
        let t = entry.value_mut();
        if t.leased_by.as_deref() != Some(leased_by) || t.status == TaskStatus::Canceled {
            return Ok(false);
        }
        let now = Utc::now();
        t.error = Some(error.to_string());
        if retry {
            t.status = TaskStatus::Queued;
            t.leased_by = None;
            t.lease_expires_at = None;
        } else {
            t.status = TaskStatus::Failed;
            t.finished_at = Some(now);
            t.exit_code = Some(1);
        }
        t.updated_at = now;
        Ok(true)
    }

    async fn cancel(&self, id: Uuid) -> anyhow::Result<CancelOutcome> {
        let Some(mut entry) = self.rows.get_mut(&id) else {
            return Ok(CancelOutcome::NotFound);
        };
        let t = entry.value_mut();
        if t.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(t.clone()));
        }
        t.status = TaskStatus::Canceled;
        t.updated_at = Utc::now();
        Ok(CancelOutcome::Canceled(t.clone()))
    }

    async fn requeue_stale(&self, running_stale_seconds: i64) -> anyhow::Result<RequeueReport> {
        let now = Utc::now();
        let mut report = RequeueReport::default();

        for mut entry in self.rows.iter_mut() {
            let t = entry.value_mut();
            match t.status {
                TaskStatus::Leased
                    if t.lease_expires_at.map(|e| e < now).unwrap_or(false) =>
                {
                    t.status = TaskStatus::Queued;
                    t.leased_by = None;
                    t.leased_at = None;
                    t.lease_expires_at = None;
                    t.last_heartbeat_at = None;
                    t.updated_at = now;
                    report.leased_requeued += 1;
                }
                TaskStatus::Running
                    if t.last_heartbeat_at
                        .map(|h| h < now - chrono::Duration::seconds(running_stale_seconds))
                        .unwrap_or(false) =>
                {
                    t.status = TaskStatus::Queued;
                    t.leased_by = None;
                    t.leased_at = None;
                    t.lease_expires_at = None;
                    t.last_heartbeat_at = None;
                    t.backend = None;
                    t.backend_job_id = None;
                    t.started_at = None;
                    t.updated_at = now;
                    report.running_requeued += 1;
                }
                _ => {}
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_task(task_type: &str, target_backend: Option<&str>) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            task_type: task_type.to_string(),
            status: TaskStatus::Queued,
            n: 1,
            priority: 0,
            attempts: 0,
            max_attempts: 3,
            target_backend: target_backend.map(str::to_string),
            backend: None,
            backend_job_id: None,
            leased_by: None,
            leased_at: None,
            lease_expires_at: None,
            last_heartbeat_at: None,
            payload: serde_json::json!({}),
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
    async fn lease_one_is_exclusive_across_concurrent_callers() {
        let store = InMemoryTaskStore::new();
        let id = store.insert(fresh_task("demo_sleep", Some("local")));

        let a = store.lease_one("worker-a", 60, Some("local"));
        let b = store.lease_one("worker-b", 60, Some("local"));
        let (a, b) = tokio::join!(a, b);
        let a = a.unwrap();
        let b = b.unwrap();

        // Exactly one of the two callers won the row.
        assert_ne!(a.is_some(), b.is_some());
        let won = a.or(b).unwrap();
        assert_eq!(won.id, id);
        assert_eq!(won.attempts, 1);
    }

    #[tokio::test]
    async fn null_target_backend_is_not_a_wildcard() {
        let store = InMemoryTaskStore::new();
        store.insert(fresh_task("demo_sleep", Some("local")));

        let leased = store.lease_one("worker-a", 60, None).await.unwrap();
        assert!(leased.is_none(), "None filter must not match a non-null target_backend");
    }

    #[tokio::test]
    async fn retry_requeue_round_trips_to_queued() {
        let store = InMemoryTaskStore::new();
        let id = store.insert(fresh_task("demo_sleep", Some("local")));
        let leased = store.lease_one("w1", 60, Some("local")).await.unwrap().unwrap();

        store
            .mark_failed(id, "w1", "boom", true)
            .await
            .unwrap();

        let row = store.get(id).unwrap();
        assert_eq!(row.status, TaskStatus::Queued);
        assert!(row.leased_by.is_none());
        assert!(row.lease_expires_at.is_none());
        assert_eq!(row.attempts, leased.attempts);
        assert_eq!(row.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn stale_leaseholder_cannot_mark_done() {
        let store = InMemoryTaskStore::new();
        let id = store.insert(fresh_task("demo_sleep", Some("local")));
        store.lease_one("w1", 60, Some("local")).await.unwrap();

        // w1's lease expires and w2 reclaims it.
        {
            let mut row = store.rows.get_mut(&id).unwrap();
            row.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
        store.lease_one("w2", 60, Some("local")).await.unwrap();

        let ok = store.mark_done(id, "w1", serde_json::json!({"x": 1})).await.unwrap();
        assert!(!ok, "a lease lost to w2 must not let w1 finalize the row");
        assert_eq!(store.get(id).unwrap().status, TaskStatus::Leased);
    }

    #[tokio::test]
    async fn cancel_is_sticky_and_reports_conflict() {
        let store = InMemoryTaskStore::new();
        let id = store.insert(fresh_task("demo_sleep", Some("local")));

        match store.cancel(id).await.unwrap() {
            CancelOutcome::Canceled(t) => assert_eq!(t.status, TaskStatus::Canceled),
            other => panic!("expected Canceled, got {other:?}"),
        }

        assert!(store.lease_one("w1", 60, Some("local")).await.unwrap().is_none());

        match store.cancel(id).await.unwrap() {
            CancelOutcome::AlreadyTerminal(_) => {}
            other => panic!("expected AlreadyTerminal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn requeue_stale_recovers_abandoned_running_row() {
        let store = InMemoryTaskStore::new();
        let id = store.insert(fresh_task("demo_sleep", Some("local")));
        store.lease_one("w1", 60, Some("local")).await.unwrap();
        store.mark_running(id, "w1", "local", "").await.unwrap();

        {
            let mut row = store.rows.get_mut(&id).unwrap();
            row.last_heartbeat_at = Some(Utc::now() - chrono::Duration::seconds(700));
        }

        let report = store.requeue_stale(600).await.unwrap();
        assert_eq!(report.running_requeued, 1);
        assert_eq!(store.get(id).unwrap().status, TaskStatus::Queued);
    }
}
