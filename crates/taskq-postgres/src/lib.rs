//! PostgreSQL implementation of the taskq queue protocol.
//!
//! This crate provides the sole production `TaskStore` implementation: every
//! atomic transaction from the protocol (`lease_one`, `heartbeat`,
//! `mark_running`, `mark_done`, `mark_failed`, `cancel`, `requeue_stale`)
//! against a `sqlx::PgPool`.
//!
//! # Features
//!
//! - `FOR UPDATE SKIP LOCKED` row reservation — concurrent leasers never
//!   collide nor block each other.
//! - `target_backend` partitioning via `IS NOT DISTINCT FROM`, so a `None`
//!   filter matches only rows whose `target_backend` is itself `NULL`.
//! - Attempt accounting that only bills the prior `queued` status, so a
//!   re-lease of an expired lease doesn't consume a retry.
//! - Server-side shallow merge of heartbeat `worker_meta`, so concurrent
//!   heartbeats can never lose each other's content to a read-modify-write
//!   race.
//!
//! # Database Schema
//!
//! See `migrations/0001_init.sql` for the authoritative schema. Summary:
//!
//! ```sql
//! CREATE TYPE task_status AS ENUM
//!     ('queued', 'leased', 'running', 'done', 'failed', 'canceled');
//!
//! CREATE TABLE tasks (
//!     id UUID PRIMARY KEY,
//!     task_type TEXT NOT NULL,
//!     status task_status NOT NULL DEFAULT 'queued',
//!     n BIGINT NOT NULL DEFAULT 0,
//!     priority INTEGER NOT NULL DEFAULT 0,
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     max_attempts INTEGER NOT NULL DEFAULT 3,
//!     target_backend TEXT,
//!     backend TEXT,
//!     backend_job_id TEXT,
//!     leased_by TEXT,
//!     leased_at TIMESTAMPTZ,
//!     lease_expires_at TIMESTAMPTZ,
//!     last_heartbeat_at TIMESTAMPTZ,
//!     payload JSONB NOT NULL DEFAULT '{}'::jsonb,
//!     result JSONB,
//!     error TEXT,
//!     started_at TIMESTAMPTZ,
//!     finished_at TIMESTAMPTZ,
//!     exit_code INTEGER,
//!     worker_meta JSONB NOT NULL DEFAULT '{}'::jsonb,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     run_id UUID
//! );
//!
//! CREATE INDEX idx_tasks_lease_scan ON tasks (status, priority, created_at);
//! CREATE INDEX idx_tasks_janitor ON tasks (status, lease_expires_at);
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use taskq_postgres::PgTaskStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/taskq").await?;
//! let store = PgTaskStore::new(pool);
//! let task = store.lease_one("host:uuid", 120, Some("local")).await?;
//! ```

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use taskq_core::{CancelOutcome, RequeueReport, Task, TaskStatus, TaskStore};
use uuid::Uuid;

/// PostgreSQL-backed task store.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

const SELECT_COLUMNS: &str = r#"
    id, task_type, status,
    n, priority,
    attempts, max_attempts,
    target_backend, backend, backend_job_id,
    leased_by, leased_at, lease_expires_at, last_heartbeat_at,
    payload, result, error,
    started_at, finished_at, exit_code,
    worker_meta,
    created_at, updated_at,
    run_id
"#;

fn decode_status(raw: &str) -> anyhow::Result<TaskStatus> {
    Ok(match raw {
        "queued" => TaskStatus::Queued,
        "leased" => TaskStatus::Leased,
        "running" => TaskStatus::Running,
        "done" => TaskStatus::Done,
        "failed" => TaskStatus::Failed,
        "canceled" => TaskStatus::Canceled,
        other => anyhow::bail!("unknown task_status: {other}"),
    })
}

fn decode_task(row: &PgRow) -> anyhow::Result<Task> {
    let status_raw: String = row.try_get("status")?;
    Ok(Task {
        id: row.try_get("id")?,
        task_type: row.try_get("task_type")?,
        status: decode_status(&status_raw)?,
        n: row.try_get("n")?,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        target_backend: row.try_get("target_backend")?,
        backend: row.try_get("backend")?,
        backend_job_id: row.try_get("backend_job_id")?,
        leased_by: row.try_get("leased_by")?,
        leased_at: row.try_get("leased_at")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        payload: row.try_get("payload")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        exit_code: row.try_get("exit_code")?,
        worker_meta: row.try_get("worker_meta")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        run_id: row.try_get("run_id")?,
    })
}

impl PgTaskStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Borrow the underlying pool (e.g. to run the schema migration).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    /// Fetch a row without mutating it, used by the orchestrator's detached
    /// reconciliation loop to observe the store-side outcome.
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Task>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| decode_task(&r)).transpose()
    }

    /// Claim the single highest-priority eligible row for `target_backend`
    /// in one `UPDATE ... FOR UPDATE SKIP LOCKED` transaction.
    ///
    /// `target_backend = None` only matches rows whose `target_backend` is
    /// itself `NULL` (`IS NOT DISTINCT FROM` semantics) — it is never a
    /// wildcard across backends.
    async fn lease_one(
        &self,
        leased_by: &str,
        lease_seconds: i64,
        target_backend: Option<&str>,
    ) -> anyhow::Result<Option<Task>> {
        let sql = format!(
            r#"
            WITH candidate AS (
                SELECT id
                FROM tasks
                WHERE
                    (status = 'queued' OR (status = 'leased' AND lease_expires_at < now()))
                    AND attempts < max_attempts
                    AND status <> 'canceled'
                    AND target_backend IS NOT DISTINCT FROM $1
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks t
            SET
                status = 'leased',
                leased_by = $2,
                leased_at = now(),
                last_heartbeat_at = now(),
                lease_expires_at = now() + ($3::bigint || ' seconds')::interval,
                attempts = CASE WHEN t.status = 'queued' THEN t.attempts + 1 ELSE t.attempts END
            FROM candidate
            WHERE t.id = candidate.id
            RETURNING {SELECT_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(target_backend)
            .bind(leased_by)
            .bind(lease_seconds)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| decode_task(&r)).transpose()
    }

    /// Stamp a row as running. Matches `leased` or already-`running` rows so
    /// a detached backend can call this twice: once to transition off
    /// `leased`, then again once submission returns the real external
    /// handle. A non-matching `leased_by`/`status` pair returns `Ok(false)`
    /// rather than an error — the orchestrator treats that as "my lease is
    /// stale, abandon".
    async fn mark_running(
        &self,
        id: Uuid,
        leased_by: &str,
        backend: &str,
        backend_job_id: &str,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET
                status = 'running',
                backend = $1,
                backend_job_id = $2,
                started_at = COALESCE(started_at, now()),
                last_heartbeat_at = now()
            WHERE id = $3 AND leased_by = $4 AND status IN ('leased', 'running')
            "#,
        )
        .bind(backend)
        .bind(backend_job_id)
        .bind(id)
        .bind(leased_by)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Extend the lease and shallow-merge `meta` into `worker_meta`,
    /// entirely server-side so concurrent heartbeats can't lose each
    /// other's content to a client-side read-modify-write.
    async fn heartbeat(
        &self,
        id: Uuid,
        leased_by: &str,
        lease_seconds: i64,
        meta: serde_json::Value,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET
                lease_expires_at = now() + ($1::bigint || ' seconds')::interval,
                last_heartbeat_at = now(),
                worker_meta = COALESCE(worker_meta, '{}'::jsonb) || $2::jsonb
            WHERE
                id = $3
                AND leased_by = $4
                AND status IN ('leased', 'running')
            "#,
        )
        .bind(lease_seconds)
        .bind(meta)
        .bind(id)
        .bind(leased_by)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Finalize successfully. The `leased_by` precondition is what stops a
    /// delayed callback from a prior leaseholder incarnation from
    /// clobbering a row that has since been reassigned.
    async fn mark_done(
        &self,
        id: Uuid,
        leased_by: &str,
        result: serde_json::Value,
    ) -> anyhow::Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET
                status = 'done',
                result = $1,
                error = NULL,
                finished_at = now(),
                exit_code = 0,
                lease_expires_at = NULL
            WHERE id = $2 AND leased_by = $3
            "#,
        )
        .bind(result)
        .bind(id)
        .bind(leased_by)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    /// Finalize with failure. `retry=true` writes `queued` (clearing lease
    /// metadata) instead of `failed`; `retry=false` writes `failed` and
    /// retains `leased_by`/`lease_expires_at` for post-mortem. Refuses to
    /// act on rows that are already `canceled`.
    async fn mark_failed(
        &self,
        id: Uuid,
        leased_by: &str,
        error: &str,
        retry: bool,
    ) -> anyhow::Result<bool> {
        let new_status = if retry { "queued" } else { "failed" };

        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET
                status = $1::task_status,
                error = $2,
                finished_at = CASE WHEN $1 = 'failed' THEN now() ELSE finished_at END,
                exit_code = CASE WHEN $1 = 'failed' THEN 1 ELSE exit_code END,
                leased_by = CASE WHEN $1 = 'queued' THEN NULL ELSE leased_by END,
                lease_expires_at = CASE WHEN $1 = 'queued' THEN NULL ELSE lease_expires_at END
            WHERE id = $3
                AND leased_by = $4
                AND status <> 'canceled'
            "#,
        )
        .bind(new_status)
        .bind(error)
        .bind(id)
        .bind(leased_by)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    /// Transition any non-terminal row to `canceled`. Distinguishes "already
    /// finished" from "doesn't exist" so callers can surface a conflict.
    async fn cancel(&self, id: Uuid) -> anyhow::Result<CancelOutcome> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'canceled'
            WHERE id = $1 AND status NOT IN ('done', 'failed', 'canceled')
            RETURNING {SELECT_COLUMNS}
            "#
        );

        if let Some(row) = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await? {
            return Ok(CancelOutcome::Canceled(decode_task(&row)?));
        }

        let existing_sql = format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE id = $1");
        match sqlx::query(&existing_sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        {
            Some(row) => Ok(CancelOutcome::AlreadyTerminal(decode_task(&row)?)),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    /// Reclaim rows abandoned by a dead leaseholder, in one transaction:
    /// expired `leased` rows, and `running` rows whose heartbeat is older
    /// than `running_stale_seconds`.
    async fn requeue_stale(&self, running_stale_seconds: i64) -> anyhow::Result<RequeueReport> {
        let mut tx = self.pool.begin().await?;

        let leased = sqlx::query(
            r#"
            UPDATE tasks
            SET
                status = 'queued',
                leased_by = NULL,
                leased_at = NULL,
                lease_expires_at = NULL,
                last_heartbeat_at = NULL
            WHERE
                status = 'leased'
                AND lease_expires_at IS NOT NULL
                AND lease_expires_at < now()
            "#,
        )
        .execute(&mut *tx)
        .await?;

        let running = sqlx::query(
            r#"
            UPDATE tasks
            SET
                status = 'queued',
                leased_by = NULL,
                leased_at = NULL,
                lease_expires_at = NULL,
                last_heartbeat_at = NULL,
                backend = NULL,
                backend_job_id = NULL,
                started_at = NULL
            WHERE
                status = 'running'
                AND last_heartbeat_at IS NOT NULL
                AND last_heartbeat_at < now() - ($1::bigint || ' seconds')::interval
            "#,
        )
        .bind(running_stale_seconds)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(RequeueReport {
            leased_requeued: leased.rows_affected(),
            running_requeued: running.rows_affected(),
        })
    }
}

/// Operations outside the core protocol: lifecycle housekeeping that
/// nothing else owns, since this crate is the sole owner of the `tasks`
/// table.
impl PgTaskStore {
    /// Delete terminal rows belonging to a batch. Terminal rows are retained
    /// indefinitely otherwise, so callers that want to reclaim space call
    /// this explicitly once a `run_id`'s rows are no longer needed.
    pub async fn delete_by_run_id(&self, run_id: Uuid) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE run_id = $1 AND status IN ('done', 'failed', 'canceled')
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Count rows `requeue_stale` would reclaim without writing anything —
    /// the janitor CLI's dry-run preview, a plain count-then-print step the
    /// CLI runs before conditionally applying the real requeue.
    pub async fn count_stale(&self, running_stale_seconds: i64) -> anyhow::Result<RequeueReport> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT count(*) FROM tasks WHERE status = 'leased' AND lease_expires_at < now()) AS leased_stale,
                (SELECT count(*) FROM tasks WHERE status = 'running' AND last_heartbeat_at < now() - ($1::bigint || ' seconds')::interval) AS running_stale
            "#,
        )
        .bind(running_stale_seconds)
        .fetch_one(&self.pool)
        .await?;

        let leased_stale: i64 = row.try_get("leased_stale")?;
        let running_stale: i64 = row.try_get("running_stale")?;

        Ok(RequeueReport {
            leased_requeued: leased_stale as u64,
            running_requeued: running_stale as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn insert_task_sql() -> &'static str {
        r#"
        INSERT INTO tasks (task_type, n, priority, max_attempts, target_backend, payload)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#
    }

    async fn insert_task(
        pool: &PgPool,
        task_type: &str,
        priority: i32,
        target_backend: Option<&str>,
    ) -> Uuid {
        sqlx::query_scalar(insert_task_sql())
            .bind(task_type)
            .bind(1_i64)
            .bind(priority)
            .bind(3_i32)
            .bind(target_backend)
            .bind(serde_json::json!({"sleep_s": 0}))
            .fetch_one(pool)
            .await
            .expect("insert task")
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn lease_one_claims_highest_priority_row(pool: PgPool) {
        let store = PgTaskStore::new(pool.clone());
        insert_task(&pool, "demo_sleep", 1, Some("local")).await;
        let high = insert_task(&pool, "demo_sleep", 10, Some("local")).await;

        let leased = store
            .lease_one("w1", 60, Some("local"))
            .await
            .unwrap()
            .expect("a task should be leasable");

        assert_eq!(leased.id, high);
        assert_eq!(leased.attempts, 1);
        assert_eq!(leased.status, TaskStatus::Leased);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn lease_one_does_not_return_rows_for_a_different_backend(pool: PgPool) {
        let store = PgTaskStore::new(pool.clone());
        insert_task(&pool, "demo_sleep", 0, Some("slurm")).await;

        let leased = store.lease_one("w1", 60, Some("local")).await.unwrap();
        assert!(leased.is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn mark_done_requires_matching_leased_by(pool: PgPool) {
        let store = PgTaskStore::new(pool.clone());
        let id = insert_task(&pool, "demo_sleep", 0, Some("local")).await;
        store.lease_one("w1", 60, Some("local")).await.unwrap();

        let ok = store
            .mark_done(id, "someone-else", serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert!(!ok);

        let ok = store
            .mark_done(id, "w1", serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert!(ok);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn mark_failed_retry_returns_row_to_queued(pool: PgPool) {
        let store = PgTaskStore::new(pool.clone());
        let id = insert_task(&pool, "demo_sleep", 0, Some("local")).await;
        let leased = store
            .lease_one("w1", 60, Some("local"))
            .await
            .unwrap()
            .unwrap();

        store
            .mark_failed(id, "w1", "transient error", true)
            .await
            .unwrap();

        let row: (String, Option<String>, i32) =
            sqlx::query_as("SELECT status::text, leased_by, attempts FROM tasks WHERE id = $1")
                .bind(id)
                .fetch_one(&pool)
                .await
                .unwrap();

        assert_eq!(row.0, "queued");
        assert!(row.1.is_none());
        assert_eq!(row.2, leased.attempts);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn mark_failed_without_retry_retains_leased_by(pool: PgPool) {
        let store = PgTaskStore::new(pool.clone());
        let id = insert_task(&pool, "demo_sleep", 0, Some("local")).await;
        store.lease_one("w1", 60, Some("local")).await.unwrap();

        store.mark_failed(id, "w1", "fatal", false).await.unwrap();

        let row: (String, Option<String>) =
            sqlx::query_as("SELECT status::text, leased_by FROM tasks WHERE id = $1")
                .bind(id)
                .fetch_one(&pool)
                .await
                .unwrap();

        assert_eq!(row.0, "failed");
        assert_eq!(row.1.as_deref(), Some("w1"));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn cancel_is_sticky(pool: PgPool) {
        let store = PgTaskStore::new(pool.clone());
        let id = insert_task(&pool, "demo_sleep", 0, Some("local")).await;

        match store.cancel(id).await.unwrap() {
            CancelOutcome::Canceled(t) => assert_eq!(t.status, TaskStatus::Canceled),
            other => panic!("expected Canceled: {other:?}"),
        }

        match store.cancel(id).await.unwrap() {
            CancelOutcome::AlreadyTerminal(_) => {}
            other => panic!("expected AlreadyTerminal: {other:?}"),
        }

        assert!(store.lease_one("w1", 60, Some("local")).await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn requeue_stale_recovers_both_categories(pool: PgPool) {
        let store = PgTaskStore::new(pool.clone());
        let leased_id = insert_task(&pool, "demo_sleep", 0, Some("local")).await;
        let running_id = insert_task(&pool, "demo_sleep", 0, Some("local")).await;

        store.lease_one("w1", 60, Some("local")).await.unwrap();
        store.lease_one("w2", 60, Some("local")).await.unwrap();
        store
            .mark_running(running_id, "w2", "local", "")
            .await
            .unwrap();

        // Simulate both leases going stale.
        let past = Utc::now() - Duration::seconds(1);
        let far_past = Utc::now() - Duration::seconds(700);
        sqlx::query("UPDATE tasks SET lease_expires_at = $1 WHERE id = $2")
            .bind(past)
            .bind(leased_id)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE tasks SET last_heartbeat_at = $1 WHERE id = $2")
            .bind(far_past)
            .bind(running_id)
            .execute(&pool)
            .await
            .unwrap();

        let report = store.requeue_stale(600).await.unwrap();
        assert_eq!(report.leased_requeued, 1);
        assert_eq!(report.running_requeued, 1);
    }
}
