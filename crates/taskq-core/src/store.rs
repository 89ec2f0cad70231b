//! The queue protocol: the set of atomic operations every `TaskStore`
//! implementation must provide. See `taskq-postgres::PgTaskStore` for the
//! sole production implementation, and [`crate::testing::InMemoryTaskStore`]
//! for the one used to unit-test the orchestrator loop.

use async_trait::async_trait;
use uuid::Uuid;

use crate::task::Task;

/// Result of [`TaskStore::cancel`]. A plain `bool` can't distinguish "already
/// terminal" from "doesn't exist", and both are distinct, observable
/// outcomes a caller needs: a second cancel on the same row must surface a
/// conflict, not look like a no-op success.
#[derive(Debug)]
pub enum CancelOutcome {
    Canceled(Task),
    AlreadyTerminal(Task),
    NotFound,
}

/// Summary of a [`TaskStore::requeue_stale`] pass, reported by the janitor.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequeueReport {
    /// Rows moved from `leased` (expired lease, no heartbeat) back to `queued`.
    pub leased_requeued: u64,
    /// Rows moved from `running` (stale heartbeat) back to `queued`.
    pub running_requeued: u64,
}

impl RequeueReport {
    pub fn total(&self) -> u64 {
        self.leased_requeued + self.running_requeued
    }
}

/// The durable queueing and lease protocol. Every method commits or rolls
/// back atomically; none hold a lock across an await boundary outside its
/// own call.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fetch a row by id without mutating it. Used by the reconciliation
    /// loop to observe store-side state, and by callers that need to inspect
    /// a row's current state outside the mutating ops.
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Task>>;

    /// Atomically claim the single highest-priority eligible row for
    /// `target_backend` (`None` matches only rows whose `target_backend` is
    /// itself `NULL` — there is no wildcard). Returns `None` when the queue
    /// has nothing claimable; the caller polls.
    async fn lease_one(
        &self,
        leased_by: &str,
        lease_seconds: i64,
        target_backend: Option<&str>,
    ) -> anyhow::Result<Option<Task>>;

    /// Stamp a row as running under the given backend handle. Matches rows
    /// in either `leased` or `running` status so the same call can both
    /// perform the initial leased-to-running transition and, for a detached
    /// backend, re-stamp `backend_job_id` once the real external handle is
    /// known (the row is already `running` by then). Returns `false` when
    /// no row matches `leased_by` in one of those two statuses — the lease
    /// has already been lost and the caller should abandon the task.
    async fn mark_running(
        &self,
        id: Uuid,
        leased_by: &str,
        backend: &str,
        backend_job_id: &str,
    ) -> anyhow::Result<bool>;

    /// Extend the lease and shallow-merge `meta` into `worker_meta`, both
    /// inside the same transaction so concurrent heartbeats never clobber
    /// each other's merge. Idempotent. Returns `false` on a lost lease.
    async fn heartbeat(
        &self,
        id: Uuid,
        leased_by: &str,
        lease_seconds: i64,
        meta: serde_json::Value,
    ) -> anyhow::Result<bool>;

    /// Finalize successfully. Returns `false` if `leased_by` no longer owns
    /// the row — this is what stops a delayed callback from a prior
    /// leaseholder incarnation from clobbering a reassigned row.
    async fn mark_done(
        &self,
        id: Uuid,
        leased_by: &str,
        result: serde_json::Value,
    ) -> anyhow::Result<bool>;

    /// Finalize with failure. `retry=true` writes `queued` instead of
    /// `failed` (clearing lease metadata); `retry=false` writes `failed` and
    /// retains `leased_by`/`lease_expires_at` for post-mortem. Refuses
    /// (returns `false`) on rows that are `canceled` or owned by someone
    /// else.
    async fn mark_failed(
        &self,
        id: Uuid,
        leased_by: &str,
        error: &str,
        retry: bool,
    ) -> anyhow::Result<bool>;

    /// Transition any non-terminal row to `canceled`.
    async fn cancel(&self, id: Uuid) -> anyhow::Result<CancelOutcome>;

    /// Reclaim rows abandoned by a dead leaseholder: expired `leased` rows,
    /// and `running` rows whose heartbeat is older than
    /// `running_stale_seconds`. Both moves happen in one transaction.
    async fn requeue_stale(&self, running_stale_seconds: i64) -> anyhow::Result<RequeueReport>;
}
