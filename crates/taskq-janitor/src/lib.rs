//! The janitor: a standalone, typically-scheduled invocation of
//! `TaskStore::requeue_stale`, with a dry-run mode that reports what would
//! be reclaimed without writing.

use taskq_core::{RequeueReport, TaskStore};

/// Run one janitor pass: reclaim every stale leased/running row in one
/// transaction and report what moved. The CLI wraps this with its own
/// preview query so `--yes`-less invocations never call this at all.
pub async fn run_janitor<S: TaskStore + ?Sized>(
    store: &S,
    running_stale_seconds: i64,
) -> anyhow::Result<RequeueReport> {
    store.requeue_stale(running_stale_seconds).await
}
