//! The backend adapter contract: a narrow interface the orchestrator drives
//! without ever inspecting external-system specifics.

use async_trait::async_trait;

use crate::task::Task;

/// Observed state of a detached external job, as reported by a backend's
/// poll function. Named generically — backends map their own vocabulary
/// (Slurm's `PENDING`/`RUNNING`/`COMPLETED`, BOINC's workunit states, ...)
/// onto this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Finished,
    Unknown,
}

/// What a backend's `execute` call hands back to the orchestrator.
pub enum ExecutionKind {
    /// Ran to completion in the calling context. The orchestrator calls
    /// `mark_done`/`mark_failed` directly from the result.
    Synchronous(anyhow::Result<serde_json::Value>),
    /// Submission returned an opaque external handle; a callback (not this
    /// process) will eventually finalize the task. The orchestrator drives
    /// its reconciliation loop against `poll` until the row reaches a
    /// terminal state.
    Detached(DetachedHandle),
}

/// An in-flight external job submission, together with the means to poll its
/// state. Boxed so backends can close over whatever client they need.
pub struct DetachedHandle {
    pub external_handle: String,
    pub poll: Box<dyn Fn() -> JobState + Send + Sync>,
}

/// A pluggable executor for a task. `supports` gates which rows an
/// orchestrator bound to this backend will even attempt — an orchestrator
/// encountering an unsupported `task_type` releases the row with
/// `mark_failed(retry=true)` rather than calling `execute`.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Stable name stamped into `Task::backend` on `mark_running`.
    fn name(&self) -> &str;

    fn supports(&self, task_type: &str) -> bool;

    async fn execute(&self, task: &Task) -> anyhow::Result<ExecutionKind>;
}
