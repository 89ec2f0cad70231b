//! The `Task` entity and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a task. Transitions form the directed graph documented on
/// [`TaskStatus::is_terminal`]: queued -> leased -> running -> {done, failed};
/// queued -> canceled; leased/running -> canceled; failed -> queued (retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Leased,
    Running,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Terminal statuses are sticky: no mutating op transitions out of them,
    /// except `mark_failed(retry=true)`, which writes `Queued` in place of `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// A unit of work in the queue. Mirrors the `tasks` table column-for-column;
/// see `taskq-postgres`'s migration for the schema this maps onto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub status: TaskStatus,

    pub n: i64,
    pub priority: i32,

    pub attempts: i32,
    pub max_attempts: i32,

    pub target_backend: Option<String>,
    pub backend: Option<String>,
    pub backend_job_id: Option<String>,

    pub leased_by: Option<String>,
    pub leased_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,

    pub worker_meta: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub run_id: Option<Uuid>,
}

impl Task {
    /// True when `attempts` has reached `max_attempts` and a retry requeue is
    /// no longer permitted: `attempts` never exceeds `max_attempts`, and a
    /// retry only happens while `attempts < max_attempts`.
    pub fn retry_budget_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}
