//! A reference detached backend: submits jobs to Slurm via `sbatch` and
//! polls their state via `sacct`. This is not a hardened production Slurm
//! client — it exists to exercise the detached/reconciliation path
//! end-to-end against a real external scheduler. Grounded on
//! `app/backend/slurm/client.py`.

use std::path::PathBuf;
use std::process::Command as BlockingCommand;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use taskq_core::{BackendAdapter, DetachedHandle, ExecutionKind, JobState, Task};

pub const BACKEND_NAME: &str = "slurm";

/// Task types this reference adapter is willing to submit.
const SUPPORTED_TASK_TYPES: &[&str] = &["complete_latin_square_from_prefix", "search_mols"];

#[derive(Clone)]
pub struct SlurmBackend {
    task_dir: PathBuf,
    result_base_url: Option<String>,
    result_secret: Option<String>,
    /// Round-robin node list (`--rr-nodes`); empty means no node pinning.
    rr_nodes: Vec<String>,
    rr_cursor: Arc<AtomicUsize>,
}

impl SlurmBackend {
    pub fn new(
        task_dir: PathBuf,
        result_base_url: Option<String>,
        result_secret: Option<String>,
        rr_nodes: Vec<String>,
    ) -> Self {
        Self {
            task_dir,
            result_base_url,
            result_secret,
            rr_nodes,
            rr_cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn next_node(&self) -> Option<&str> {
        if self.rr_nodes.is_empty() {
            return None;
        }
        let i = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % self.rr_nodes.len();
        Some(self.rr_nodes[i].as_str())
    }

    fn parse_sleep_seconds(payload: &serde_json::Value) -> u64 {
        payload
            .get("sleep_s")
            .and_then(|v| v.as_i64())
            .filter(|v| (0..=3600).contains(v))
            .unwrap_or(1) as u64
    }

    /// Build the inline job script: sleep, write `result.json`, then POST
    /// the signed result to the callback ingest so the orchestrator never
    /// has to reach back into the job's filesystem.
    fn build_job_script(
        &self,
        task_id: uuid::Uuid,
        task_type: &str,
        leased_by: &str,
        sleep_s: u64,
        payload: &serde_json::Value,
        result_path: &std::path::Path,
    ) -> String {
        let body = serde_json::json!({
            "task_id": task_id,
            "leased_by": leased_by,
            "ok": true,
            "result": {
                "ok": true,
                "task_type": task_type,
                "slept": sleep_s,
                "echo": payload,
            },
        })
        .to_string();

        let mut script = format!(
            "set -euo pipefail\nsleep {sleep_s}\ncat > {result_path} <<'RESULT_EOF'\n{body}\nRESULT_EOF\n",
            result_path = result_path.display(),
        );

        if let (Some(base_url), Some(secret)) = (&self.result_base_url, &self.result_secret) {
            script.push_str(&format!(
                "sig=$(printf '%s' '{body}' | openssl dgst -sha256 -hmac '{secret}' | awk '{{print $2}}')\n\
                 curl -sf -X POST '{base_url}/v1/task-result' \\\n\
                 \t-H 'Content-Type: application/json' \\\n\
                 \t-H \"x-task-sig: $sig\" \\\n\
                 \t-d '{body}'\n",
            ));
        }

        script
    }

    /// Blocking `sbatch` invocation. Run via `spawn_blocking` from async
    /// contexts — this shells out and waits for the submission to return.
    fn submit(&self, task: &Task, leased_by: &str) -> anyhow::Result<String> {
        let workdir = self.task_dir.join(task.id.to_string());
        std::fs::create_dir_all(&workdir)?;
        let stdout_path = workdir.join("stdout.txt");
        let stderr_path = workdir.join("stderr.txt");
        let result_path = workdir.join("result.json");

        let sleep_s = Self::parse_sleep_seconds(&task.payload);
        let script = self.build_job_script(
            task.id,
            &task.task_type,
            leased_by,
            sleep_s,
            &task.payload,
            &result_path,
        );

        let mut cmd = BlockingCommand::new("sbatch");
        cmd.arg("--parsable")
            .arg("--job-name")
            .arg(format!("taskq_{}", &task.id.to_string()[..8]))
            .arg("--output")
            .arg(&stdout_path)
            .arg("--error")
            .arg(&stderr_path);

        if let Some(node) = self.next_node() {
            cmd.arg("--nodelist").arg(node);
        }

        cmd.arg("--wrap").arg(script);

        let output = cmd.output()?;
        if !output.status.success() {
            anyhow::bail!(
                "sbatch exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let job_id = String::from_utf8(output.stdout)?.trim().to_string();
        Ok(job_id)
    }
}

#[async_trait]
impl BackendAdapter for SlurmBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn supports(&self, task_type: &str) -> bool {
        SUPPORTED_TASK_TYPES.contains(&task_type)
    }

    async fn execute(&self, task: &Task) -> anyhow::Result<ExecutionKind> {
        let leased_by = task
            .leased_by
            .clone()
            .ok_or_else(|| anyhow::anyhow!("submitting a task with no leased_by set"))?;

        // sbatch is a blocking subprocess call; keep it off the async
        // executor's worker threads.
        let this = self.clone();
        let task = task.clone();
        let job_id =
            tokio::task::spawn_blocking(move || this.submit(&task, &leased_by)).await??;

        let poll_job_id = job_id.clone();
        let poll = move || poll_job_state(&poll_job_id);

        Ok(ExecutionKind::Detached(DetachedHandle {
            external_handle: job_id,
            poll: Box::new(poll),
        }))
    }
}

/// Query `sacct` for a job's state; `UNKNOWN` (mapped to [`JobState::Unknown`])
/// on any parse or execution failure, matching the original's defensive
/// fallback — `sacct` often hasn't indexed a just-submitted job yet.
fn poll_job_state(job_id: &str) -> JobState {
    let output = match BlockingCommand::new("sacct")
        .args(["-j", job_id, "--format=State,ExitCode", "-n", "-P"])
        .output()
    {
        Ok(o) if o.status.success() => o,
        _ => return JobState::Unknown,
    };

    let text = String::from_utf8_lossy(&output.stdout);
    let Some(line) = text.lines().find(|l| !l.trim().is_empty()) else {
        return JobState::Unknown;
    };

    let state = line.split('|').next().unwrap_or("").trim();
    map_sacct_state(state)
}

fn map_sacct_state(state: &str) -> JobState {
    match state {
        "PENDING" | "CONFIGURING" => JobState::Pending,
        "RUNNING" | "COMPLETING" => JobState::Running,
        "COMPLETED" | "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" => {
            JobState::Finished
        }
        _ => JobState::Unknown,
    }
}
