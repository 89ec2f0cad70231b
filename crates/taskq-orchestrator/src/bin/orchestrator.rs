//! Orchestrator process entry point. Leases tasks filtered by
//! `--target-backend`, dispatches them to the matching `BackendAdapter`, and
//! runs until idle (demo mode) or forever (real mode).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use taskq_core::{config, telemetry, BackendAdapter};
use taskq_orchestrator::{identity, LocalBackend, LoopConfig, SlurmBackend};
use taskq_postgres::PgTaskStore;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Real,
    Demo,
}

#[derive(Debug, Clone, ValueEnum)]
enum TargetBackend {
    Local,
    Slurm,
    Null,
}

impl TargetBackend {
    fn as_filter(&self) -> Option<&'static str> {
        match self {
            TargetBackend::Local => Some("local"),
            TargetBackend::Slurm => Some("slurm"),
            TargetBackend::Null => None,
        }
    }
}

/// Lease and execute tasks against a single backend.
#[derive(Parser, Debug)]
#[command(name = "taskq-orchestrator")]
struct Args {
    /// real = run forever, demo = exit after an idle period.
    #[arg(long, value_enum, default_value = "real")]
    mode: Mode,

    /// Which backend this process serves, and the `target_backend` filter
    /// it leases with. `null` leases rows with no `target_backend` set.
    #[arg(long, value_enum, default_value = "local")]
    target_backend: TargetBackend,

    /// Demo mode only: exit if no tasks are leased for this many seconds.
    #[arg(long, default_value_t = 10)]
    idle_exit_seconds: u64,

    /// How often to poll the store when the queue is empty.
    #[arg(long, default_value_t = 1.0)]
    poll_seconds: f64,

    /// Reconciliation cadence for detached backends.
    #[arg(long, default_value_t = 2.0)]
    job_poll_seconds: f64,

    /// How long to tolerate a finished external job with no callback.
    #[arg(long, default_value_t = 20)]
    finished_grace_seconds: u64,

    /// Lease duration in seconds, renewed by heartbeats.
    #[arg(long, default_value_t = 120)]
    lease_seconds: i64,

    /// Comma-separated Slurm node list for round-robin placement. Ignored
    /// unless `--target-backend slurm`.
    #[arg(long, default_value = "")]
    rr_nodes: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let args = Args::parse();

    let database_url = match config::database_url() {
        Ok(url) => url,
        Err(e) => {
            eprintln!("[orchestrator] fatal: {e}");
            std::process::exit(1);
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await?;
    let store = PgTaskStore::new(pool);

    let leased_by = identity::new_identity();
    let target_backend = args.target_backend.as_filter();

    let backend: Box<dyn BackendAdapter> = match args.target_backend {
        TargetBackend::Slurm => {
            let rr_nodes: Vec<String> = args
                .rr_nodes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            Box::new(SlurmBackend::new(
                PathBuf::from(config::slurm_task_dir()),
                config::result_base_url(),
                config::result_secret(),
                rr_nodes,
            ))
        }
        TargetBackend::Local | TargetBackend::Null => Box::new(LocalBackend),
    };

    info!(
        leased_by = %leased_by,
        mode = ?args.mode,
        backend = backend.name(),
        target_backend = ?target_backend,
        "starting orchestrator"
    );

    let config = LoopConfig {
        lease_seconds: args.lease_seconds,
        poll_interval: Duration::from_secs_f64(args.poll_seconds),
        job_poll_interval: Duration::from_secs_f64(args.job_poll_seconds),
        finished_grace: Duration::from_secs(args.finished_grace_seconds),
        idle_exit: matches!(args.mode, Mode::Demo)
            .then(|| Duration::from_secs(args.idle_exit_seconds)),
    };

    taskq_orchestrator::run(&store, backend.as_ref(), &leased_by, target_backend, config).await
}
