//! Janitor CLI: prints stale leased/running counts, then reclaims them if
//! `--yes` is passed.

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use taskq_core::config;
use taskq_postgres::PgTaskStore;

/// Requeue tasks abandoned by a dead leaseholder.
#[derive(Parser, Debug)]
#[command(name = "taskq-janitor")]
struct Args {
    /// Running tasks with a heartbeat older than this are requeued.
    #[arg(long, default_value_t = 600)]
    running_stale_seconds: i64,

    /// Actually apply the requeue. Without this flag, only counts are printed.
    #[arg(long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let database_url = match config::database_url() {
        Ok(url) => url,
        Err(e) => {
            eprintln!("[janitor] fatal: {e}");
            std::process::exit(1);
        }
    };

    let pool = PgPoolOptions::new().max_connections(2).connect(&database_url).await?;
    let store = PgTaskStore::new(pool);

    let preview = store.count_stale(args.running_stale_seconds).await?;
    println!(
        "[janitor] stale leased: {}, stale running: {}",
        preview.leased_requeued, preview.running_requeued
    );

    if !args.yes {
        println!("[janitor] dry-run only. Add --yes to apply.");
        return Ok(());
    }

    let report = taskq_janitor::run_janitor(&store, args.running_stale_seconds).await?;
    println!("[janitor] requeued leased: {}", report.leased_requeued);
    println!("[janitor] requeued running: {}", report.running_requeued);

    Ok(())
}
