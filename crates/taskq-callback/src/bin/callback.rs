//! Callback ingest process entry point.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use taskq_callback::{router_from_config, CallbackConfig};
use taskq_core::{config, telemetry, TaskStore};
use taskq_postgres::PgTaskStore;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let database_url = match config::database_url() {
        Ok(url) => url,
        Err(e) => {
            eprintln!("[callback] fatal: {e}");
            std::process::exit(1);
        }
    };

    let secret = config::result_secret().unwrap_or_default();
    if secret.is_empty() {
        eprintln!("[callback] fatal: RESULT_SECRET is required to verify callbacks");
        std::process::exit(1);
    }

    let config = CallbackConfig {
        bind_addr: std::env::var("CALLBACK_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        secret,
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await?;
    let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool));

    let app = router_from_config(&config, store);

    info!(bind_addr = %config.bind_addr, "starting callback ingest");
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
