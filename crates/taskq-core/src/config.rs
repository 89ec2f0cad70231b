//! Process-wide configuration, read once from the environment at startup.
//!
//! No global mutable state lives here: callers read the environment once,
//! build a config struct, and thread it through explicitly.

use std::env;

use crate::error::ConfigError;

/// Attempt to load a `.env` file into the process environment. Absence of
/// the file, or of the `dotenvy` crate finding one, is not an error — this
/// is a convenience for local development, never a requirement.
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}

fn required_env(key: &'static str) -> Result<String, ConfigError> {
    load_dotenv();
    env::var(key).map_err(|_| ConfigError::MissingEnv(key))
}

fn optional_env(key: &str) -> Option<String> {
    load_dotenv();
    env::var(key).ok()
}

/// Database connection string. Required everywhere a `TaskStore` is
/// constructed.
pub fn database_url() -> Result<String, ConfigError> {
    required_env("DATABASE_URL")
}

/// Base URL detached workers use to reach the callback ingest, handed to
/// backends that need to tell a submitted job where to report results.
pub fn result_base_url() -> Option<String> {
    optional_env("RESULT_BASE_URL")
}

/// HMAC key shared between the callback ingest and whatever signs result
/// envelopes. Required by `taskq-callback`; a missing secret there means
/// every request fails signature verification, so it's treated as fatal at
/// that process's startup rather than silently accepting no signature.
pub fn result_secret() -> Option<String> {
    optional_env("RESULT_SECRET")
}

/// Scratch directory batch-scheduler backends stage job artifacts under.
pub fn slurm_task_dir() -> String {
    optional_env("SLURM_TASK_DIR").unwrap_or_else(|| "/tmp/taskq".to_string())
}
