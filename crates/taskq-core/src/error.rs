//! The small set of named error kinds raised at process boundaries.
//! Everywhere else (store ops, orchestrator loop, callback handlers)
//! propagates `anyhow::Result` — named enums only at the seams a caller
//! needs to match on, `anyhow` everywhere else.

use thiserror::Error;

/// Misconfiguration at startup: fatal, with a diagnostic message. The
/// process exits non-zero rather than attempting to run degraded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is missing from the environment")]
    MissingEnv(&'static str),
}
