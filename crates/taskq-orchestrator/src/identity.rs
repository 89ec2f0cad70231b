//! Per-process leaseholder identity: `"{hostname}:{uuid}"`, assigned once at
//! startup and reused for every store operation the process performs.

use uuid::Uuid;

/// Build a fresh leaseholder identity. Falls back to `"unknown-host"` if the
/// hostname can't be read as valid UTF-8.
pub fn new_identity() -> String {
    let host = gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("{host}:{}", Uuid::new_v4())
}
