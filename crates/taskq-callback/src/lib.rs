//! The signed HTTP callback ingest: the endpoint through which detached
//! backend workers finalize a task without the orchestrator ever waiting on
//! them directly.
//!
//! ```text
//! detached worker ──POST /v1/task-result (HMAC-signed)──► this service
//!                                                              │
//!                                               verify signature (constant-time)
//!                                                              │
//!                                      mark_done / mark_failed(retry=false)
//! ```
//!
//! The `leased_by` precondition inside the store operations (not anything in
//! this crate) is what stops a delayed callback from a prior leaseholder
//! incarnation from clobbering a row that has since been reassigned — this
//! service has no notion of "current" leaseholder at all.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use taskq_core::TaskStore;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Process-wide config for this service, read once at startup.
#[derive(Clone)]
pub struct CallbackConfig {
    pub bind_addr: String,
    pub secret: String,
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn TaskStore>,
    secret: String,
}

/// Build the axum router: `GET /healthz` and `POST /v1/task-result`.
pub fn router(store: Arc<dyn TaskStore>, secret: String) -> Router {
    let state = AppState { store, secret };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/task-result", post(task_result))
        .with_state(state)
}

/// Build the router from a [`CallbackConfig`]. `bind_addr` is read by the
/// caller, not by this crate — `router` doesn't bind sockets.
pub fn router_from_config(config: &CallbackConfig, store: Arc<dyn TaskStore>) -> Router {
    router(store, config.secret.clone())
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

#[derive(Debug, Deserialize)]
struct ResultEnvelope {
    task_id: Uuid,
    leased_by: String,
    ok: bool,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResultResponse {
    ok: bool,
    status: &'static str,
}

const SIGNATURE_HEADER: &str = "x-task-sig";

async fn task_result(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let Some(sig_hex) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return bad_signature();
    };

    if !verify_signature(state.secret.as_bytes(), &body, sig_hex) {
        return bad_signature();
    }

    let envelope: ResultEnvelope = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "malformed task-result envelope");
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"ok": false, "error": "malformed body"})))
                .into_response();
        }
    };

    let status = if envelope.ok {
        let result = envelope.result.unwrap_or_else(|| serde_json::json!({"ok": true}));
        state
            .store
            .mark_done(envelope.task_id, &envelope.leased_by, result)
            .await
            .ok();
        "done"
    } else {
        let error = envelope.error.unwrap_or_else(|| "unknown error".to_string());
        state
            .store
            .mark_failed(envelope.task_id, &envelope.leased_by, &error, false)
            .await
            .ok();
        "failed"
    };

    info!(task_id = %envelope.task_id, leased_by = %envelope.leased_by, status, "callback applied");

    (StatusCode::OK, Json(ResultResponse { ok: true, status })).into_response()
}

fn bad_signature() -> axum::response::Response {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"ok": false, "error": "bad signature"})))
        .into_response()
}

/// Verify `sig_hex` is the hex HMAC-SHA256 of `body` keyed by `secret`.
/// `Mac::verify_slice` compares in constant time, so no hand-rolled
/// comparison is needed here.
fn verify_signature(secret: &[u8], body: &[u8], sig_hex: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
