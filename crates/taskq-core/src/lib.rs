//! # taskq-core
//!
//! Domain types and protocol traits for a distributed task queue with
//! pluggable execution backends.
//!
//! ## Architecture
//!
//! ```text
//! producer INSERTs a queued row
//!        │
//!        ▼
//! TaskStore::lease_one ──► orchestrator ──► BackendAdapter::execute
//!        ▲                      │                 │
//!        │                 heartbeat          Synchronous ─► mark_done/mark_failed
//!        │                      │                 │
//!        │                      ▼                 ▼
//!        │                 (poll store)      Detached(handle, poll)
//!        │                      │                 │
//!        │                      └──── reconciliation loop ────┘
//!        │                                         │
//!        │                              signed callback ─► mark_done/mark_failed
//!        │
//!        └──── TaskStore::requeue_stale (janitor) ── recovers abandoned leases
//! ```
//!
//! The store is the only shared mutable resource and the only rendezvous
//! point between an orchestrator process and a detached worker's callback.
//! Everything in this crate is policy about *that* protocol; the concrete
//! SQL lives in `taskq-postgres`, and the concrete loop lives in
//! `taskq-orchestrator`.
//!
//! ## What this crate is not
//!
//! It does not provide exactly-once execution, strict priority ordering
//! under contention, or push-based work distribution. Workers pull.

pub mod backend;
pub mod config;
pub mod error;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod testing;

pub use backend::{BackendAdapter, DetachedHandle, ExecutionKind, JobState};
pub use error::ConfigError;
pub use store::{CancelOutcome, RequeueReport, TaskStore};
pub use task::{Task, TaskStatus};

pub use async_trait::async_trait;
