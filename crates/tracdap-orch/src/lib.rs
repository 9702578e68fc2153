//! TRAC D.A.P. orchestration library (`lib-orch`).
//!
//! Two subsystems used by orchestrator workers:
//!
//! - [`cache`] - the SQL-backed job cache: a revision-numbered
//!   `key -> {revision, status, value}` store with per-key exclusive write
//!   tickets, mutual exclusion enforced by a unique index so it holds
//!   across contending workers and process restarts.
//! - [`exec`] - the local batch executor: sandboxed child-process batches
//!   with named volumes, captured stdout/stderr, status polling and
//!   cleanup.
//!
//! Both implement contracts from `tracdap-kernel`; in-process test doubles
//! implement the same traits.

pub mod cache;
pub mod exec;

pub use cache::SqlJobCache;
pub use exec::LocalBatchExecutor;
