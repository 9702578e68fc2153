//! TRAC D.A.P. kernel - the contract layer of the platform core.
//!
//! This crate defines the types and traits shared between the gateway and
//! the orchestration library, with no I/O of its own:
//!
//! - [`config`] - the platform configuration model and file loading
//! - [`cache`] - the job-cache contract (ticket engine semantics)
//! - [`exec`] - the batch-executor contract
//! - [`metadata`] - the metadata DAL contract consumed by the orchestrator
//! - [`auth`] - the token-validation contract consumed by the gateway
//! - [`error`] - crate-level error composition
//!
//! Implementations live in the heavier crates (`tracdap-gateway`,
//! `tracdap-orch`); test doubles implement the same traits in-process.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod exec;
pub mod metadata;

pub use error::{PlatformError, PlatformResult};
