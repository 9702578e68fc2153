//! Batch execution: sandboxed child processes.
//!
//! The contract lives in [`tracdap_kernel::exec`]; this module provides
//! the local implementation used by single-node deployments.

mod local;

pub use local::LocalBatchExecutor;
