//! Batch-executor contract.
//!
//! A batch is one sandboxed child process: an exclusively-owned working
//! directory, named volumes underneath it, captured stdout/stderr, and a
//! strict lifecycle. Files may be written only before the process starts
//! and read only after it reaches a terminal status. The executor process
//! shares no memory with its batches.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Child;
use std::sync::{Arc, Mutex};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Batch-executor errors. `Startup` is fatal to service start; everything
/// else is per-batch and never affects other batches.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The executor cannot start (bad batch root, missing permissions).
    #[error("executor startup error: {0}")]
    Startup(String),

    /// The caller broke a lifecycle or naming rule.
    #[error("batch validation error: {0}")]
    Validation(String),

    /// A file or directory access was refused.
    #[error("batch access error: {0}")]
    Access(String),

    /// The batch itself failed in a way the executor could not handle.
    #[error("batch failure: {0}")]
    Failure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for executor operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

// ─────────────────────────────────────────────────────────────────────────────
// Batch state
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl BatchStatus {
    /// True for statuses after which files may be read.
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Succeeded | BatchStatus::Failed)
    }
}

/// Declared purpose of a volume. Types have no behavioural difference
/// beyond auditing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeType {
    Config,
    Result,
    Log,
}

/// State of one batch, passed through the executor's lifecycle calls.
///
/// The state is a serializable value the orchestrator may store in the job
/// cache between polls; the live process handle is a transient field and is
/// never persisted (a deserialized state polls by PID only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    pub job_key: String,
    pub sandbox_dir: PathBuf,
    /// OS process id, set once the batch starts.
    pub pid: Option<u32>,
    /// Declared volumes by name.
    pub volumes: BTreeMap<String, VolumeType>,
    pub status: BatchStatus,
    pub exit_code: Option<i32>,
    /// Environment applied to the child over the inherited set.
    pub env: BTreeMap<String, String>,
    /// Live child handle. Transient: skipped by serde, absent after a
    /// round trip through the cache.
    #[serde(skip)]
    pub process: Option<Arc<Mutex<Child>>>,
}

impl BatchState {
    pub fn new(job_key: impl Into<String>, sandbox_dir: PathBuf) -> Self {
        Self {
            job_key: job_key.into(),
            sandbox_dir,
            pid: None,
            volumes: BTreeMap::new(),
            status: BatchStatus::Pending,
            exit_code: None,
            env: BTreeMap::new(),
            process: None,
        }
    }
}

/// Snapshot returned by a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub status: BatchStatus,
    pub exit_code: Option<i32>,
    /// Short message extracted from the stderr tail on failure.
    pub error_detail: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Launch command
// ─────────────────────────────────────────────────────────────────────────────

/// The executable a batch runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCmd {
    pub command: String,
}

impl LaunchCmd {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }
}

/// One launch argument, materialized at start time. Path arguments resolve
/// against their named volume inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaunchArg {
    Literal(String),
    VolumeFile { volume: String, file: String },
}

impl LaunchArg {
    pub fn literal(value: impl Into<String>) -> Self {
        LaunchArg::Literal(value.into())
    }

    pub fn path(volume: impl Into<String>, file: impl Into<String>) -> Self {
        LaunchArg::VolumeFile { volume: volume.into(), file: file.into() }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Executor trait
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle contract for sandboxed child-process batches.
///
/// Volumes are created before the process starts; files are written only
/// before start and read only after terminal status; the sandbox directory
/// is created empty and removed on destroy unless persistence is
/// configured.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// Create an empty sandbox for `job_key` under the configured batch
    /// root (or the OS temp dir).
    async fn create_batch(&self, job_key: &str) -> ExecutorResult<BatchState>;

    /// Create a named volume directory under the sandbox.
    async fn create_volume(
        &self,
        state: BatchState,
        name: &str,
        volume_type: VolumeType,
    ) -> ExecutorResult<BatchState>;

    /// Write a file into a volume. Only legal before the process starts;
    /// fails if the volume is unknown or the file already exists.
    async fn write_file(
        &self,
        state: BatchState,
        volume: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> ExecutorResult<BatchState>;

    /// Materialize arguments, set up log capture and start the child
    /// process. Records the OS PID in the returned state.
    async fn start_batch(
        &self,
        state: BatchState,
        launch_cmd: LaunchCmd,
        launch_args: Vec<LaunchArg>,
    ) -> ExecutorResult<BatchState>;

    /// Check the process: RUNNING while alive, SUCCEEDED / FAILED once it
    /// terminates, with the stderr tail parsed for a short error message on
    /// failure.
    async fn poll_batch(&self, state: &mut BatchState) -> ExecutorResult<BatchInfo>;

    /// Read a file from a volume. Only legal after terminal status.
    async fn read_file(
        &self,
        state: &BatchState,
        volume: &str,
        filename: &str,
    ) -> ExecutorResult<Vec<u8>>;

    /// Force-kill the process if still running and remove the sandbox
    /// (unless persistence is configured).
    async fn destroy_batch(&self, state: BatchState) -> ExecutorResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(BatchStatus::Succeeded.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(!BatchStatus::Running.is_terminal());
        assert!(!BatchStatus::Pending.is_terminal());
        assert!(!BatchStatus::Unknown.is_terminal());
    }

    #[test]
    fn process_handle_is_transient() {
        let state = BatchState::new("job-1", PathBuf::from("/tmp/sandbox"));
        let json = serde_json::to_string(&state).unwrap();
        assert!(!json.contains("process"));

        let restored: BatchState = serde_json::from_str(&json).unwrap();
        assert!(restored.process.is_none());
        assert_eq!(restored.job_key, "job-1");
    }
}
