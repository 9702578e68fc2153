//! Local batch executor: one OS child process per batch.
//!
//! Each batch owns a sandbox directory `tracdap_<jobKey>_<random>` under
//! the configured batch root (or the OS temp dir), with one subdirectory
//! per declared volume and a `log/` directory capturing
//! `trac_rt_stdout.txt` / `trac_rt_stderr.txt`. The lifecycle is strict:
//! volumes and files before start, reads after terminal status, destroy
//! removes everything unless sandbox persistence is configured.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use tracdap_kernel::config::ExecutorConfig;
use tracdap_kernel::exec::{
    BatchExecutor, BatchInfo, BatchState, BatchStatus, ExecutorError, ExecutorResult, LaunchArg,
    LaunchCmd, VolumeType,
};

/// Name of the log directory created at batch start.
const LOG_DIR: &str = "log";
const STDOUT_FILE: &str = "trac_rt_stdout.txt";
const STDERR_FILE: &str = "trac_rt_stderr.txt";

/// Reserved name prefixes, refused for job keys and volume names.
const RESERVED_PREFIXES: [&str; 2] = ["_", "trac_"];

/// How much of the stderr tail is scanned for an error line.
const STDERR_TAIL_BYTES: u64 = 4096;

/// Local child-process batch executor.
pub struct LocalBatchExecutor {
    batch_root: PathBuf,
    persist_sandboxes: bool,
    inherited_env: Vec<String>,
    batch_env: BTreeMap<String, String>,
    error_line: Regex,
}

impl LocalBatchExecutor {
    /// Create the executor, verifying the batch root. Errors here are
    /// fatal to service start.
    pub fn new(cfg: &ExecutorConfig) -> ExecutorResult<Self> {
        let batch_root = match &cfg.batch_root {
            Some(root) => root.clone(),
            None => std::env::temp_dir(),
        };

        std::fs::create_dir_all(&batch_root).map_err(|e| {
            ExecutorError::Startup(format!(
                "cannot create batch root '{}': {e}",
                batch_root.display()
            ))
        })?;

        let batch_root = Self::verify_ownership(batch_root)?;

        Ok(Self {
            batch_root,
            persist_sandboxes: cfg.persist_sandboxes,
            inherited_env: cfg.inherited_env.clone(),
            batch_env: cfg.batch_env.clone(),
            error_line: Regex::new(r"^\s*\S*(?:Error|Exception)\b.*$").unwrap(),
        })
    }

    pub fn batch_root(&self) -> &Path {
        &self.batch_root
    }

    /// The batch root must belong to the executor's own user. When it does
    /// not (a shared temp dir), repair by claiming a per-user subdirectory.
    #[cfg(unix)]
    fn verify_ownership(batch_root: PathBuf) -> ExecutorResult<PathBuf> {
        use std::os::unix::fs::MetadataExt;

        let uid = nix::unistd::geteuid().as_raw();
        let meta = std::fs::metadata(&batch_root).map_err(|e| {
            ExecutorError::Startup(format!(
                "cannot stat batch root '{}': {e}",
                batch_root.display()
            ))
        })?;
        if meta.uid() == uid {
            return Ok(batch_root);
        }

        let repaired = batch_root.join(format!("tracdap_batches_{uid}"));
        std::fs::create_dir_all(&repaired).map_err(|e| {
            ExecutorError::Startup(format!(
                "batch root '{}' is not owned by this user and cannot be repaired: {e}",
                batch_root.display()
            ))
        })?;
        info!(batch_root = %repaired.display(), "claimed per-user batch root");
        Ok(repaired)
    }

    #[cfg(not(unix))]
    fn verify_ownership(batch_root: PathBuf) -> ExecutorResult<PathBuf> {
        Ok(batch_root)
    }

    fn validate_name(kind: &str, name: &str) -> ExecutorResult<()> {
        if name.is_empty() {
            return Err(ExecutorError::Validation(format!("{kind} name cannot be empty")));
        }
        for prefix in RESERVED_PREFIXES {
            if name.starts_with(prefix) {
                return Err(ExecutorError::Validation(format!(
                    "{kind} name '{name}' uses the reserved prefix '{prefix}'"
                )));
            }
        }
        let mut chars = name.chars();
        let first = chars.next().unwrap();
        let valid = first.is_ascii_alphanumeric()
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
        if !valid {
            return Err(ExecutorError::Validation(format!(
                "{kind} name '{name}' is not a valid identifier"
            )));
        }
        Ok(())
    }

    fn validate_filename(filename: &str) -> ExecutorResult<()> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename == "."
            || filename == ".."
        {
            return Err(ExecutorError::Validation(format!(
                "'{filename}' is not a valid file name"
            )));
        }
        Ok(())
    }

    fn volume_path(state: &BatchState, volume: &str) -> ExecutorResult<PathBuf> {
        if !state.volumes.contains_key(volume) {
            return Err(ExecutorError::Validation(format!(
                "volume '{volume}' is not declared for job '{}'",
                state.job_key
            )));
        }
        Ok(state.sandbox_dir.join(volume))
    }

    fn materialize_args(
        state: &BatchState,
        launch_args: &[LaunchArg],
    ) -> ExecutorResult<Vec<String>> {
        launch_args
            .iter()
            .map(|arg| match arg {
                LaunchArg::Literal(value) => Ok(value.clone()),
                LaunchArg::VolumeFile { volume, file } => {
                    Self::validate_filename(file)?;
                    let path = Self::volume_path(state, volume)?.join(file);
                    Ok(path.to_string_lossy().into_owned())
                }
            })
            .collect()
    }

    fn build_env(&self, state: &BatchState) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for name in &self.inherited_env {
            if let Ok(value) = std::env::var(name) {
                env.insert(name.clone(), value);
            }
        }
        env.extend(self.batch_env.clone());
        env.extend(state.env.clone());
        env
    }

    /// Extract a short message from the stderr tail: the last line matching
    /// the well-known error pattern, falling back to the last non-empty
    /// line.
    fn stderr_tail_message(&self, state: &BatchState) -> Option<String> {
        let path = state.sandbox_dir.join(LOG_DIR).join(STDERR_FILE);
        let content = std::fs::read(&path).ok()?;
        let tail_start = content.len().saturating_sub(STDERR_TAIL_BYTES as usize);
        let tail = String::from_utf8_lossy(&content[tail_start..]).into_owned();

        let mut best: Option<String> = None;
        let mut last_non_empty: Option<String> = None;
        for line in tail.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            last_non_empty = Some(trimmed.to_string());
            if self.error_line.is_match(line) {
                best = Some(trimmed.to_string());
            }
        }
        best.or(last_non_empty)
    }
}

#[async_trait]
impl BatchExecutor for LocalBatchExecutor {
    async fn create_batch(&self, job_key: &str) -> ExecutorResult<BatchState> {
        Self::validate_name("job", job_key)?;

        // A fresh, empty, exclusively-owned directory. Retry on the
        // (unlikely) suffix collision.
        for _ in 0..4 {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect();
            let sandbox = self.batch_root.join(format!("tracdap_{job_key}_{suffix}"));
            match std::fs::create_dir(&sandbox) {
                Ok(()) => {
                    debug!(job = job_key, sandbox = %sandbox.display(), "created batch sandbox");
                    return Ok(BatchState::new(job_key, sandbox));
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(ExecutorError::Access(format!(
                        "cannot create sandbox under '{}': {err}",
                        self.batch_root.display()
                    )));
                }
            }
        }
        Err(ExecutorError::Failure(format!(
            "could not allocate a sandbox directory for job '{job_key}'"
        )))
    }

    async fn create_volume(
        &self,
        mut state: BatchState,
        name: &str,
        volume_type: VolumeType,
    ) -> ExecutorResult<BatchState> {
        if state.status != BatchStatus::Pending {
            return Err(ExecutorError::Validation(
                "volumes may only be created before the batch starts".into(),
            ));
        }
        Self::validate_name("volume", name)?;
        if state.volumes.contains_key(name) {
            return Err(ExecutorError::Validation(format!(
                "volume '{name}' already exists for job '{}'",
                state.job_key
            )));
        }

        let path = state.sandbox_dir.join(name);
        tokio::fs::create_dir(&path).await.map_err(|e| {
            ExecutorError::Access(format!("cannot create volume '{name}': {e}"))
        })?;

        debug!(job = %state.job_key, volume = name, volume_type = ?volume_type, "created volume");
        state.volumes.insert(name.to_string(), volume_type);
        Ok(state)
    }

    async fn write_file(
        &self,
        state: BatchState,
        volume: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> ExecutorResult<BatchState> {
        if state.status != BatchStatus::Pending {
            return Err(ExecutorError::Validation(
                "files may only be written before the batch starts".into(),
            ));
        }
        Self::validate_filename(filename)?;
        let path = Self::volume_path(&state, volume)?.join(filename);

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ExecutorError::Validation(format!(
                "file '{filename}' already exists in volume '{volume}'"
            )));
        }
        tokio::fs::write(&path, content).await.map_err(|e| {
            ExecutorError::Access(format!("cannot write '{filename}' in volume '{volume}': {e}"))
        })?;
        Ok(state)
    }

    async fn start_batch(
        &self,
        mut state: BatchState,
        launch_cmd: LaunchCmd,
        launch_args: Vec<LaunchArg>,
    ) -> ExecutorResult<BatchState> {
        if state.status != BatchStatus::Pending {
            return Err(ExecutorError::Validation(format!(
                "batch for job '{}' has already started",
                state.job_key
            )));
        }

        let args = Self::materialize_args(&state, &launch_args)?;

        let log_dir = state.sandbox_dir.join(LOG_DIR);
        tokio::fs::create_dir_all(&log_dir).await.map_err(|e| {
            ExecutorError::Access(format!("cannot create log directory: {e}"))
        })?;
        let stdout = std::fs::File::create(log_dir.join(STDOUT_FILE))
            .map_err(|e| ExecutorError::Access(format!("cannot create stdout log: {e}")))?;
        let stderr = std::fs::File::create(log_dir.join(STDERR_FILE))
            .map_err(|e| ExecutorError::Access(format!("cannot create stderr log: {e}")))?;

        let child = Command::new(&launch_cmd.command)
            .args(&args)
            .current_dir(&state.sandbox_dir)
            .env_clear()
            .envs(self.build_env(&state))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| {
                ExecutorError::Failure(format!(
                    "cannot start batch process '{}': {e}",
                    launch_cmd.command
                ))
            })?;

        info!(job = %state.job_key, command = %launch_cmd.command, pid = child.id(),
              "batch process started");

        state.pid = Some(child.id());
        state.process = Some(Arc::new(Mutex::new(child)));
        state.status = BatchStatus::Running;
        Ok(state)
    }

    async fn poll_batch(&self, state: &mut BatchState) -> ExecutorResult<BatchInfo> {
        match state.status {
            BatchStatus::Pending => {
                return Ok(BatchInfo {
                    status: BatchStatus::Pending,
                    exit_code: None,
                    error_detail: None,
                });
            }
            status if status.is_terminal() => {
                let error_detail = if status == BatchStatus::Failed {
                    self.stderr_tail_message(state)
                } else {
                    None
                };
                return Ok(BatchInfo { status, exit_code: state.exit_code, error_detail });
            }
            _ => {}
        }

        if let Some(process) = &state.process {
            let exit = {
                let mut child = process.lock().unwrap();
                child.try_wait().map_err(|e| {
                    ExecutorError::Failure(format!("cannot poll batch process: {e}"))
                })?
            };
            match exit {
                None => Ok(BatchInfo {
                    status: BatchStatus::Running,
                    exit_code: None,
                    error_detail: None,
                }),
                Some(exit_status) => {
                    let code = exit_status.code().unwrap_or(-1);
                    state.exit_code = Some(code);
                    state.status =
                        if code == 0 { BatchStatus::Succeeded } else { BatchStatus::Failed };

                    let error_detail = if state.status == BatchStatus::Failed {
                        self.stderr_tail_message(state)
                    } else {
                        None
                    };
                    debug!(job = %state.job_key, exit_code = code, status = ?state.status,
                           "batch process finished");
                    Ok(BatchInfo { status: state.status, exit_code: Some(code), error_detail })
                }
            }
        } else if let Some(pid) = state.pid {
            // A state restored from the cache has no process handle; the
            // exit code of a reaped child is unknowable from here.
            let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok();
            if alive {
                Ok(BatchInfo { status: BatchStatus::Running, exit_code: None, error_detail: None })
            } else {
                state.status = BatchStatus::Unknown;
                Ok(BatchInfo {
                    status: BatchStatus::Unknown,
                    exit_code: None,
                    error_detail: self.stderr_tail_message(state),
                })
            }
        } else {
            Err(ExecutorError::Validation(format!(
                "batch for job '{}' is marked running but has no process",
                state.job_key
            )))
        }
    }

    async fn read_file(
        &self,
        state: &BatchState,
        volume: &str,
        filename: &str,
    ) -> ExecutorResult<Vec<u8>> {
        if !state.status.is_terminal() {
            return Err(ExecutorError::Validation(
                "files may only be read after the batch completes".into(),
            ));
        }
        Self::validate_filename(filename)?;
        let path = Self::volume_path(state, volume)?.join(filename);

        tokio::fs::read(&path).await.map_err(|e| {
            ExecutorError::Access(format!(
                "cannot read file '{filename}' from volume '{volume}': {e}"
            ))
        })
    }

    async fn destroy_batch(&self, state: BatchState) -> ExecutorResult<()> {
        // Force-kill anything still running, then reap it.
        if let Some(process) = &state.process {
            let mut child = process.lock().unwrap();
            if child.try_wait().ok().flatten().is_none() {
                warn!(job = %state.job_key, "killing batch process on destroy");
                child.kill().ok();
                child.wait().ok();
            }
        } else if let Some(pid) = state.pid {
            let pid = nix::unistd::Pid::from_raw(pid as i32);
            if nix::sys::signal::kill(pid, None).is_ok() {
                warn!(job = %state.job_key, "killing batch process on destroy");
                nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).ok();
            }
        }

        if self.persist_sandboxes {
            info!(job = %state.job_key, sandbox = %state.sandbox_dir.display(),
                  "sandbox persistence configured, leaving directory in place");
            return Ok(());
        }

        tokio::fs::remove_dir_all(&state.sandbox_dir).await.map_err(|e| {
            ExecutorError::Access(format!(
                "cannot remove sandbox '{}': {e}",
                state.sandbox_dir.display()
            ))
        })?;
        debug!(job = %state.job_key, "sandbox removed");
        Ok(())
    }
}
