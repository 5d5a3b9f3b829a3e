//! Centralized configuration for scriptpool.
//!
//! `BridgeConfig` holds fixed protocol and timing constants. `PoolConfig` and
//! `WorkerConfig` describe how worker processes are launched.

use crate::error::{PoolError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Protocol constants and default timings.
pub struct BridgeConfig;

impl BridgeConfig {
    /// Maximum time to wait for a call's result frame.
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);
    /// Maximum time from spawn to the handshake.
    pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
    /// How long `close()` waits for a killed process to be reaped.
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
    /// How long log drains keep reading after the incarnation ends.
    pub const LOG_DRAIN_GRACE: Duration = Duration::from_secs(1);

    /// Descriptor the worker reads requests from.
    pub const CHILD_READ_FD: i32 = 3;
    /// Descriptor the worker writes the handshake and results to.
    pub const CHILD_WRITE_FD: i32 = 4;

    /// Literal the worker writes (unframed) once it is ready for calls.
    pub const HANDSHAKE: &'static [u8] = b"ready";

    /// Reserved length prefix marking an explicit end of data.
    pub const END_SIGNAL_LEN: u32 = u32::MAX;
    /// Largest payload an ordinary frame may carry.
    pub const MAX_FRAME_LEN: usize = (u32::MAX - 1) as usize;
}

/// Launch configuration for a single worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interpreter executable.
    pub executable: PathBuf,
    /// Working directory the worker runs in (the materialized workspace).
    pub working_dir: PathBuf,
    /// Entry-point script, relative to `working_dir`.
    pub entry_script: PathBuf,
    /// Arguments passed after the entry script.
    pub extra_args: Vec<String>,
    /// Environment variables added to the inherited environment.
    pub env_vars: HashMap<String, String>,
    /// Per-call result timeout.
    pub call_timeout: Duration,
    /// Handshake timeout.
    pub startup_timeout: Duration,
    /// Largest function name or argument a call may send.
    pub max_payload_len: usize,
}

impl WorkerConfig {
    pub fn new(
        executable: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        entry_script: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executable: executable.into(),
            working_dir: working_dir.into(),
            entry_script: entry_script.into(),
            extra_args: Vec::new(),
            env_vars: HashMap::new(),
            call_timeout: BridgeConfig::CALL_TIMEOUT,
            startup_timeout: BridgeConfig::STARTUP_TIMEOUT,
            max_payload_len: BridgeConfig::MAX_FRAME_LEN,
        }
    }

    /// Set the call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the startup timeout.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Lower the per-call payload limit. Values above the frame limit are clamped.
    pub fn with_max_payload_len(mut self, len: usize) -> Self {
        self.max_payload_len = len.min(BridgeConfig::MAX_FRAME_LEN);
        self
    }
}

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Interpreter executable (absolute path).
    pub executable: PathBuf,
    /// Entry-point script within the script bundle.
    pub entry_script: PathBuf,
    /// Number of worker processes.
    pub workers: usize,
    /// Arguments passed after the entry script.
    pub extra_args: Vec<String>,
    /// Environment variables added to every worker.
    pub env_vars: HashMap<String, String>,
    /// Per-call result timeout.
    pub call_timeout: Duration,
    /// Handshake timeout.
    pub startup_timeout: Duration,
    /// Largest function name or argument a call may send.
    pub max_payload_len: usize,
    /// Directory the temporary workspace is created in (system temp dir if unset).
    pub workspace_root: Option<PathBuf>,
}

impl PoolConfig {
    /// Create a pool config with default timeouts.
    pub fn new(
        executable: impl Into<PathBuf>,
        entry_script: impl Into<PathBuf>,
        workers: usize,
    ) -> Self {
        Self {
            executable: executable.into(),
            entry_script: entry_script.into(),
            workers,
            extra_args: Vec::new(),
            env_vars: HashMap::new(),
            call_timeout: BridgeConfig::CALL_TIMEOUT,
            startup_timeout: BridgeConfig::STARTUP_TIMEOUT,
            max_payload_len: BridgeConfig::MAX_FRAME_LEN,
            workspace_root: None,
        }
    }

    /// Add an extra argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Set the call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the startup timeout.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Lower the per-call payload limit. Values above the frame limit are clamped.
    pub fn with_max_payload_len(mut self, len: usize) -> Self {
        self.max_payload_len = len.min(BridgeConfig::MAX_FRAME_LEN);
        self
    }

    /// Create the temporary workspace under `root` instead of the system temp dir.
    pub fn with_workspace_root(mut self, root: impl AsRef<Path>) -> Self {
        self.workspace_root = Some(root.as_ref().to_path_buf());
        self
    }

    /// Check the configuration before any resources are allocated.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PoolError::Config {
                message: "pool needs at least one worker".to_string(),
            });
        }
        if self.entry_script.as_os_str().is_empty() {
            return Err(PoolError::Config {
                message: "entry script must not be empty".to_string(),
            });
        }
        if self.call_timeout.is_zero() || self.startup_timeout.is_zero() {
            return Err(PoolError::Config {
                message: "timeouts must be greater than zero".to_string(),
            });
        }
        if !self.executable.is_file() {
            return Err(PoolError::ExecutableNotFound(self.executable.clone()));
        }
        Ok(())
    }

    /// Launch configuration for a worker running in `working_dir`.
    pub fn worker_config(&self, working_dir: impl Into<PathBuf>) -> WorkerConfig {
        WorkerConfig {
            executable: self.executable.clone(),
            working_dir: working_dir.into(),
            entry_script: self.entry_script.clone(),
            extra_args: self.extra_args.clone(),
            env_vars: self.env_vars.clone(),
            call_timeout: self.call_timeout,
            startup_timeout: self.startup_timeout,
            max_payload_len: self.max_payload_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_executable(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("interp");
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = PoolConfig::new("/usr/bin/python3", "main.py", 2);
        assert_eq!(config.call_timeout, Duration::from_secs(10));
        assert_eq!(config.startup_timeout, BridgeConfig::STARTUP_TIMEOUT);
        assert!(config.workspace_root.is_none());
    }

    #[test]
    fn test_builder() {
        let config = PoolConfig::new("/usr/bin/python3", "main.py", 2)
            .with_arg("-u")
            .with_env("OMP_NUM_THREADS", "1")
            .with_call_timeout(Duration::from_millis(500));

        assert_eq!(config.extra_args, vec!["-u".to_string()]);
        assert_eq!(
            config.env_vars.get("OMP_NUM_THREADS"),
            Some(&"1".to_string())
        );
        assert_eq!(config.call_timeout, Duration::from_millis(500));

        let worker = config.worker_config("/tmp/ws");
        assert_eq!(worker.working_dir, PathBuf::from("/tmp/ws"));
        assert_eq!(worker.call_timeout, Duration::from_millis(500));
        assert_eq!(worker.extra_args, config.extra_args);
        assert_eq!(worker.max_payload_len, BridgeConfig::MAX_FRAME_LEN);
    }

    #[test]
    fn test_max_payload_len_is_clamped() {
        let config = PoolConfig::new("/usr/bin/python3", "main.py", 1).with_max_payload_len(64);
        assert_eq!(config.worker_config("/tmp/ws").max_payload_len, 64);

        let worker = WorkerConfig::new("/usr/bin/python3", "/tmp/ws", "main.py")
            .with_max_payload_len(usize::MAX);
        assert_eq!(worker.max_payload_len, BridgeConfig::MAX_FRAME_LEN);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let dir = TempDir::new().unwrap();
        let config = PoolConfig::new(fake_executable(&dir), "main.py", 0);
        assert!(matches!(config.validate(), Err(PoolError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_missing_executable() {
        let config = PoolConfig::new("/nonexistent/interpreter", "main.py", 1);
        assert!(matches!(
            config.validate(),
            Err(PoolError::ExecutableNotFound(_))
        ));
    }

    #[test]
    fn test_validate_rejects_directory_executable() {
        let dir = TempDir::new().unwrap();
        let config = PoolConfig::new(dir.path(), "main.py", 1);
        assert!(matches!(
            config.validate(),
            Err(PoolError::ExecutableNotFound(_))
        ));
    }

    #[test]
    fn test_validate_accepts_good_config() {
        let dir = TempDir::new().unwrap();
        let config = PoolConfig::new(fake_executable(&dir), "main.py", 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_protocol_constants() {
        assert_eq!(BridgeConfig::HANDSHAKE.len(), 5);
        assert_eq!(BridgeConfig::MAX_FRAME_LEN as u64, u64::from(u32::MAX) - 1);
        assert_ne!(BridgeConfig::CHILD_READ_FD, BridgeConfig::CHILD_WRITE_FD);
    }
}
