//! Launching a worker process and the background tasks that watch it.

use crate::cancel::CancellationToken;
use crate::config::{BridgeConfig, WorkerConfig};
use crate::error::{PoolError, Result};
use std::os::fd::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Descriptors at or above this number are free for staging in the child.
const STAGING_FD_FLOOR: RawFd = 10;

/// Build and spawn the worker command.
///
/// The child's standard streams are piped, and `child_fds` (`(read, write)`)
/// are re-installed as `BridgeConfig::CHILD_READ_FD` / `CHILD_WRITE_FD`.
pub(crate) fn spawn_process(
    worker: usize,
    config: &WorkerConfig,
    child_fds: (RawFd, RawFd),
) -> Result<Child> {
    let mut cmd = Command::new(&config.executable);
    cmd.arg(&config.entry_script);
    cmd.args(&config.extra_args);
    cmd.current_dir(&config.working_dir);

    // Set environment variables
    for (key, value) in &config.env_vars {
        cmd.env(key, value);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    install_channel_fds(&mut cmd, child_fds);

    debug!(
        "Starting worker {}: working dir: {}, executable: {}, script: {}",
        worker,
        config.working_dir.display(),
        config.executable.display(),
        config.entry_script.display()
    );

    cmd.spawn().map_err(|e| PoolError::Spawn {
        worker,
        message: format!("failed to start {}: {}", config.executable.display(), e),
        source: Some(e),
    })
}

#[allow(unsafe_code)]
fn install_channel_fds(cmd: &mut Command, (read_fd, write_fd): (RawFd, RawFd)) {
    let targets = [
        (read_fd, BridgeConfig::CHILD_READ_FD),
        (write_fd, BridgeConfig::CHILD_WRITE_FD),
    ];

    // SAFETY: the closure runs in the forked child before exec and only calls
    // fcntl and dup2, which are async-signal-safe. It does not allocate.
    unsafe {
        cmd.pre_exec(move || {
            // Copy both sources above the target range first, so a source that
            // already sits on 3 or 4 is not overwritten by the other dup2.
            let mut staged = [0 as RawFd; 2];
            for (slot, (source, _)) in staged.iter_mut().zip(targets.iter()) {
                let fd = libc::fcntl(*source, libc::F_DUPFD_CLOEXEC, STAGING_FD_FLOOR);
                if fd == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                *slot = fd;
            }
            // dup2 clears close-on-exec on the target, the staged copies keep it.
            for (staged_fd, (_, target)) in staged.iter().zip(targets.iter()) {
                if libc::dup2(*staged_fd, *target) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

/// Describe why a worker process ended.
///
/// A live worker must never exit on its own, so a clean exit is reported
/// as a death like any other.
pub(crate) fn describe_exit(status: ExitStatus) -> String {
    if let Some(signal) = status.signal() {
        return format!("worker process terminated by signal {}", signal);
    }
    match status.code() {
        Some(0) => "worker process exited cleanly while still expected to be alive".to_string(),
        Some(code) => format!("worker process ended with bad exit code {}", code),
        None => format!("worker process ended: {}", status),
    }
}

/// Wait for the process to exit, or kill it when the incarnation is cancelled.
pub(crate) async fn watch_exit(worker: usize, mut child: Child, lifecycle: CancellationToken) {
    tokio::select! {
        status = child.wait() => {
            let cause = match status {
                Ok(status) => describe_exit(status),
                Err(e) => format!("waiting on worker process failed: {}", e),
            };
            if lifecycle.cancel_with_cause(cause.clone()) {
                warn!("Worker {} died: {}", worker, cause);
            }
        }
        cause = lifecycle.cancelled() => {
            debug!("Stopping worker {} process: {}", worker, cause);
            if let Err(e) = child.kill().await {
                debug!("Killing worker {} process: {}", worker, e);
            }
        }
    }
}

/// Forward a standard stream of the worker to the log, line by line.
///
/// Runs until end-of-stream. Once the incarnation is cancelled the drain
/// keeps going for at most `BridgeConfig::LOG_DRAIN_GRACE` so a dying
/// worker's last words still reach the log.
pub(crate) async fn drain_stream<R>(
    worker: usize,
    stream: &'static str,
    reader: R,
    lifecycle: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    tokio::select! {
        _ = forward_lines(worker, stream, &mut lines) => return,
        _ = lifecycle.cancelled() => {}
    }

    let _ = tokio::time::timeout(
        BridgeConfig::LOG_DRAIN_GRACE,
        forward_lines(worker, stream, &mut lines),
    )
    .await;
}

async fn forward_lines<R>(worker: usize, stream: &str, lines: &mut tokio::io::Lines<BufReader<R>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!("worker {} {}: {}", worker, stream, line),
            Ok(None) => break,
            Err(e) => {
                debug!("Error consuming worker {} {}: {}", worker, stream, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_describe_exit() {
        assert_eq!(
            describe_exit(ExitStatus::from_raw(0)),
            "worker process exited cleanly while still expected to be alive"
        );
        // Wait status encoding: exit code in the high byte.
        assert_eq!(
            describe_exit(ExitStatus::from_raw(3 << 8)),
            "worker process ended with bad exit code 3"
        );
        assert_eq!(
            describe_exit(ExitStatus::from_raw(libc::SIGKILL)),
            format!("worker process terminated by signal {}", libc::SIGKILL)
        );
    }

    #[tokio::test]
    async fn test_watch_exit_records_cause() {
        let child = Command::new("sh")
            .args(["-c", "exit 7"])
            .spawn()
            .unwrap();
        let lifecycle = CancellationToken::new();

        tokio::time::timeout(
            Duration::from_secs(5),
            watch_exit(0, child, lifecycle.clone()),
        )
        .await
        .unwrap();

        assert_eq!(
            lifecycle.cause().as_deref(),
            Some("worker process ended with bad exit code 7")
        );
    }

    #[tokio::test]
    async fn test_watch_exit_kills_on_cancel() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let lifecycle = CancellationToken::new();
        let watcher = tokio::spawn(watch_exit(0, child, lifecycle.clone()));

        lifecycle.cancel_with_cause("closing");
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher should finish after kill")
            .unwrap();
        assert_eq!(lifecycle.cause().as_deref(), Some("closing"));
    }

    #[tokio::test]
    async fn test_drain_stream_finishes_at_eof() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let drain = tokio::spawn(drain_stream(0, "stdout", rx, CancellationToken::new()));

        tokio::io::AsyncWriteExt::write_all(&mut tx, b"line one\nline two\n")
            .await
            .unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), drain)
            .await
            .unwrap()
            .unwrap();
    }
}
