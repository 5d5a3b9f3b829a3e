//! Supervisor for a single long-lived worker process.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──init/call──▶ Starting ──handshake──▶ Ready ◀──call──┐
//!                                  ▲                      │  └────────┘
//!                                  │                      ▼
//!                                  └──────next call───── Dead
//! ```
//!
//! An incarnation dies when its process exits, when a channel read or write
//! fails, or when a call times out. All three fire the incarnation's
//! [`CancellationToken`]; the next call observes it and starts a fresh
//! process. Restarts are unconditional: there is no backoff.
//!
//! # Thread Safety
//!
//! Calls are serialized by a tokio `Mutex` around the incarnation. The wire
//! protocol has no call identifiers, so at most one request may be in flight
//! on a channel at any time.

use super::spawn;
use crate::cancel::CancellationToken;
use crate::channel::{self, DuplexChannel, Frame};
use crate::config::{BridgeConfig, WorkerConfig};
use crate::error::{FrameError, FrameStage, PoolError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::net::unix::pipe;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Observable state of a [`Worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No process has been started yet.
    Uninitialized,
    /// A process is being spawned or is completing its handshake.
    Starting,
    /// The current process completed its handshake and has not died.
    Ready,
    /// The current process is gone; the next call restarts it.
    Dead,
    /// `close()` was called; calls are rejected.
    Closed,
}

/// One spawned process and the parent side of its channel.
struct Incarnation {
    number: u64,
    pid: Option<u32>,
    reader: pipe::Receiver,
    writer: pipe::Sender,
    lifecycle: CancellationToken,
    watcher: JoinHandle<()>,
    // Held so the worker's stdin stays open for the incarnation's lifetime.
    _stdin: Option<ChildStdin>,
}

/// Lifecycle handle of the current incarnation, readable without the call lock.
#[derive(Clone)]
struct LiveHandle {
    pid: Option<u32>,
    lifecycle: CancellationToken,
}

/// Keeps one worker process available for calls, restarting it after failure.
pub struct Worker {
    index: usize,
    config: WorkerConfig,
    slot: Mutex<Option<Incarnation>>,
    live: StdMutex<Option<LiveHandle>>,
    starting: AtomicBool,
    closed: AtomicBool,
    incarnations: AtomicU64,
}

impl Worker {
    /// Create a supervisor. No process is started until `init` or the first call.
    pub fn new(index: usize, config: WorkerConfig) -> Self {
        Self {
            index,
            config,
            slot: Mutex::new(None),
            live: StdMutex::new(None),
            starting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            incarnations: AtomicU64::new(0),
        }
    }

    /// Index of this worker within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Number of processes started so far (successful or not).
    pub fn incarnations(&self) -> u64 {
        self.incarnations.load(Ordering::SeqCst)
    }

    /// PID of the current process, if one is alive.
    pub fn pid(&self) -> Option<u32> {
        self.live_handle()
            .filter(|live| !live.lifecycle.is_cancelled())
            .and_then(|live| live.pid)
    }

    /// Current state, observed without waiting for an in-flight call.
    pub fn state(&self) -> WorkerState {
        if self.closed.load(Ordering::SeqCst) {
            return WorkerState::Closed;
        }
        if self.starting.load(Ordering::SeqCst) {
            return WorkerState::Starting;
        }
        match self.live_handle() {
            None => WorkerState::Uninitialized,
            Some(live) if live.lifecycle.is_cancelled() => WorkerState::Dead,
            Some(_) => WorkerState::Ready,
        }
    }

    /// The cause recorded when the current incarnation died.
    pub fn death_cause(&self) -> Option<String> {
        self.live_handle()
            .and_then(|live| live.lifecycle.cause())
            .map(|cause| cause.to_string())
    }

    fn live_handle(&self) -> Option<LiveHandle> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_live(&self, live: Option<LiveHandle>) {
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = live;
    }

    /// Start the process if it is not running, returning its PID.
    ///
    /// An existing live process is left alone. Handshake failures are
    /// returned to the caller and not retried.
    pub async fn init(&self) -> Result<Option<u32>> {
        let mut slot = self.slot.lock().await;
        let incarnation = self.ensure_started(&mut slot).await?;
        Ok(incarnation.pid)
    }

    async fn ensure_started<'a>(
        &self,
        slot: &'a mut Option<Incarnation>,
    ) -> Result<&'a mut Incarnation> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed { worker: self.index });
        }

        let incarnation = match slot.take() {
            Some(current) if !current.lifecycle.is_cancelled() => current,
            previous => {
                if let Some(dead) = previous {
                    warn!(
                        "Worker {} process dead ({}), restarting",
                        self.index,
                        dead.lifecycle
                            .cause()
                            .as_deref()
                            .unwrap_or("unknown cause")
                    );
                }
                self.starting.store(true, Ordering::SeqCst);
                let started = self.start().await;
                self.starting.store(false, Ordering::SeqCst);
                started?
            }
        };

        Ok(slot.insert(incarnation))
    }

    async fn start(&self) -> Result<Incarnation> {
        let number = self.incarnations.fetch_add(1, Ordering::SeqCst) + 1;

        let mut channel = DuplexChannel::create().map_err(|e| PoolError::Channel {
            message: format!("failed initialising process communication pipe: {}", e),
            source: Some(e),
        })?;
        let child_fds = channel.child_fds().ok_or_else(|| PoolError::Channel {
            message: "child ends of the channel are missing".to_string(),
            source: None,
        })?;

        let mut child = spawn::spawn_process(self.index, &self.config, child_fds)?;

        // The child holds its own copies now; dropping ours lets us see EOF
        // when it dies.
        let errors = channel.close_child_ends();
        if !errors.is_empty() {
            debug!(
                "Errors closing child ends of worker {} channel: {:?}",
                self.index, errors
            );
        }

        let lifecycle = CancellationToken::new();
        let pid = child.id();
        let stdin = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(spawn::drain_stream(
                self.index,
                "stdout",
                stdout,
                lifecycle.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(spawn::drain_stream(
                self.index,
                "stderr",
                stderr,
                lifecycle.clone(),
            ));
        }
        let watcher = tokio::spawn(spawn::watch_exit(self.index, child, lifecycle.clone()));

        self.set_live(Some(LiveHandle {
            pid,
            lifecycle: lifecycle.clone(),
        }));

        let (reader, writer) = match open_parent_ends(&mut channel) {
            Ok(ends) => ends,
            Err(e) => {
                lifecycle.cancel_with_cause(e.to_string());
                return Err(e);
            }
        };
        let mut incarnation = Incarnation {
            number,
            pid,
            reader,
            writer,
            lifecycle,
            watcher,
            _stdin: stdin,
        };

        info!("Waiting for worker {} ready signal", self.index);
        if let Err(e) = self.handshake(&mut incarnation).await {
            incarnation.lifecycle.cancel_with_cause(e.to_string());
            return Err(e);
        }

        info!(
            "Worker {} ready (pid {:?}, incarnation {})",
            self.index, pid, number
        );
        Ok(incarnation)
    }

    async fn handshake(&self, incarnation: &mut Incarnation) -> Result<()> {
        let lifecycle = incarnation.lifecycle.clone();
        let timeout = self.config.startup_timeout;

        let outcome = tokio::select! {
            biased;
            cause = lifecycle.cancelled() => Err(cause.to_string()),
            read = tokio::time::timeout(timeout, channel::read_handshake(&mut incarnation.reader)) => {
                match read {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(format!("failed to read 'ready' signal: {}", e)),
                    Err(_) => Err(format!("no 'ready' signal within {:?}", timeout)),
                }
            }
        };

        outcome.map_err(|message| {
            // EOF on the handshake usually means the process died; say why.
            let message = match lifecycle.cause() {
                Some(cause) if !message.contains(&*cause) => format!("{} ({})", message, cause),
                _ => message,
            };
            PoolError::Handshake {
                worker: self.index,
                message,
            }
        })
    }

    /// Send a raw call and return the raw result payload.
    ///
    /// Starts or restarts the process first if needed. Transport failures,
    /// timeouts and process death retire the current incarnation.
    pub async fn call_raw(&self, function: &str, payload: &[u8]) -> Result<Vec<u8>> {
        // Checked up front: nothing is written, so the worker stays alive.
        let limit = self.config.max_payload_len;
        if function.len() > limit || payload.len() > limit {
            return Err(PoolError::Encode {
                function: function.to_string(),
                message: format!(
                    "call of {} + {} bytes exceeds the {} byte payload limit",
                    function.len(),
                    payload.len(),
                    limit
                ),
            });
        }

        let mut slot = self.slot.lock().await;
        let incarnation = self.ensure_started(&mut slot).await?;
        let lifecycle = incarnation.lifecycle.clone();
        let timeout = self.config.call_timeout;
        let worker = self.index;

        debug!(
            "Worker {} calling '{}' ({} byte argument)",
            worker,
            function,
            payload.len()
        );

        let exchange = async {
            channel::write_frame(&mut incarnation.writer, function.as_bytes())
                .await
                .map_err(|source| PoolError::Transport { worker, source })?;
            channel::write_frame(&mut incarnation.writer, payload)
                .await
                .map_err(|source| PoolError::Transport { worker, source })?;

            match tokio::time::timeout(timeout, channel::read_frame(&mut incarnation.reader)).await
            {
                Err(_) => Err(PoolError::Timeout {
                    worker,
                    function: function.to_string(),
                    timeout,
                }),
                Ok(Ok(Some(Frame::Data(result)))) => Ok(result),
                Ok(Ok(Some(Frame::End))) => Err(PoolError::Transport {
                    worker,
                    source: FrameError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "worker sent end signal instead of a result",
                    )),
                }),
                Ok(Ok(None)) => Err(PoolError::Transport {
                    worker,
                    source: FrameError::Truncated {
                        stage: FrameStage::Header,
                        expected: 4,
                        actual: 0,
                    },
                }),
                Ok(Err(source)) => Err(PoolError::Transport { worker, source }),
            }
        };

        let outcome = tokio::select! {
            biased;
            cause = lifecycle.cancelled() => Err(PoolError::WorkerDied {
                worker,
                cause: cause.to_string(),
            }),
            result = exchange => result,
        };

        if let Some(e) = outcome.as_ref().err().filter(|e| e.retires_worker()) {
            // The channel is in an unknown state after these.
            if lifecycle.cancel_with_cause(e.to_string()) {
                warn!("Worker {} retired: {}", worker, e);
            }
        }
        outcome
    }

    /// Call `function` with a JSON-encoded argument and decode the JSON result.
    ///
    /// Encoding and decoding failures, and errors reported by the worker,
    /// leave the process running.
    pub async fn call<T, A>(&self, function: &str, argument: &A) -> Result<T>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let payload = encode_argument(function, argument)?;
        let response = self.call_raw(function, &payload).await?;
        decode_result(function, &response)
    }

    /// Stop the current process and reject further calls.
    ///
    /// An in-flight call fails with `WorkerDied`. Waits up to
    /// `BridgeConfig::SHUTDOWN_TIMEOUT` for the process to be reaped.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(live) = self.live_handle() {
            live.lifecycle.cancel_with_cause("worker closed");
        }

        let incarnation = self.slot.lock().await.take();
        if let Some(incarnation) = incarnation {
            incarnation.lifecycle.cancel_with_cause("worker closed");
            let number = incarnation.number;
            drop(incarnation.reader);
            drop(incarnation.writer);
            match tokio::time::timeout(BridgeConfig::SHUTDOWN_TIMEOUT, incarnation.watcher).await {
                Ok(_) => debug!("Worker {} incarnation {} stopped", self.index, number),
                Err(_) => warn!(
                    "Worker {} process did not stop within {:?}",
                    self.index,
                    BridgeConfig::SHUTDOWN_TIMEOUT
                ),
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(live) = self.live_handle() {
            live.lifecycle.cancel_with_cause("worker dropped");
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .field("incarnations", &self.incarnations())
            .finish()
    }
}

fn open_parent_ends(channel: &mut DuplexChannel) -> Result<(pipe::Receiver, pipe::Sender)> {
    let (read, write) = channel.take_parent_ends().ok_or_else(|| PoolError::Channel {
        message: "parent ends of the channel are missing".to_string(),
        source: None,
    })?;
    let reader = pipe::Receiver::from_file(File::from(read)).map_err(|e| PoolError::Channel {
        message: format!("registering channel read end: {}", e),
        source: Some(e),
    })?;
    let writer = pipe::Sender::from_file(File::from(write)).map_err(|e| PoolError::Channel {
        message: format!("registering channel write end: {}", e),
        source: Some(e),
    })?;
    Ok((reader, writer))
}

fn encode_argument<A: Serialize + ?Sized>(function: &str, argument: &A) -> Result<Vec<u8>> {
    serde_json::to_vec(argument).map_err(|e| PoolError::Encode {
        function: function.to_string(),
        message: e.to_string(),
    })
}

fn decode_result<T: DeserializeOwned>(function: &str, response: &[u8]) -> Result<T> {
    let value: serde_json::Value =
        serde_json::from_slice(response).map_err(|e| PoolError::Decode {
            function: function.to_string(),
            message: format!("unmarshalling result from child process: {}", e),
        })?;

    if let Some(message) = channel::remote_error(&value) {
        return Err(PoolError::Remote {
            function: function.to_string(),
            message,
        });
    }

    serde_json::from_value(value).map_err(|e| PoolError::Decode {
        function: function.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_worker_is_uninitialized() {
        let worker = Worker::new(0, WorkerConfig::new("/bin/true", "/tmp", "main.py"));
        assert_eq!(worker.state(), WorkerState::Uninitialized);
        assert_eq!(worker.incarnations(), 0);
        assert!(worker.pid().is_none());
        assert!(worker.death_cause().is_none());
    }

    #[test]
    fn test_decode_result_plain_value() {
        let value: i64 = decode_result("add_scalar_output", b"11").unwrap();
        assert_eq!(value, 11);
    }

    #[test]
    fn test_decode_result_remote_error() {
        let err = decode_result::<serde_json::Value>(
            "nope",
            br#"{"_error": "unknown function 'nope'"}"#,
        )
        .unwrap_err();
        match err {
            PoolError::Remote { function, message } => {
                assert_eq!(function, "nope");
                assert_eq!(message, "unknown function 'nope'");
            }
            other => panic!("Expected Remote, got: {:?}", other),
        }
    }

    #[test]
    fn test_decode_result_malformed_json() {
        let err = decode_result::<serde_json::Value>("f", b"{not json").unwrap_err();
        assert!(matches!(err, PoolError::Decode { .. }));
        assert!(!err.retires_worker());
    }

    #[test]
    fn test_decode_result_type_mismatch() {
        #[derive(serde::Deserialize, Debug)]
        struct AddResult {
            #[allow(dead_code)]
            result: i64,
        }
        let err = decode_result::<AddResult>("add_scalar_output", b"11").unwrap_err();
        assert!(matches!(err, PoolError::Decode { .. }));
    }

    #[test]
    fn test_encode_argument() {
        let payload = encode_argument("add", &json!({"a": 5, "b": 6})).unwrap();
        assert_eq!(payload, br#"{"a":5,"b":6}"#);
    }

    #[tokio::test]
    async fn test_closed_worker_rejects_calls() {
        let worker = Worker::new(3, WorkerConfig::new("/bin/true", "/tmp", "main.py"));
        worker.close().await;
        assert_eq!(worker.state(), WorkerState::Closed);

        let err = worker.call_raw("add", b"{}").await.unwrap_err();
        assert!(matches!(err, PoolError::Closed { worker: 3 }));
        assert_eq!(worker.incarnations(), 0);
    }

    #[tokio::test]
    async fn test_oversized_call_rejected_before_start() {
        let config = WorkerConfig::new("/bin/true", "/tmp", "main.py").with_max_payload_len(8);
        let worker = Worker::new(0, config);

        let err = worker.call_raw("identity", &[0u8; 9]).await.unwrap_err();
        assert!(matches!(err, PoolError::Encode { .. }), "{:?}", err);
        assert!(!err.retires_worker());
        let err = worker.call_raw("a_long_function_name", b"{}").await.unwrap_err();
        assert!(matches!(err, PoolError::Encode { .. }), "{:?}", err);

        assert_eq!(worker.incarnations(), 0);
        assert_eq!(worker.state(), WorkerState::Uninitialized);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_setup_error() {
        let worker = Worker::new(
            0,
            WorkerConfig::new("/nonexistent/interpreter", "/tmp", "main.py"),
        );
        let err = worker.init().await.unwrap_err();
        assert!(matches!(err, PoolError::Spawn { .. }));
        assert_eq!(worker.incarnations(), 1);
    }

    #[tokio::test]
    async fn test_exit_before_handshake_is_handshake_error() {
        // `sh main.py` fails immediately because the script does not exist.
        let dir = tempfile::TempDir::new().unwrap();
        let worker = Worker::new(0, WorkerConfig::new("/bin/sh", dir.path(), "main.py"));
        let err = worker.init().await.unwrap_err();
        assert!(matches!(err, PoolError::Handshake { .. }), "{:?}", err);
        assert_eq!(worker.state(), WorkerState::Dead);
    }
}
