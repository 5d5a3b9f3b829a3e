//! Worker-side runtime for Rust programs.
//!
//! The counterpart of [`crate::Worker`]: writes the handshake, then answers
//! name/argument frame pairs with one result frame each until the parent
//! closes the channel or sends the end signal.

use crate::channel::{self, Frame};
use crate::config::BridgeConfig;
use crate::error::FrameError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

type Handler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

/// Registry of callable functions plus the request loop.
#[derive(Default)]
pub struct WorkerRuntime {
    handlers: HashMap<String, Handler>,
}

impl WorkerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one.
    ///
    /// The argument is decoded from JSON into `A` and the return value
    /// encoded back. An `Err` is sent to the caller as a remote error.
    pub fn register<A, R, F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R, String> + Send + Sync + 'static,
    {
        let handler: Handler = Box::new(move |payload: &[u8]| {
            let argument: A = serde_json::from_slice(payload)
                .map_err(|e| format!("invalid argument: {}", e))?;
            let result = handler(argument)?;
            serde_json::to_vec(&result).map_err(|e| format!("unencodable result: {}", e))
        });
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Answer a single call.
    pub fn dispatch(&self, function: &str, payload: &[u8]) -> Vec<u8> {
        let outcome = match self.handlers.get(function) {
            Some(handler) => handler(payload),
            None => Err(format!("unknown function '{}'", function)),
        };
        outcome.unwrap_or_else(|message| channel::error_response(&message))
    }

    /// Run the request loop on the given channel ends.
    ///
    /// Returns `Ok(())` on clean end-of-stream or the end signal.
    pub async fn serve<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<(), FrameError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        channel::write_handshake(writer).await?;

        loop {
            let name = match channel::read_frame(reader).await? {
                Some(Frame::Data(name)) => name,
                Some(Frame::End) | None => return Ok(()),
            };
            let payload = match channel::read_frame(reader).await? {
                Some(Frame::Data(payload)) => payload,
                Some(Frame::End) | None => {
                    return Err(FrameError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "channel ended between function name and argument",
                    )))
                }
            };

            let response = match std::str::from_utf8(&name) {
                Ok(function) => {
                    debug!("Serving '{}' ({} bytes)", function, payload.len());
                    self.dispatch(function, &payload)
                }
                Err(_) => channel::error_response("function name is not valid UTF-8"),
            };
            channel::write_frame(writer, &response).await?;
        }
    }

    /// Run the request loop on the inherited descriptors 3 and 4.
    pub async fn serve_inherited(&self) -> Result<(), FrameError> {
        let (mut reader, mut writer) = inherited_channel()?;
        self.serve(&mut reader, &mut writer).await
    }
}

#[allow(unsafe_code)]
fn inherited_channel(
) -> Result<(tokio::net::unix::pipe::Receiver, tokio::net::unix::pipe::Sender), FrameError> {
    use std::os::fd::{FromRawFd, OwnedFd};

    // SAFETY: the supervisor installs both descriptors before exec and nothing
    // else in this process claims them.
    let (read, write) = unsafe {
        (
            OwnedFd::from_raw_fd(BridgeConfig::CHILD_READ_FD),
            OwnedFd::from_raw_fd(BridgeConfig::CHILD_WRITE_FD),
        )
    };
    let reader = tokio::net::unix::pipe::Receiver::from_file(std::fs::File::from(read))?;
    let writer = tokio::net::unix::pipe::Sender::from_file(std::fs::File::from(write))?;
    Ok((reader, writer))
}
