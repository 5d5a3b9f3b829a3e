//! Pair of anonymous pipes forming one bidirectional link.

#[cfg(not(target_vendor = "apple"))]
use nix::fcntl::OFlag;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use tracing::{debug, warn};

/// Two unidirectional pipes between a parent and a child that does not exist yet.
///
/// ```text
/// parent_write ──▶ child_read     (requests)
/// parent_read  ◀── child_write    (handshake and results)
/// ```
///
/// All four descriptors are created close-on-exec; the spawner re-installs
/// the child ends at fixed descriptor numbers for the child only. A handle
/// handed out by [`take_parent_ends`](Self::take_parent_ends) is owned by the
/// caller from then on, and every handle still held is closed exactly once.
#[derive(Debug)]
pub struct DuplexChannel {
    parent_read: Option<OwnedFd>,
    parent_write: Option<OwnedFd>,
    child_read: Option<OwnedFd>,
    child_write: Option<OwnedFd>,
}

impl DuplexChannel {
    /// Create both pipes.
    ///
    /// If the second pipe cannot be created the first one is closed before
    /// the error is returned.
    pub fn create() -> io::Result<Self> {
        let (child_read, parent_write) = cloexec_pipe()?;
        let (parent_read, child_write) = match cloexec_pipe() {
            Ok(pair) => pair,
            Err(e) => {
                let mut errors = Vec::new();
                close_fd(&mut Some(child_read), &mut errors);
                close_fd(&mut Some(parent_write), &mut errors);
                for err in errors {
                    warn!("Closing half-created channel: {}", err);
                }
                return Err(e);
            }
        };

        Ok(Self {
            parent_read: Some(parent_read),
            parent_write: Some(parent_write),
            child_read: Some(child_read),
            child_write: Some(child_write),
        })
    }

    /// Raw descriptors of the child ends as `(read, write)`.
    ///
    /// Returns `None` once either child end has been closed.
    pub fn child_fds(&self) -> Option<(RawFd, RawFd)> {
        match (&self.child_read, &self.child_write) {
            (Some(read), Some(write)) => Some((read.as_raw_fd(), write.as_raw_fd())),
            _ => None,
        }
    }

    /// Hand the parent ends to the caller as `(read, write)`.
    pub fn take_parent_ends(&mut self) -> Option<(OwnedFd, OwnedFd)> {
        match (self.parent_read.take(), self.parent_write.take()) {
            (Some(read), Some(write)) => Some((read, write)),
            (read, write) => {
                self.parent_read = read;
                self.parent_write = write;
                None
            }
        }
    }

    /// Close the child ends held by this process.
    ///
    /// Called once the child has inherited them, so that the parent sees
    /// end-of-stream when the child goes away.
    pub fn close_child_ends(&mut self) -> Vec<io::Error> {
        let mut errors = Vec::new();
        close_fd(&mut self.child_read, &mut errors);
        close_fd(&mut self.child_write, &mut errors);
        errors
    }

    /// Close every handle still held, returning each failure.
    pub fn close(&mut self) -> Vec<io::Error> {
        let mut errors = Vec::with_capacity(4);
        close_fd(&mut self.parent_write, &mut errors);
        close_fd(&mut self.child_write, &mut errors);
        close_fd(&mut self.parent_read, &mut errors);
        close_fd(&mut self.child_read, &mut errors);
        errors
    }

    /// Number of handles not yet closed or handed out.
    pub fn open_handles(&self) -> usize {
        [
            &self.parent_read,
            &self.parent_write,
            &self.child_read,
            &self.child_write,
        ]
        .iter()
        .filter(|fd| fd.is_some())
        .count()
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        let errors = self.close();
        if !errors.is_empty() {
            debug!("Errors closing duplex channel pipes: {:?}", errors);
        }
    }
}

fn close_fd(slot: &mut Option<OwnedFd>, errors: &mut Vec<io::Error>) {
    if let Some(fd) = slot.take() {
        if let Err(e) = nix::unistd::close(fd.into_raw_fd()) {
            errors.push(e.into());
        }
    }
}

/// Create a pipe whose ends are close-on-exec from the start, so a process
/// spawned concurrently on another thread cannot inherit them.
#[cfg(not(target_vendor = "apple"))]
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe2(OFlag::O_CLOEXEC)?)
}

// No pipe2 on Apple platforms; the flag is set right after creation.
#[cfg(target_vendor = "apple")]
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let (read, write) = nix::unistd::pipe()?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}
