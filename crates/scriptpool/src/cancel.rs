//! One-shot cancellation token carrying a cause.
//!
//! Each worker incarnation owns one token. The exit watcher, the log drains
//! and any in-flight call all hold clones; whichever side observes the end of
//! the incarnation first fires it with a description of why. Once fired a
//! token stays fired. A new incarnation gets a new token.

use std::sync::Arc;
use tokio::sync::watch;

/// A cancellation token for cooperative cancellation of async operations.
///
/// This token can be cloned and shared across tasks. When any clone is
/// cancelled, all clones observe the cancellation and the first cause wins.
///
/// # Example
///
/// ```
/// use scriptpool::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let token_clone = token.clone();
///
/// assert!(token_clone.cancel_with_cause("process exited with status code 1"));
/// assert!(!token.cancel_with_cause("ignored"));
/// assert_eq!(token.cause().as_deref(), Some("process exited with status code 1"));
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<watch::Sender<Option<Arc<str>>>>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { state: Arc::new(tx) }
    }

    /// Request cancellation with a generic cause.
    pub fn cancel(&self) -> bool {
        self.cancel_with_cause("cancelled")
    }

    /// Request cancellation, recording `cause`.
    ///
    /// Returns `true` if this call fired the token, `false` if it had
    /// already been cancelled (the earlier cause is kept).
    pub fn cancel_with_cause(&self, cause: impl Into<String>) -> bool {
        let cause: Arc<str> = Arc::from(cause.into());
        self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
            true
        })
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// The cause recorded when the token fired.
    pub fn cause(&self) -> Option<Arc<str>> {
        self.state.borrow().clone()
    }

    /// Wait until the token fires and return its cause.
    ///
    /// Cancel safe: dropping the future has no side effects.
    pub async fn cancelled(&self) -> Arc<str> {
        let mut rx = self.state.subscribe();
        let cause = match rx.wait_for(|cause| cause.is_some()).await {
            Ok(cause) => cause.clone().unwrap_or_else(|| Arc::from("cancelled")),
            // The sender lives in `self`, so the channel cannot close under us.
            Err(_) => Arc::from("cancelled"),
        };
        cause
    }

    /// Check cancellation and return an error if cancelled.
    pub fn check(&self) -> Result<(), CancelledError> {
        match self.cause() {
            Some(cause) => Err(CancelledError(cause)),
            None => Ok(()),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned when an operation is cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelledError(pub Arc<str>);

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation was cancelled: {}", self.0)
    }
}

impl std::error::Error for CancelledError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cause().is_none());
    }

    #[test]
    fn test_cancel() {
        let token = CancellationToken::new();
        assert!(token.cancel());
        assert!(token.is_cancelled());
        assert_eq!(token.cause().as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_first_cause_wins() {
        let token = CancellationToken::new();
        assert!(token.cancel_with_cause("first"));
        assert!(!token.cancel_with_cause("second"));
        assert_eq!(token.cause().as_deref(), Some("first"));
    }

    #[test]
    fn test_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel_with_cause("gone");

        assert!(token2.is_cancelled());
        assert_eq!(token2.cause().as_deref(), Some("gone"));
    }

    #[test]
    fn test_check() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.cancel_with_cause("stop");
        let err = token.check().unwrap_err();
        assert_eq!(err.to_string(), "Operation was cancelled: stop");
    }

    #[tokio::test]
    async fn test_cancelled_resolves_for_waiters() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel_with_cause("worker exited");

        let cause = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(&*cause, "worker exited");
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_fired() {
        let token = CancellationToken::new();
        token.cancel_with_cause("early");
        let cause = token.cancelled().await;
        assert_eq!(&*cause, "early");
    }
}
