//! Operator cancellation
//!
//! A [`CancelToken`] is shared between the Ctrl-C handler and the running sweep. Triggering it
//! never interrupts an instrument command in flight; the sweep notices it at its next check or
//! wakes early from a delay, and then tears down the hardware.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// A shared flag for signaling cancellation across tasks.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<watch::Sender<bool>>,
    reason: Arc<std::sync::RwLock<Option<String>>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create an untriggered token.
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
            reason: Arc::new(std::sync::RwLock::new(None)),
        }
    }

    /// Request cancellation. Only the first reason is kept.
    pub fn cancel(&self, reason: impl Into<String>) {
        if let Ok(mut r) = self.reason.write() {
            if r.is_none() {
                *r = Some(reason.into());
            }
        }
        self.state.send_replace(true);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Why cancellation was requested.
    pub fn reason(&self) -> Option<String> {
        self.reason.read().ok().and_then(|r| r.clone())
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only returns on cancellation.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Wait for `duration`, waking early on cancellation.
    ///
    /// Returns `true` if the full delay elapsed without cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_cancelled(),
            _ = self.cancelled() => false,
        }
    }

    /// Cancel on the first Ctrl-C.
    ///
    /// Further Ctrl-C presses are swallowed, so teardown cannot be interrupted from the keyboard.
    pub fn cancel_on_ctrl_c(&self) -> JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Keyboard interrupt received");
                    token.cancel("keyboard interrupt");
                }
                Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_keeps_first_reason() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());

        token.cancel("keyboard interrupt");
        token.cancel("second");
        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("keyboard interrupt"));
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let handle = token.clone();
        handle.cancel("test");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_sleep_completes_without_cancel() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(5)).await);
        assert!(token.sleep(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_sleep_wakes_on_cancel() {
        let token = CancelToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel("test");
        });

        let started = std::time::Instant::now();
        assert!(!token.sleep(Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sleep_after_cancel_returns_immediately() {
        let token = CancelToken::new();
        token.cancel("test");
        assert!(!token.sleep(Duration::from_secs(30)).await);
    }
}
