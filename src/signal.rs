//! One-shot broadcast cancellation signal.
//!
//! A [`Signal`] starts open and closes at most once. Every clone shares the
//! same state, so the owner can hand clones to any number of observers and
//! close it from anywhere.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture, WaitForCancellationFutureOwned};
use tracing::{info, warn};

/// Closeable, broadcastable cancellation token with no payload.
#[derive(Clone, Default)]
pub struct Signal {
    token: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl Signal {
    /// Create a new open signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the signal, waking every observer.
    ///
    /// Safe to call concurrently and repeatedly. Returns `true` only for the
    /// call that performed the transition.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Whether the signal has been closed.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Future that resolves once the signal is closed.
    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Owned variant of [`Signal::done`] for futures that outlive the borrow.
    pub fn done_owned(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }

    /// Whether two handles refer to the same underlying signal.
    pub fn same_as(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.closed, &other.closed)
    }

    /// Close this signal when the process receives a shutdown signal.
    ///
    /// The watcher task exits as soon as the signal closes for any other
    /// reason, so it never outlives its owner.
    pub fn close_on_shutdown(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal.done() => {}
                _ = shutdown_signal() => {
                    signal.close();
                }
            }
        });
    }
}

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT on Unix).
///
/// If a handler cannot be installed the future never resolves.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let handlers = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    );
    let (mut sigint, mut sigterm, mut sigquit) = match handlers {
        (Ok(int), Ok(term), Ok(quit)) => (int, term, quit),
        _ => {
            warn!("Failed to install shutdown signal handlers");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = sigterm.recv() => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
        _ = sigquit.recv() => {
            info!(message = "Signal received.", signal = "SIGQUIT");
        }
    }
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("Failed to install Ctrl-C handler");
        return std::future::pending().await;
    }
    info!(message = "Signal received.", signal = "Ctrl-C");
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_clones_share_state() {
        let signal = Signal::new();
        let observer = signal.clone();

        assert!(!observer.is_closed());
        signal.close();
        assert!(observer.is_closed());
        assert!(signal.same_as(&observer));
    }

    #[tokio::test]
    async fn test_separate_signals_are_independent() {
        let a = Signal::new();
        let b = Signal::new();

        a.close();

        assert!(!b.is_closed(), "separate signals should not share state");
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_close_is_idempotent() {
        let signal = Signal::new();
        assert!(signal.close());
        assert!(!signal.close());
        assert!(!signal.close());
        assert!(signal.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_close_observed_once() {
        let signal = Signal::new();
        let winners = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(AtomicUsize::new(0));

        let observer = {
            let signal = signal.clone();
            let observed = observed.clone();
            tokio::spawn(async move {
                signal.done().await;
                observed.fetch_add(1, Ordering::SeqCst);
            })
        };

        let closers: Vec<_> = (0..32)
            .map(|_| {
                let signal = signal.clone();
                let winners = winners.clone();
                tokio::spawn(async move {
                    if signal.close() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for closer in closers {
            closer.await.unwrap();
        }
        observer.await.unwrap();

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_done_ready_after_close() {
        let signal = Signal::new();
        signal.close();

        // Late observers see the closed state immediately
        tokio::time::timeout(Duration::from_millis(50), signal.done())
            .await
            .expect("done should resolve for an already closed signal");
        tokio::time::timeout(Duration::from_millis(50), signal.done_owned())
            .await
            .expect("owned done should resolve too");
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_task() {
        let signal = Signal::new();
        let waiter = signal.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = waiter.done() => "closed",
                _ = tokio::time::sleep(Duration::from_secs(10)) => "timeout",
            }
        });

        signal.close();

        let result = tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("task should complete quickly")
            .expect("task should not panic");
        assert_eq!(result, "closed");
    }
}
