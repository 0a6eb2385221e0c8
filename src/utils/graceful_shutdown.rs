use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use eyre::{Result, WrapErr};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Why the process is stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Triggered from inside the process
    Requested,
}

/// Coordinates shutdown of the listeners and background sync tasks.
///
/// Every long-running task holds a clone of [`GracefulShutdown::token`] and stops
/// when it is cancelled. In-flight requests get `drain_timeout` to complete.
pub struct GracefulShutdown {
    token: CancellationToken,
    shutdown_initiated: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a manager with a 30-second drain timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            drain_timeout,
        }
    }

    /// Token cancelled once shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!(?reason, "Shutdown initiated");
            self.token.cancel();
        } else {
            tracing::warn!(?reason, "Shutdown already initiated, ignoring signal");
        }
    }

    /// Wait for SIGINT or SIGTERM and trigger shutdown.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        let reason = tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for SIGINT")?;
                ShutdownReason::Interrupt
            }
            result = wait_for_sigterm() => {
                result?;
                ShutdownReason::Terminate
            }
            _ = self.token.cancelled() => return Ok(()),
        };

        self.trigger_shutdown(reason);
        Ok(())
    }

    /// Resolves once shutdown has been triggered by any source.
    pub async fn wait_for_shutdown_signal(&self) {
        self.token.cancelled().await
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("Failed to register SIGTERM handler")?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_graceful_shutdown_creation() {
        let shutdown = GracefulShutdown::new();
        assert!(!shutdown.is_shutdown_initiated());
        assert!(!shutdown.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_trigger_cancels_every_token() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_secs(1));
        let first = shutdown.token();
        let second = shutdown.token();

        shutdown.trigger_shutdown(ShutdownReason::Requested);
        assert!(shutdown.is_shutdown_initiated());
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());

        // Second trigger is a no-op.
        shutdown.trigger_shutdown(ShutdownReason::Terminate);
        shutdown.wait_for_shutdown_signal().await;
    }

    #[tokio::test]
    async fn test_signal_handler_returns_after_manual_trigger() {
        let shutdown = Arc::new(GracefulShutdown::new());
        let handler = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.run_signal_handler().await })
        };
        shutdown.trigger_shutdown(ShutdownReason::Requested);
        tokio::time::timeout(Duration::from_secs(2), handler)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
