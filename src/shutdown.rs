//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is cloned into every long-running component (the
//! scheduler loop, the HTTP server). When SIGINT/SIGTERM arrives, or
//! [`ShutdownSignal::trigger`] is called, every clone observes it.
//!
//! # Example
//!
//! ```rust,ignore
//! use beacon::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//!
//! let scheduler_shutdown = shutdown.clone();
//! tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });
//!
//! // Resolves on Ctrl+C / SIGTERM and notifies every clone.
//! shutdown.listen().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Default time allowed for components to wind down.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    /// Set once, never cleared
    triggered: Arc<AtomicBool>,
    grace_period: Duration,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Wait for SIGINT or SIGTERM, then notify every clone.
    pub async fn listen(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Could not install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Could not install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
            _ = self.triggered() => return,
        }

        self.notify();
    }

    /// Subscribe to the raw notification channel.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger shutdown programmatically.
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.notify();
    }

    /// Resolves once shutdown has been triggered, including when it already
    /// was before this call.
    pub async fn triggered(&self) {
        let mut receiver = self.sender.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = receiver.recv().await;
    }

    /// Wait for shutdown, giving up after `timeout`.
    ///
    /// Returns `true` if shutdown was triggered in time.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        tokio::select! {
            _ = self.triggered() => true,
            _ = tokio::time::sleep(timeout) => {
                warn!(timeout_secs = timeout.as_secs(), "Shutdown wait timed out");
                false
            }
        }
    }

    fn notify(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
