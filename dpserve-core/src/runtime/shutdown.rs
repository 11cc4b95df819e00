//! Graceful shutdown handling
//!
//! A [`ShutdownSignal`] fans one shutdown trigger out to every task of the
//! node. [`os_signal`] resolves on SIGINT or SIGTERM.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Shutdown fan-out shared by every long-running task of a node
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            token: CancellationToken::new(),
        }
    }

    /// Trigger shutdown. Repeated calls are no-ops.
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
        self.token.cancel();
    }

    /// Resolves once shutdown has been triggered, including before the call
    pub async fn wait(&self) {
        let mut rx = self.sender.subscribe();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Token cancelled on shutdown, for tasks that select on cancellation
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves when the process receives SIGINT or SIGTERM
pub async fn os_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    {
        tokio::select! {
            () = ctrl_c => tracing::info!("Received SIGINT, draining"),
            () = terminate => tracing::info!("Received SIGTERM, draining"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        tracing::info!("Received Ctrl+C, draining");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal.wait().await;
                42
            })
        };

        signal.shutdown();
        assert_eq!(waiter.await.unwrap(), 42);
        assert!(signal.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns() {
        let signal = ShutdownSignal::new();
        signal.shutdown();
        tokio::time::timeout(Duration::from_millis(50), signal.wait())
            .await
            .unwrap();
    }

    #[test]
    fn os_signal_is_send_future() {
        fn assert_send_future<T: std::future::Future<Output = ()> + Send>(_f: T) {}
        assert_send_future(os_signal());
    }
}
