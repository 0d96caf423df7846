//! Shutdown signalling for the server process

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{info, warn};

/// Broadcast shutdown notification, shared by clone
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    pub fn shutdown(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            let _ = self.sender.send(());
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Spawn a watcher for Ctrl+C and SIGTERM and return the signal it triggers
pub async fn wait_for_shutdown_signal() -> ShutdownSignal {
    let shutdown = ShutdownSignal::new();
    let trigger = shutdown.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = ctrl_c() => info!("Received Ctrl+C, shutting down"),
            _ = terminate() => info!("Received SIGTERM, shutting down"),
        }
        trigger.shutdown();
    });

    shutdown
}

/// Run `future` until it completes or shutdown is signalled.
///
/// Returns `None` when the future was cancelled.
pub async fn run_with_shutdown<F, T>(future: F, mut shutdown_rx: broadcast::Receiver<()>) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        result = future => Some(result),
        _ = shutdown_rx.recv() => {
            warn!("Shutdown signal received, cancelling operation");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        assert!(!signal.is_shutdown());

        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.shutdown();
        });

        let result = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(result.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        signal.shutdown();
        signal.shutdown();

        assert!(rx.recv().await.is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_shutdown_cancels() {
        let signal = ShutdownSignal::new();
        let rx = signal.subscribe();

        let task = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            42
        };

        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.shutdown();
        });

        assert!(run_with_shutdown(task, rx).await.is_none());
    }

    #[tokio::test]
    async fn test_run_with_shutdown_completes() {
        let signal = ShutdownSignal::new();
        let result = run_with_shutdown(async { 7 }, signal.subscribe()).await;
        assert_eq!(result, Some(7));
    }
}
