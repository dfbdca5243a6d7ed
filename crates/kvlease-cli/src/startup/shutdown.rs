//! Graceful shutdown handling
//!
//! Ctrl+C or SIGTERM cancels the root token handed to every lock and watch, so
//! waiting acquirers return and held locks are released.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Root cancellation token cancelled on Ctrl+C or SIGTERM
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });

    token
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// Run `future` unless `token` is cancelled first
pub async fn run_until_cancelled<F, T>(future: F, token: &CancellationToken) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        result = future => Some(result),
        _ = token.cancelled() => {
            warn!("Shutdown signal received, cancelling operation");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_until_cancelled_completes() {
        let token = CancellationToken::new();
        assert_eq!(run_until_cancelled(async { 42 }, &token).await, Some(42));
    }

    #[tokio::test]
    async fn test_run_until_cancelled_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result = run_until_cancelled(std::future::pending::<()>(), &token).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_token_starts_live() {
        let token = shutdown_token();
        assert!(!token.is_cancelled());
    }
}
