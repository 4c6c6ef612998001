//! Signal-driven cancellation for CLI operations.
//!
//! SIGINT or SIGTERM cancels the operation token. A cancelled backup is
//! removed from storage; a cancelled restore leaves the data directory
//! marked as incomplete.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled when a shutdown signal arrives
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel the token on the first SIGINT or SIGTERM. Returns when either
    /// a signal arrived or the token was cancelled by someone else.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), cancelling operation...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling operation...");
            }
            _ = self.token.cancelled() => return,
        }

        self.token.cancel();
    }

    /// Stop listening for signals once the operation has finished.
    pub fn finish(&self) {
        self.token.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
