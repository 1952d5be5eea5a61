//! Signal handling.
//!
//! [`ShutdownGuard`] turns SIGINT (Ctrl+C) and, on Unix, SIGTERM into a
//! [`CancellationToken`]. The pipeline and every transport observe the token; on
//! cancellation they kill and reap their workers and return
//! [`StripError::Cancelled`](crate::error::StripError::Cancelled).

use crate::error::StripResult;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cancels a token when the process is asked to stop.
///
/// Dropping the guard stops listening for signals; the token stays valid.
pub struct ShutdownGuard {
    token: CancellationToken,
    listener: JoinHandle<()>,
}

impl ShutdownGuard {
    /// Install signal handlers. Must be called inside a Tokio runtime.
    pub fn install() -> StripResult<Self> {
        let token = CancellationToken::new();

        #[cfg(unix)]
        let listener = {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => warn!("Received SIGTERM - stopping workers"),
                    _ = sigint.recv() => warn!("Received SIGINT - stopping workers"),
                }
                token.cancel();
            })
        };

        #[cfg(not(unix))]
        let listener = {
            let token = token.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("Received Ctrl+C - stopping workers");
                        token.cancel();
                    }
                    Err(e) => warn!(error = %e, "Ctrl+C handler unavailable"),
                }
            })
        };

        Ok(Self { token, listener })
    }

    /// Token cancelled on the first termination signal.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
