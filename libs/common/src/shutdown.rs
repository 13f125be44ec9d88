//! Process termination signals
//!
//! The proxy stops on SIGINT (Ctrl+C) or SIGTERM. [`wait_for_shutdown`]
//! reports which of the two arrived so the stop reason ends up in the log.

use std::fmt;

use tracing::warn;

/// Signal that asked the process to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Ctrl+C on the console
    Interrupt,
    /// Service manager stop request
    Terminate,
}

impl ShutdownSignal {
    pub fn name(self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolve once a termination signal arrives
///
/// A handler that cannot be installed is logged and never fires; the other
/// signal still works.
pub async fn wait_for_shutdown() -> ShutdownSignal {
    tokio::select! {
        () = interrupt() => ShutdownSignal::Interrupt,
        () = terminate() => ShutdownSignal::Terminate,
    }
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        },
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        },
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
