//! Client-facing listener
//!
//! One accept loop for the life of the process. Every accepted connection
//! becomes a [`ClientSession`] feeding the single shared request queue.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::session::ClientSession;
use crate::stats::ProxyStats;
use crate::upstream::RequestSender;

pub struct Listener {
    listener: TcpListener,
    requests: RequestSender,
    stats: Arc<ProxyStats>,
}

impl Listener {
    /// Bind the first of `addresses` that succeeds; failure is fatal for the caller
    pub async fn bind(
        addresses: &[String],
        requests: RequestSender,
        stats: Arc<ProxyStats>,
    ) -> ProxyResult<Self> {
        let mut last_error = None;
        for address in addresses {
            match TcpListener::bind(address.as_str()).await {
                Ok(listener) => {
                    let local_addr = listener.local_addr()?;
                    info!(localaddr = %local_addr, "Listening for connections");
                    return Ok(Self {
                        listener,
                        requests,
                        stats,
                    });
                },
                Err(source) => {
                    warn!("Failed to bind {}: {}", address, source);
                    last_error = Some(ProxyError::Bind {
                        address: address.clone(),
                        source,
                    });
                },
            }
        }

        Err(last_error.unwrap_or_else(|| ProxyError::config("no listen address configured")))
    }

    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown
    ///
    /// An accept error ends the loop and is returned.
    pub async fn run(self, shutdown: CancellationToken) -> ProxyResult<()> {
        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Listener received shutdown signal");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = accepted.map_err(ProxyError::Accept)?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }

            info!(client = %peer, "Accepted connection");
            ClientSession::new(stream, peer, self.requests.clone(), self.stats.clone()).spawn();
        }
    }
}
