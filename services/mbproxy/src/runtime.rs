//! Runtime orchestration
//!
//! Wires the listener, the upstream manager and the eviction sweep together
//! around one shared request queue and one translation table.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::listener::Listener;
use crate::reconnect::ReconnectPolicy;
use crate::stats::ProxyStats;
use crate::transaction_table::TransactionTable;
use crate::upstream::{request_queue, UpstreamManager, UpstreamTarget};

/// Handle to a running proxy
pub struct ProxyRuntime {
    local_addr: SocketAddr,
    stats: Arc<ProxyStats>,
    table: Arc<TransactionTable>,
    shutdown: CancellationToken,
    listener: Option<JoinHandle<ProxyResult<()>>>,
    upstream: Option<JoinHandle<ProxyResult<()>>>,
    eviction: Option<JoinHandle<()>>,
}

/// Start the proxy
///
/// Startup order: validate configuration, bind the listener, connect upstream.
/// Any failure here is returned and meant to end the process; once this
/// returns, upstream failures are retried internally.
pub async fn start_proxy(config: &ProxyConfig) -> ProxyResult<ProxyRuntime> {
    config.validate()?;

    let stats = Arc::new(ProxyStats::new());
    let table = Arc::new(TransactionTable::new());
    let (requests_tx, requests_rx) = request_queue(config.queue.request_capacity);

    let listener = Listener::bind(&config.listen_addresses(), requests_tx, stats.clone()).await?;
    let local_addr = listener.local_addr()?;

    let manager = UpstreamManager::new(
        UpstreamTarget::from_config(config),
        ReconnectPolicy::from(&config.upstream.reconnect),
        table.clone(),
        stats.clone(),
    );
    let upstream_span = info_span!("upstream", server = %config.upstream.address);
    let initial = manager
        .connect()
        .instrument(upstream_span.clone())
        .await?;

    let shutdown = CancellationToken::new();

    let upstream = tokio::spawn(
        manager
            .run(initial, requests_rx, shutdown.clone())
            .instrument(upstream_span),
    );
    let eviction = start_eviction_task(
        table.clone(),
        stats.clone(),
        config.staleness(),
        config.sweep_interval(),
        shutdown.clone(),
    );
    let listener = tokio::spawn(listener.run(shutdown.clone()));

    info!(
        "Proxy started: {} -> {}",
        local_addr, config.upstream.address
    );

    Ok(ProxyRuntime {
        local_addr,
        stats,
        table,
        shutdown,
        listener: Some(listener),
        upstream: Some(upstream),
        eviction: Some(eviction),
    })
}

/// Periodically evict translation entries nobody answered
pub fn start_eviction_task(
    table: Arc<TransactionTable>,
    stats: Arc<ProxyStats>,
    staleness: Duration,
    sweep_interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + sweep_interval, sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = table.evict_stale(Instant::now(), staleness);
                    if evicted > 0 {
                        stats.record_evicted(evicted);
                        info!(
                            "Deleted {} unanswered request(s) older than {:?}; {}",
                            evicted,
                            staleness,
                            stats.snapshot()
                        );
                    }
                }
                () = shutdown.cancelled() => {
                    debug!("Eviction task received cancellation signal, shutting down");
                    break;
                }
            }
        }
    })
}

impl ProxyRuntime {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        self.stats.clone()
    }

    pub fn table(&self) -> Arc<TransactionTable> {
        self.table.clone()
    }

    /// Wait for the accept loop or the upstream manager to end
    ///
    /// Neither stops on its own while the proxy is healthy, so any return
    /// before shutdown is an error: an accept failure, or an upstream manager
    /// that stopped or panicked and can no longer forward requests.
    pub async fn wait(&mut self) -> ProxyResult<()> {
        let (Some(listener), Some(upstream)) = (self.listener.as_mut(), self.upstream.as_mut())
        else {
            return Ok(());
        };

        let (listener_ended, joined) = tokio::select! {
            joined = listener => (true, joined),
            joined = upstream => (false, joined),
        };

        if listener_ended {
            self.listener = None;
            return joined.map_err(|e| ProxyError::Task(e.to_string()))?;
        }

        self.upstream = None;
        match joined {
            Ok(Ok(())) if self.shutdown.is_cancelled() => Ok(()),
            Ok(Ok(())) => Err(ProxyError::Task(
                "upstream manager stopped unexpectedly".to_string(),
            )),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(ProxyError::Task(format!("upstream manager failed: {}", e))),
        }
    }

    /// Cancel every task and wait for them to stop
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();

        if let Some(handle) = self.listener.take() {
            log_task_result("listener", join(handle).await);
        }
        if let Some(handle) = self.upstream.take() {
            log_task_result("upstream manager", join(handle).await);
        }
        if let Some(handle) = self.eviction.take() {
            if let Err(e) = handle.await {
                tracing::error!("Eviction task failed: {}", e);
            }
        }

        info!("Proxy stopped; {}", self.stats.snapshot());
    }
}

async fn join<T>(handle: JoinHandle<T>) -> ProxyResult<T> {
    handle.await.map_err(|e| ProxyError::Task(e.to_string()))
}

fn log_task_result(name: &str, result: ProxyResult<ProxyResult<()>>) {
    match result {
        Ok(Ok(())) => debug!("{} stopped", name),
        Ok(Err(e)) | Err(e) => tracing::error!("{} stopped with error: {}", name, e),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_eviction_task_sweeps_stale_entries() {
        let table = Arc::new(TransactionTable::new());
        let stats = Arc::new(ProxyStats::new());
        let shutdown = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        table.insert(1, 5, tx, Instant::now());

        let handle = start_eviction_task(
            table.clone(),
            stats.clone(),
            Duration::from_secs(300),
            Duration::from_secs(60),
            shutdown.clone(),
        );

        // Sweeps at 60..240s leave the entry alone
        tokio::time::sleep(Duration::from_secs(290)).await;
        tokio::task::yield_now().await;
        assert!(table.contains(1));

        // The 300s sweep removes it
        tokio::time::sleep(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        assert!(!table.contains(1));
        assert_eq!(stats.snapshot().evicted_entries, 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    fn runtime_with(
        listener: JoinHandle<ProxyResult<()>>,
        upstream: JoinHandle<ProxyResult<()>>,
    ) -> ProxyRuntime {
        ProxyRuntime {
            local_addr: "127.0.0.1:0".parse().unwrap(),
            stats: Arc::new(ProxyStats::new()),
            table: Arc::new(TransactionTable::new()),
            shutdown: CancellationToken::new(),
            listener: Some(listener),
            upstream: Some(upstream),
            eviction: None,
        }
    }

    async fn crashing_manager() -> ProxyResult<()> {
        panic!("upstream manager crashed")
    }

    #[tokio::test]
    async fn test_wait_reports_failed_upstream_manager() {
        let listener = tokio::spawn(std::future::pending::<ProxyResult<()>>());
        let upstream = tokio::spawn(crashing_manager());
        let mut runtime = runtime_with(listener, upstream);

        let result = tokio::time::timeout(Duration::from_secs(5), runtime.wait())
            .await
            .unwrap();
        match result {
            Err(ProxyError::Task(reason)) => assert!(reason.contains("upstream manager")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_reports_stopped_upstream_manager() {
        let listener = tokio::spawn(std::future::pending::<ProxyResult<()>>());
        let upstream = tokio::spawn(async { Ok(()) });
        let mut runtime = runtime_with(listener, upstream);

        assert!(matches!(runtime.wait().await, Err(ProxyError::Task(_))));
    }

    #[tokio::test]
    async fn test_wait_returns_listener_error() {
        let listener = tokio::spawn(async {
            Err(ProxyError::Accept(std::io::Error::new(
                std::io::ErrorKind::Other,
                "too many open files",
            )))
        });
        let upstream = tokio::spawn(std::future::pending::<ProxyResult<()>>());
        let mut runtime = runtime_with(listener, upstream);

        assert!(matches!(runtime.wait().await, Err(ProxyError::Accept(_))));
    }

    #[tokio::test]
    async fn test_start_proxy_rejects_invalid_config() {
        let config = ProxyConfig::default();
        assert!(matches!(
            start_proxy(&config).await,
            Err(ProxyError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_start_proxy_fails_without_upstream() {
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = unused.local_addr().unwrap();
        drop(unused);

        let mut config = ProxyConfig::default();
        config.listen.interface = "127.0.0.1".to_string();
        config.listen.port = 0;
        config.upstream.address = upstream_addr.to_string();
        config.upstream.connect_timeout_ms = 1000;

        assert!(matches!(
            start_proxy(&config).await,
            Err(ProxyError::Connect { .. })
        ));
    }
}
