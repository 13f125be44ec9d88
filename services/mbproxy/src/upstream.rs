//! Upstream connection manager
//!
//! Owns the single connection to the real Modbus server. Requests from every
//! client session arrive on one shared queue; each is renumbered with the next
//! upstream transaction identifier, recorded in the [`TransactionTable`] and
//! written to the server. Responses are matched back through the table and
//! handed to the originating session's reply queue with the client's own
//! identifier restored.
//!
//! ## Connection lifecycle
//!
//! 1. `connect()` at startup; failure there is a configuration problem and is
//!    returned to the caller
//! 2. `run()` serves the connection with a forwarding loop and a response loop
//! 3. when either loop ends the connection is dropped, the manager waits the
//!    reconnect delay and connects again, forever
//!
//! Requests queued while disconnected stay in the queue and are forwarded once
//! the next connection is up. Requests written to a connection that then died
//! are never answered; their table entries are reclaimed by eviction.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{Frame, MbapCodec};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::reconnect::{ReconnectHelper, ReconnectPolicy};
use crate::stats::ProxyStats;
use crate::transaction_table::TransactionTable;
use common::hex::format_hex_pretty;

/// Per-session reply queue, written by the response loop
pub type ReplySender = mpsc::UnboundedSender<Frame>;
pub type ReplyReceiver = mpsc::UnboundedReceiver<Frame>;

/// Shared client-to-upstream request queue
pub type RequestSender = mpsc::Sender<RoutedRequest>;
pub type RequestReceiver = mpsc::Receiver<RoutedRequest>;

/// Bytes of payload shown in debug frame dumps
const HEX_DUMP_LIMIT: usize = 32;

/// A client frame together with the queue its reply must go to
#[derive(Debug)]
pub struct RoutedRequest {
    pub frame: Frame,
    pub reply_tx: ReplySender,
}

/// Create the shared request queue
pub fn request_queue(capacity: usize) -> (RequestSender, RequestReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Why a served connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionOutcome {
    /// Connection failed or was closed by the server
    Lost(String),
    /// Every request sender is gone; nothing left to forward
    QueueClosed,
}

/// Where and how to reach the upstream server
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub address: String,
    pub connect_timeout: Duration,
    pub no_delay: bool,
}

impl UpstreamTarget {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            address: config.upstream.address.clone(),
            connect_timeout: config.connect_timeout(),
            no_delay: config.upstream.no_delay,
        }
    }

    /// Resolve the address and connect to the first reachable socket address
    pub async fn connect(&self) -> ProxyResult<TcpStream> {
        debug!("Connecting to server {}", self.address);

        let addrs: Vec<SocketAddr> = lookup_host(self.address.as_str())
            .await
            .map_err(|e| ProxyError::resolve(&self.address, e))?
            .collect();
        if addrs.is_empty() {
            return Err(ProxyError::resolve(&self.address, "no addresses found"));
        }

        let mut last_error = String::from("no address attempted");
        for addr in addrs {
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if self.no_delay {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
                        }
                    }
                    info!("Connected to server {}", addr);
                    return Ok(stream);
                },
                Ok(Err(e)) => last_error = format!("{}: {}", addr, e),
                Err(_) => {
                    last_error = format!("{}: timed out after {:?}", addr, self.connect_timeout)
                },
            }
        }

        Err(ProxyError::connect(&self.address, last_error))
    }
}

/// Single owner of the upstream connection and its transaction counter
pub struct UpstreamManager {
    target: UpstreamTarget,
    policy: ReconnectPolicy,
    table: Arc<TransactionTable>,
    stats: Arc<ProxyStats>,
    /// Next upstream transaction identifier; survives reconnects
    next_transaction_id: u16,
}

impl UpstreamManager {
    pub fn new(
        target: UpstreamTarget,
        policy: ReconnectPolicy,
        table: Arc<TransactionTable>,
        stats: Arc<ProxyStats>,
    ) -> Self {
        Self {
            target,
            policy,
            table,
            stats,
            next_transaction_id: 1,
        }
    }

    /// Initial connection; failure is fatal for the caller
    pub async fn connect(&self) -> ProxyResult<TcpStream> {
        self.target.connect().await
    }

    /// Serve `initial`, then reconnect forever until shutdown or until every
    /// request sender has been dropped
    pub async fn run(
        mut self,
        initial: TcpStream,
        mut requests: RequestReceiver,
        shutdown: CancellationToken,
    ) -> ProxyResult<()> {
        let target = self.target.clone();
        let mut reconnect = ReconnectHelper::new(self.policy.clone());
        let mut stream = initial;

        loop {
            let outcome = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Upstream manager received shutdown signal");
                    return Ok(());
                }
                outcome = self.serve_connection(stream, &mut requests) => outcome,
            };

            match outcome {
                ConnectionOutcome::QueueClosed => {
                    info!("Request queue closed, upstream manager stopping");
                    return Ok(());
                },
                ConnectionOutcome::Lost(reason) => {
                    self.stats.record_disconnect();
                    warn!(
                        pending = self.table.len(),
                        "Upstream connection closed ({}), retrying", reason
                    );
                },
            }

            stream = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Upstream manager received shutdown signal");
                    return Ok(());
                }
                stream = reconnect.reconnect(|| target.connect()) => stream,
            };
            self.stats.record_reconnect();
        }
    }

    /// Run the forwarding and response loops against one connection until
    /// either of them ends; the connection is closed on return
    async fn serve_connection(
        &mut self,
        stream: TcpStream,
        requests: &mut RequestReceiver,
    ) -> ConnectionOutcome {
        let (read_half, write_half) = stream.into_split();
        let mut frames_in = FramedRead::new(read_half, MbapCodec::new());
        let mut frames_out = FramedWrite::new(write_half, MbapCodec::new());

        let table = self.table.clone();
        let stats = self.stats.clone();

        tokio::select! {
            outcome = dispatch_responses(&mut frames_in, &table, &stats) => outcome,
            outcome = forward_requests(
                requests,
                &mut frames_out,
                &table,
                &stats,
                &mut self.next_transaction_id,
            ) => outcome,
        }
    }
}

/// Forwarding loop: queue order in, renumbered frames out
///
/// The table entry is recorded before the write so a fast reply can never
/// arrive ahead of its entry.
async fn forward_requests<W>(
    requests: &mut RequestReceiver,
    frames_out: &mut FramedWrite<W, MbapCodec>,
    table: &TransactionTable,
    stats: &ProxyStats,
    next_transaction_id: &mut u16,
) -> ConnectionOutcome
where
    W: AsyncWrite + Unpin,
{
    while let Some(RoutedRequest { frame, reply_tx }) = requests.recv().await {
        let upstream_id = *next_transaction_id;
        *next_transaction_id = upstream_id.wrapping_add(1);

        let client_transaction_id = frame.transaction_id;
        table.insert(upstream_id, client_transaction_id, reply_tx, Instant::now());

        debug!(
            client_transaction = client_transaction_id,
            server_transaction = upstream_id,
            unit = frame.unit_id,
            data = %format_hex_pretty(&frame.data, HEX_DUMP_LIMIT),
            "Writing PDU to server"
        );

        if let Err(e) = frames_out.send(frame.with_transaction_id(upstream_id)).await {
            // Never reached the server; nothing will answer it
            table.take(upstream_id);
            return ConnectionOutcome::Lost(format!("write failed: {}", e));
        }
        stats.record_forwarded();
    }

    ConnectionOutcome::QueueClosed
}

/// Response loop: read frames until the connection fails or closes
async fn dispatch_responses<R>(
    frames_in: &mut FramedRead<R, MbapCodec>,
    table: &TransactionTable,
    stats: &ProxyStats,
) -> ConnectionOutcome
where
    R: AsyncRead + Unpin,
{
    loop {
        match frames_in.next().await {
            Some(Ok(frame)) => {
                deliver_response(frame, table, stats);
            },
            Some(Err(e)) => {
                error!("Error when reading response: {}", e);
                return ConnectionOutcome::Lost(e.to_string());
            },
            None => return ConnectionOutcome::Lost("server closed the connection".to_string()),
        }
    }
}

/// Route one upstream response to its client
///
/// Returns `true` when the reply was queued for a live session.
pub fn deliver_response(frame: Frame, table: &TransactionTable, stats: &ProxyStats) -> bool {
    let upstream_id = frame.transaction_id;

    let Some(entry) = table.take(upstream_id) else {
        stats.record_unmatched();
        error!(
            server_transaction = upstream_id,
            "Unexpected transaction {}, ignoring", upstream_id
        );
        return false;
    };

    debug!(
        server_transaction = upstream_id,
        client_transaction = entry.client_transaction_id,
        data_size = frame.data.len(),
        data = %format_hex_pretty(&frame.data, HEX_DUMP_LIMIT),
        "Read PDU from server"
    );

    let reply = frame.with_transaction_id(entry.client_transaction_id);
    if entry.reply_tx.send(reply).is_err() {
        stats.record_orphaned();
        debug!(
            client_transaction = entry.client_transaction_id,
            "Client session already closed, reply discarded"
        );
        return false;
    }

    stats.record_delivered();
    true
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn read_request(transaction_id: u16) -> Frame {
        Frame::new(transaction_id, 1, vec![0x03, 0x00, 0x00, 0x00, 0x01])
    }

    #[tokio::test]
    async fn test_deliver_restores_client_transaction() {
        let table = TransactionTable::new();
        let stats = ProxyStats::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        table.insert(1, 5, tx, Instant::now());

        let response = Frame::new(1, 1, vec![0x03, 0x02, 0x00, 0x2A]);
        assert!(deliver_response(response, &table, &stats));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply, Frame::new(5, 1, vec![0x03, 0x02, 0x00, 0x2A]));
        assert!(table.is_empty());
        assert_eq!(stats.snapshot().replies_delivered, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unmatched_response_is_dropped() {
        let table = TransactionTable::new();
        let stats = ProxyStats::new();

        assert!(!deliver_response(read_request(99), &table, &stats));
        assert_eq!(stats.snapshot().unmatched_responses, 1);
        assert!(logs_contain("Unexpected transaction 99"));
    }

    #[tokio::test]
    async fn test_reply_to_closed_session() {
        let table = TransactionTable::new();
        let stats = ProxyStats::new();
        let (tx, rx) = mpsc::unbounded_channel();
        table.insert(4, 8, tx, Instant::now());
        drop(rx);

        assert!(!deliver_response(read_request(4), &table, &stats));
        assert_eq!(stats.snapshot().orphaned_replies, 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_forwarding_renumbers_in_queue_order() {
        let table = TransactionTable::new();
        let stats = ProxyStats::new();
        let (req_tx, mut req_rx) = request_queue(8);
        let (reply_tx, _reply_rx) = mpsc::unbounded_channel();

        // Two clients picked the same transaction id
        for client_id in [7u16, 7, 300] {
            req_tx
                .send(RoutedRequest {
                    frame: read_request(client_id),
                    reply_tx: reply_tx.clone(),
                })
                .await
                .unwrap();
        }
        drop(req_tx);

        let (upstream, server) = tokio::io::duplex(1024);
        let mut frames_out = FramedWrite::new(upstream, MbapCodec::new());
        let mut next_id = 1u16;

        let outcome =
            forward_requests(&mut req_rx, &mut frames_out, &table, &stats, &mut next_id).await;
        assert_eq!(outcome, ConnectionOutcome::QueueClosed);
        assert_eq!(next_id, 4);
        drop(frames_out);

        let mut server = FramedRead::new(server, MbapCodec::new());
        for (expected_upstream, expected_client) in [(1u16, 7u16), (2, 7), (3, 300)] {
            let frame = server.next().await.unwrap().unwrap();
            assert_eq!(frame.transaction_id, expected_upstream);
            assert_eq!(
                table.take(expected_upstream).unwrap().client_transaction_id,
                expected_client
            );
        }
        assert_eq!(stats.snapshot().requests_forwarded, 3);
    }

    #[tokio::test]
    async fn test_counter_wraps() {
        let table = TransactionTable::new();
        let stats = ProxyStats::new();
        let (req_tx, mut req_rx) = request_queue(4);
        let (reply_tx, _reply_rx) = mpsc::unbounded_channel();

        req_tx
            .send(RoutedRequest {
                frame: read_request(1),
                reply_tx,
            })
            .await
            .unwrap();
        drop(req_tx);

        let (upstream, _server) = tokio::io::duplex(1024);
        let mut frames_out = FramedWrite::new(upstream, MbapCodec::new());
        let mut next_id = u16::MAX;

        forward_requests(&mut req_rx, &mut frames_out, &table, &stats, &mut next_id).await;
        assert_eq!(next_id, 0);
        assert!(table.contains(u16::MAX));
    }

    #[tokio::test]
    async fn test_response_loop_ends_on_close() {
        let table = TransactionTable::new();
        let stats = ProxyStats::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        table.insert(1, 5, tx, Instant::now());

        let (server, upstream) = tokio::io::duplex(1024);
        let mut server = FramedWrite::new(server, MbapCodec::new());
        server
            .send(Frame::new(1, 1, vec![0x03, 0x02, 0x00, 0x2A]))
            .await
            .unwrap();
        drop(server);

        let mut frames_in = FramedRead::new(upstream, MbapCodec::new());
        let outcome = dispatch_responses(&mut frames_in, &table, &stats).await;
        assert!(matches!(outcome, ConnectionOutcome::Lost(_)));
        assert_eq!(rx.recv().await.unwrap().transaction_id, 5);
    }

    #[tokio::test]
    async fn test_response_loop_ends_on_framing_error() {
        let table = TransactionTable::new();
        let stats = ProxyStats::new();

        let truncated: &[u8] = &[0x00, 0x01, 0x00];
        let mut frames_in = FramedRead::new(truncated, MbapCodec::new());
        let outcome = dispatch_responses(&mut frames_in, &table, &stats).await;
        match outcome {
            ConnectionOutcome::Lost(reason) => assert!(reason.contains("header too short")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = UpstreamTarget {
            address: addr.to_string(),
            connect_timeout: Duration::from_secs(1),
            no_delay: true,
        };
        assert!(matches!(
            target.connect().await,
            Err(ProxyError::Connect { .. })
        ));
    }
}
