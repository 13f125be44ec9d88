//! Client session handler
//!
//! Each accepted connection gets a reader task and a writer task:
//! - the reader decodes client frames and enqueues them, paired with this
//!   session's reply queue, on the shared upstream request queue
//! - the writer drains the reply queue and writes frames back to the client
//!
//! The two share a cancellation token. Whichever loop stops first cancels it,
//! the other stops promptly and the connection is closed once both halves are
//! dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::codec::MbapCodec;
use crate::stats::ProxyStats;
use crate::upstream::{ReplyReceiver, ReplySender, RequestSender, RoutedRequest};

/// One accepted client connection
pub struct ClientSession<S> {
    stream: S,
    peer: SocketAddr,
    requests: RequestSender,
    stats: Arc<ProxyStats>,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, peer: SocketAddr, requests: RequestSender, stats: Arc<ProxyStats>) -> Self {
        Self {
            stream,
            peer,
            requests,
            stats,
        }
    }

    /// Start the reader and writer tasks
    ///
    /// The returned handle completes once both loops have stopped and the
    /// connection is closed.
    pub fn spawn(self) -> JoinHandle<()> {
        let span = info_span!("session", client = %self.peer);
        let token = CancellationToken::new();
        let (read_half, write_half) = tokio::io::split(self.stream);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(
            read_requests(
                FramedRead::new(read_half, MbapCodec::new()),
                reply_tx,
                self.requests,
                token.clone(),
            )
            .instrument(span.clone()),
        );
        let writer = tokio::spawn(
            write_replies(
                FramedWrite::new(write_half, MbapCodec::new()),
                reply_rx,
                token,
            )
            .instrument(span.clone()),
        );

        let stats = self.stats;
        stats.session_opened();
        tokio::spawn(
            async move {
                if let Err(e) = reader.await {
                    error!("Reader task failed: {}", e);
                }
                if let Err(e) = writer.await {
                    error!("Writer task failed: {}", e);
                }
                stats.session_closed();
                debug!("Session finished");
            }
            .instrument(span),
        )
    }
}

/// Reader loop: client frames in, routed requests out
async fn read_requests<R>(
    mut frames_in: FramedRead<R, MbapCodec>,
    reply_tx: ReplySender,
    requests: RequestSender,
    token: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            () = token.cancelled() => break,
            next = frames_in.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                error!(
                    "Error when reading data from client: {}, closing connection",
                    e
                );
                break;
            },
            None => {
                info!("Client connection closed");
                break;
            },
        };

        debug!(
            client_transaction = frame.transaction_id,
            data_size = frame.data.len(),
            "Received PDU from client"
        );

        let request = RoutedRequest {
            frame,
            reply_tx: reply_tx.clone(),
        };

        // Blocks while the upstream queue is full: backpressure on this client
        let sent = tokio::select! {
            () = token.cancelled() => break,
            sent = requests.send(request) => sent,
        };
        if sent.is_err() {
            error!("Upstream request queue closed, closing connection");
            break;
        }
    }

    token.cancel();
}

/// Writer loop: replies from upstream back to the client
async fn write_replies<W>(
    mut frames_out: FramedWrite<W, MbapCodec>,
    mut reply_rx: ReplyReceiver,
    token: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let reply = tokio::select! {
            () = token.cancelled() => break,
            reply = reply_rx.recv() => reply,
        };

        let Some(frame) = reply else {
            break;
        };

        debug!(
            client_transaction = frame.transaction_id,
            "Writing response to client"
        );
        if let Err(e) = frames_out.send(frame).await {
            error!("Error when writing response to client: {}", e);
            break;
        }
    }

    token.cancel();
}
