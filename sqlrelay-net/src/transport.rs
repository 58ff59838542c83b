//! Length-prefixed delivery of opaque payloads over a duplex byte stream.
//!
//! Mirrors the framing used for local-socket transport elsewhere in this
//! stack (`tokio_util::codec::{Framed, LengthDelimitedCodec}`), generalized
//! to any `AsyncRead + AsyncWrite` duplex stream (a `TcpStream`, a
//! Unix/Windows local socket, or an in-memory duplex pair in tests) and
//! layered with request/reply correlation, which that lower layer leaves to
//! its caller.

use crate::{
    error::ProtocolError,
    kind::MessageKind,
    wire::Envelope,
};
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot, watch},
};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Failure modes of a [`Transport`] operation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("operation timed out")]
    Timeout,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Envelope>>>,
    next_correlation: AtomicU64,
    closed: watch::Sender<bool>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl Shared {
    // `oneshot::Sender` has no "send an error" — we model transport failure
    // by dropping every pending sender; each awaiting `send_and_wait` then
    // observes a `RecvError` and maps it to `TransportError::Disconnected`.
    fn fail_all_pending(&self) {
        self.pending.lock().unwrap().clear();
    }
}

/// One endpoint of a framed, correlation-multiplexed duplex connection.
///
/// Cloning is cheap; all clones share the same pending-reply table and
/// writer task, so a `Transport` can be handed to multiple concurrent
/// callers, each with its own `send_and_wait` call in flight concurrently.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

/// The half of a [`Transport`] that yields frames which are not correlated
/// replies to an outstanding [`Transport::send_and_wait`]: unsolicited
/// messages (correlation `0`) and, on the leader side, every inbound
/// request from a follower.
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Incoming {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

impl Transport {
    /// Wraps `io` in length-delimited framing and spawns the reader/writer
    /// tasks. Returns the send-side handle and the receive-side stream.
    pub fn new<S>(io: S) -> (Self, Incoming)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<Envelope>();

        let (closed_tx, _closed_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            next_correlation: AtomicU64::new(1),
            closed: closed_tx,
            outbound: outbound_tx,
        });

        tokio::spawn(run_writer(writer, outbound_rx));
        tokio::spawn(run_reader(reader, shared.clone(), incoming_tx));

        (Self { shared }, Incoming { rx: incoming_rx })
    }

    fn next_correlation(&self) -> u64 {
        // Correlation id 0 is reserved for unsolicited messages, so the
        // counter starts at 1 and skips back over it on wrap.
        let id = self.shared.next_correlation.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.shared.next_correlation.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }

    fn send_frame(&self, correlation: u64, kind: MessageKind, body: Bytes) -> Result<(), TransportError> {
        if *self.shared.closed.borrow() {
            return Err(TransportError::Disconnected);
        }
        let frame = Envelope::encode(kind, correlation, &body);
        self.shared
            .outbound
            .send(frame)
            .map_err(|_| TransportError::Disconnected)
    }

    /// Writes a frame and blocks until a reply carrying the same
    /// correlation id arrives, the timeout elapses, or the transport
    /// disconnects.
    pub async fn send_and_wait(
        &self,
        kind: MessageKind,
        body: Bytes,
        timeout: Duration,
    ) -> Result<Envelope, TransportError> {
        let correlation = self.next_correlation();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(correlation, tx);

        if let Err(error) = self.send_frame(correlation, kind, body) {
            self.shared.pending.lock().unwrap().remove(&correlation);
            return Err(error);
        }

        let result = if timeout.is_zero() {
            rx.await.map_err(|_| TransportError::Disconnected)
        } else {
            match tokio::time::timeout(timeout, rx).await {
                Ok(inner) => inner.map_err(|_| TransportError::Disconnected),
                Err(_) => {
                    self.shared.pending.lock().unwrap().remove(&correlation);
                    Err(TransportError::Timeout)
                }
            }
        };

        result
    }

    /// Fire-and-forget send of an unsolicited message (correlation `0`).
    pub fn send(&self, kind: MessageKind, body: Bytes) -> Result<(), TransportError> {
        self.send_frame(0, kind, body)
    }

    /// Sends a reply frame carrying a caller-supplied correlation id. Used
    /// by the leader to answer a request it received via [`Incoming`].
    pub fn reply(&self, correlation: u64, kind: MessageKind, body: Bytes) -> Result<(), TransportError> {
        self.send_frame(correlation, kind, body)
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the transport has disconnected. Used by the connection
    /// controller to notice a Follower transport going away without polling
    /// `is_closed`.
    pub async fn disconnected(&self) {
        let mut rx = self.shared.closed.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

async fn run_writer<S>(
    mut writer: FramedWrite<S, LengthDelimitedCodec>,
    mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
) where
    S: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound_rx.recv().await {
        if writer.send(frame).await.is_err() {
            tracing::warn!("transport writer failed, closing");
            break;
        }
    }
}

async fn run_reader<S>(
    mut reader: FramedRead<S, LengthDelimitedCodec>,
    shared: Arc<Shared>,
    incoming_tx: mpsc::UnboundedSender<Envelope>,
) where
    S: AsyncRead + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(frame)) => {
                if frame.is_empty() {
                    // Keep-alive frame: silently discarded.
                    continue;
                }

                let envelope = match Envelope::decode(frame.freeze()) {
                    Ok(envelope) => envelope,
                    Err(error) => {
                        tracing::error!(?error, "malformed frame, terminating transport");
                        break;
                    }
                };

                // A frame is a reply iff it matches an outstanding `send_and_wait`
                // waiter; everything else — unsolicited messages (correlation 0)
                // and, on the leader side, every inbound request from a follower —
                // goes to `on_receive`/`Incoming`, per spec.md §4.1. A reply whose
                // waiter already timed out falls into this same "no match" case and
                // is handed to `Incoming` too, where nothing consumes it.
                let waiter = shared.pending.lock().unwrap().remove(&envelope.correlation);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(envelope);
                    }
                    None => {
                        let _ = incoming_tx.send(envelope);
                    }
                }
            }
            Some(Err(error)) => {
                tracing::error!(?error, "transport read error, closing");
                break;
            }
            None => break,
        }
    }

    let _ = shared.closed.send(true);
    shared.fail_all_pending();
    // Dropping the sender closes the `Incoming` stream for its consumer.
    drop(incoming_tx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{CreateCommandRequest, CreateCommandResponse};
    use tokio::io::duplex;

    #[tokio::test]
    async fn send_and_wait_receives_correlated_reply() {
        let (client_io, server_io) = duplex(4096);
        let (client, _client_incoming) = Transport::new(client_io);
        let (server, mut server_incoming) = Transport::new(server_io);

        let client_task = tokio::spawn(async move {
            let body = CreateCommandRequest {
                sql: "SELECT 1".to_owned(),
            }
            .encode();
            client
                .send_and_wait(MessageKind::CreateCommandRequest, body, Duration::from_secs(1))
                .await
        });

        let request = server_incoming.recv().await.unwrap();
        assert_eq!(request.kind, MessageKind::CreateCommandRequest);
        let reply_body = CreateCommandResponse { handle: 7 }.encode();
        server
            .reply(request.correlation, MessageKind::CreateCommandResponse, reply_body)
            .unwrap();

        let envelope = client_task.await.unwrap().unwrap();
        assert_eq!(envelope.kind, MessageKind::CreateCommandResponse);
        assert_eq!(CreateCommandResponse::decode(envelope.body).unwrap().handle, 7);
    }

    #[tokio::test]
    async fn disconnection_fails_outstanding_waiters() {
        let (client_io, server_io) = duplex(4096);
        let (client, _client_incoming) = Transport::new(client_io);
        drop(server_io);

        let body = CreateCommandRequest {
            sql: "SELECT 1".to_owned(),
        }
        .encode();
        let result = client
            .send_and_wait(MessageKind::CreateCommandRequest, body, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(TransportError::Disconnected)));
    }

    #[tokio::test]
    async fn timeout_releases_waiter_and_drops_pending_entry() {
        let (client_io, _server_io) = duplex(4096);
        let (client, _client_incoming) = Transport::new(client_io);

        let body = CreateCommandRequest {
            sql: "SELECT 1".to_owned(),
        }
        .encode();
        let result = client
            .send_and_wait(MessageKind::CreateCommandRequest, body, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(TransportError::Timeout)));
        assert!(client.shared.pending.lock().unwrap().is_empty());
    }
}
