//! Accepts follower connections and dispatches their requests into a
//! [`LeaderEngine`].
//!
//! Modeled on `bridge/src/transport/local.rs`'s accept loop
//! (`LocalServer::run` spawning one task per accepted socket into a
//! `JoinSet`) combined with `lib/src/db/mod.rs`'s single-writer pool: here
//! the engine itself is the single writer, shared behind one
//! `tokio::sync::Mutex` so that concurrently-connected followers still
//! observe a serialized executor.

use crate::{
    engine::{EngineError, LeaderEngine, PeerId},
    handle::StatementHandle,
};
use sqlrelay_net::{
    wire::{
        CreateCommandRequest, CreateCommandResponse, ExceptionBody, ExecuteNonQueryResponse,
        ExecuteReaderGetOrdinalRequest, ExecuteReaderGetRequest, ExecuteReaderInitialResponse,
        ExecuteReaderReadResponse, ExecuteReaderRequest, ExecuteReaderTypedResponse, HandleOnly,
    },
    Envelope, MessageKind, Transport,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{net::TcpListener, sync::Mutex, task::JoinSet};

/// Listens for follower connections and drives a [`LeaderEngine`] opened
/// against `db_path` on their behalf.
pub struct LeaderServer {
    listener: TcpListener,
}

impl LeaderServer {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs forever, accepting connections and spawning one task per peer.
    /// Each failed accept is logged and skipped; the loop only exits if the
    /// listener itself closes.
    pub async fn run(self, db_path: PathBuf) -> Result<(), sqlx::Error> {
        let engine = Arc::new(Mutex::new(LeaderEngine::open(&db_path).await?));
        let mut connections = JoinSet::new();
        let mut next_peer = 0u64;

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    next_peer += 1;
                    let peer = PeerId(next_peer);
                    let engine = engine.clone();
                    tracing::debug!(%addr, ?peer, "follower connected");
                    connections.spawn(serve_connection(peer, stream, engine));
                }
                Err(error) => {
                    tracing::error!(?error, "failed to accept follower connection");
                }
            }

            // Reap finished connection tasks without blocking the accept loop.
            while connections.try_join_next().is_some() {}
        }
    }
}

/// Drives one accepted peer to completion. Generic over the stream type so
/// tests can hand it an in-memory `tokio::io::duplex` half instead of a
/// real `TcpStream`.
pub async fn serve_connection<S>(peer: PeerId, stream: S, engine: Arc<Mutex<LeaderEngine>>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let (transport, mut incoming) = Transport::new(stream);

    while let Some(request) = incoming.recv().await {
        let transport = transport.clone();
        let engine = engine.clone();
        if let Err(error) = dispatch(peer, request, &transport, &engine).await {
            tracing::warn!(?error, ?peer, "failed to send reply to follower");
        }
    }

    tracing::debug!(?peer, "follower disconnected, finalizing its handles");
    engine.lock().await.dispose_peer(peer).await;
}

async fn dispatch(
    peer: PeerId,
    request: Envelope,
    transport: &Transport,
    engine: &Arc<Mutex<LeaderEngine>>,
) -> Result<(), sqlrelay_net::TransportError> {
    let correlation = request.correlation;

    match request.kind {
        MessageKind::CreateCommandRequest => {
            let decoded = match CreateCommandRequest::decode(request.body) {
                Ok(decoded) => decoded,
                Err(error) => return reply_protocol_error(transport, correlation, error),
            };
            let mut engine = engine.lock().await;
            match engine.create_command(peer, decoded.sql).await {
                Ok(handle) => transport.reply(
                    correlation,
                    MessageKind::CreateCommandResponse,
                    CreateCommandResponse {
                        handle: handle.as_u128(),
                    }
                    .encode(),
                ),
                Err(error) => transport.reply(
                    correlation,
                    MessageKind::CreateCommandException,
                    ExceptionBody {
                        message: engine_error_message(error),
                    }
                    .encode(),
                ),
            }
        }
        MessageKind::DisposeCommand => {
            let decoded = match HandleOnly::decode(request.body) {
                Ok(decoded) => decoded,
                Err(error) => return reply_protocol_error(transport, correlation, error),
            };
            engine
                .lock()
                .await
                .dispose_command(StatementHandle::from(decoded.handle))
                .await;
            Ok(())
        }
        MessageKind::ExecuteNonQueryRequest => {
            let decoded = match HandleOnly::decode(request.body) {
                Ok(decoded) => decoded,
                Err(error) => return reply_protocol_error(transport, correlation, error),
            };
            let mut engine = engine.lock().await;
            match engine
                .execute_non_query(StatementHandle::from(decoded.handle))
                .await
            {
                Ok(changes) => transport.reply(
                    correlation,
                    MessageKind::ExecuteNonQueryResponse,
                    ExecuteNonQueryResponse { changes }.encode(),
                ),
                Err(error) => transport.reply(
                    correlation,
                    MessageKind::ExecuteNonQueryException,
                    ExceptionBody {
                        message: engine_error_message(error),
                    }
                    .encode(),
                ),
            }
        }
        MessageKind::ExecuteReaderRequest => {
            let decoded = match ExecuteReaderRequest::decode(request.body) {
                Ok(decoded) => decoded,
                Err(error) => return reply_protocol_error(transport, correlation, error),
            };
            let mut engine = engine.lock().await;
            match engine
                .execute_reader(StatementHandle::from(decoded.handle), decoded.behavior)
                .await
            {
                Ok(columns) => {
                    // Subsequent Read/Get* requests address the cursor by
                    // the same statement handle; the leader resolves the
                    // active reader internally.
                    transport.reply(
                        correlation,
                        MessageKind::ExecuteReaderResponse,
                        ExecuteReaderInitialResponse { columns }.encode(),
                    )
                }
                Err(error) => transport.reply(
                    correlation,
                    MessageKind::ExecuteReaderException,
                    ExceptionBody {
                        message: engine_error_message(error),
                    }
                    .encode(),
                ),
            }
        }
        MessageKind::ExecuteReaderReadRequest => {
            let decoded = match HandleOnly::decode(request.body) {
                Ok(decoded) => decoded,
                Err(error) => return reply_protocol_error(transport, correlation, error),
            };
            let mut engine = engine.lock().await;
            match engine.reader_read(StatementHandle::from(decoded.handle)).await {
                Ok(has_row) => transport.reply(
                    correlation,
                    MessageKind::ExecuteReaderResponse,
                    ExecuteReaderReadResponse { has_row }.encode(),
                ),
                Err(error) => transport.reply(
                    correlation,
                    MessageKind::ExecuteReaderException,
                    ExceptionBody {
                        message: engine_error_message(error),
                    }
                    .encode(),
                ),
            }
        }
        MessageKind::ExecuteReaderGetOrdinalRequest => {
            let decoded = match ExecuteReaderGetOrdinalRequest::decode(request.body) {
                Ok(decoded) => decoded,
                Err(error) => return reply_protocol_error(transport, correlation, error),
            };
            let engine = engine.lock().await;
            match engine.reader_get_ordinal(StatementHandle::from(decoded.handle), &decoded.name) {
                Ok(ordinal) => transport.reply(
                    correlation,
                    MessageKind::ExecuteReaderResponse,
                    ExecuteReaderTypedResponse {
                        value: sqlrelay_net::TypedValue::Int32(ordinal),
                    }
                    .encode(),
                ),
                Err(error) => transport.reply(
                    correlation,
                    MessageKind::ExecuteReaderException,
                    ExceptionBody {
                        message: engine_error_message(error),
                    }
                    .encode(),
                ),
            }
        }
        MessageKind::ExecuteReaderGetInt16Request
        | MessageKind::ExecuteReaderGetInt32Request
        | MessageKind::ExecuteReaderGetInt64Request
        | MessageKind::ExecuteReaderGetStringRequest
        | MessageKind::ExecuteReaderGetFieldTypeRequest => {
            let decoded = match ExecuteReaderGetRequest::decode(request.body) {
                Ok(decoded) => decoded,
                Err(error) => return reply_protocol_error(transport, correlation, error),
            };
            let engine = engine.lock().await;
            let handle = StatementHandle::from(decoded.handle);
            let result = match request.kind {
                MessageKind::ExecuteReaderGetInt16Request => engine.reader_get_int16(handle, decoded.ordinal),
                MessageKind::ExecuteReaderGetInt32Request => engine.reader_get_int32(handle, decoded.ordinal),
                MessageKind::ExecuteReaderGetInt64Request => engine.reader_get_int64(handle, decoded.ordinal),
                MessageKind::ExecuteReaderGetStringRequest => engine.reader_get_string(handle, decoded.ordinal),
                MessageKind::ExecuteReaderGetFieldTypeRequest => {
                    engine.reader_get_field_type(handle, decoded.ordinal)
                }
                _ => unreachable!(),
            };
            match result {
                Ok(value) => transport.reply(
                    correlation,
                    MessageKind::ExecuteReaderResponse,
                    ExecuteReaderTypedResponse { value }.encode(),
                ),
                Err(error) => transport.reply(
                    correlation,
                    MessageKind::ExecuteReaderException,
                    ExceptionBody {
                        message: engine_error_message(error),
                    }
                    .encode(),
                ),
            }
        }
        other => {
            tracing::error!(?other, "leader received an unexpected message kind");
            Ok(())
        }
    }
}

fn reply_protocol_error(
    transport: &Transport,
    correlation: u64,
    error: sqlrelay_net::ProtocolError,
) -> Result<(), sqlrelay_net::TransportError> {
    tracing::error!(?error, "malformed request body, dropping connection");
    Err(sqlrelay_net::TransportError::Protocol(error))
}

fn engine_error_message(error: EngineError) -> String {
    error.to_string()
}
