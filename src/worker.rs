//! The worker layer: translates client API calls into either a direct call
//! into the leader's SQLite engine (Leader role) or a request/reply pair
//! over the wire (Follower role), per `spec.md §4.3`/`§4.4`.
//!
//! A statement handle and its cursor are never separate wire citizens — the
//! leader engine resolves the active reader from the statement handle it
//! was opened on (`sqlrelay-engine/src/server.rs`) — so one `RelayWorker`
//! serves both the command and, once `execute_reader` succeeds, the reader
//! built on top of it. `Command` and `Reader` each hold their own clone;
//! the timeout is supplied per call rather than fixed at construction,
//! since `CommandTimeout` is a mutable property of the owning `Command`.

use std::time::Duration;

use sqlrelay_net::{
    wire::{
        CreateCommandRequest, CreateCommandResponse, ExceptionBody, ExecuteNonQueryResponse,
        ExecuteReaderGetOrdinalRequest, ExecuteReaderGetRequest, ExecuteReaderInitialResponse,
        ExecuteReaderReadResponse, ExecuteReaderRequest, ExecuteReaderTypedResponse, HandleOnly,
    },
    ColumnDescriptor, MessageKind, ProtocolError, SqliteType, Transport, TypedValue,
};

use crate::Error;

#[cfg(feature = "leader")]
use std::sync::Arc;
#[cfg(feature = "leader")]
use tokio::sync::Mutex as AsyncMutex;

/// What a [`RelayWorker`] dispatches requests to.
#[derive(Clone)]
pub(crate) enum Backend {
    /// This process is the leader: calls go straight into the embedded
    /// engine behind its serializing mutex, with no framing in between.
    #[cfg(feature = "leader")]
    Local(Arc<AsyncMutex<sqlrelay_engine::LeaderEngine>>),
    /// This process is a follower: calls are framed requests sent over
    /// the transport.
    Remote(Transport),
}

/// Which typed `Get*` accessor is being requested, shared between the
/// Local and Remote dispatch paths so both can route through one function.
#[derive(Debug, Clone, Copy)]
pub(crate) enum GetKind {
    Int16,
    Int32,
    Int64,
    String,
    FieldType,
}

impl GetKind {
    fn message_kind(self) -> MessageKind {
        match self {
            GetKind::Int16 => MessageKind::ExecuteReaderGetInt16Request,
            GetKind::Int32 => MessageKind::ExecuteReaderGetInt32Request,
            GetKind::Int64 => MessageKind::ExecuteReaderGetInt64Request,
            GetKind::String => MessageKind::ExecuteReaderGetStringRequest,
            GetKind::FieldType => MessageKind::ExecuteReaderGetFieldTypeRequest,
        }
    }
}

/// The statement handle and its backend, shared between a `Command` and the
/// `Reader` it spawns — both address the same leader-side cursor through
/// the same statement handle, so cloning just copies the (cheap) routing
/// information, never the underlying statement.
#[derive(Clone)]
pub(crate) struct RelayWorker {
    backend: Backend,
    handle: u128,
}

#[cfg(feature = "leader")]
fn local_peer() -> sqlrelay_engine::PeerId {
    // An in-process Leader-role connection has no distinct "peer"; handles
    // it creates are attributed to a reserved id that never collides with a
    // real follower's, since `LeaderServer` starts counting peers at 1.
    sqlrelay_engine::PeerId(0)
}

fn unexpected(kind: MessageKind) -> Error {
    Error::Protocol(ProtocolError::UnexpectedBody(kind))
}

impl RelayWorker {
    pub(crate) async fn create_command(backend: Backend, sql: String, timeout: Duration) -> Result<Self, Error> {
        match &backend {
            #[cfg(feature = "leader")]
            Backend::Local(engine) => {
                let mut engine = engine.lock().await;
                let handle = engine
                    .create_command(local_peer(), sql)
                    .await
                    .map_err(Error::from_engine)?;
                Ok(Self {
                    backend,
                    handle: handle.as_u128(),
                })
            }
            Backend::Remote(transport) => {
                let body = CreateCommandRequest { sql }.encode();
                let envelope = transport
                    .send_and_wait(MessageKind::CreateCommandRequest, body, timeout)
                    .await?;
                match envelope.kind {
                    MessageKind::CreateCommandResponse => {
                        let response = CreateCommandResponse::decode(envelope.body)?;
                        Ok(Self {
                            backend,
                            handle: response.handle,
                        })
                    }
                    MessageKind::CreateCommandException => {
                        let body = ExceptionBody::decode(envelope.body)?;
                        Err(Error::ServerException(body.message))
                    }
                    other => Err(unexpected(other)),
                }
            }
        }
    }

    pub(crate) async fn execute_non_query(&self, timeout: Duration) -> Result<i32, Error> {
        match &self.backend {
            #[cfg(feature = "leader")]
            Backend::Local(engine) => {
                let mut engine = engine.lock().await;
                engine
                    .execute_non_query(self.statement_handle())
                    .await
                    .map_err(Error::from_engine)
            }
            Backend::Remote(transport) => {
                let body = HandleOnly { handle: self.handle }.encode();
                let envelope = transport
                    .send_and_wait(MessageKind::ExecuteNonQueryRequest, body, timeout)
                    .await?;
                match envelope.kind {
                    MessageKind::ExecuteNonQueryResponse => {
                        Ok(ExecuteNonQueryResponse::decode(envelope.body)?.changes)
                    }
                    MessageKind::ExecuteNonQueryException => {
                        Err(Error::ServerException(ExceptionBody::decode(envelope.body)?.message))
                    }
                    other => Err(unexpected(other)),
                }
            }
        }
    }

    pub(crate) async fn execute_reader(
        &self,
        behavior: u32,
        timeout: Duration,
    ) -> Result<Vec<ColumnDescriptor>, Error> {
        match &self.backend {
            #[cfg(feature = "leader")]
            Backend::Local(engine) => {
                let mut engine = engine.lock().await;
                engine
                    .execute_reader(self.statement_handle(), behavior)
                    .await
                    .map_err(Error::from_engine)
            }
            Backend::Remote(transport) => {
                let body = ExecuteReaderRequest {
                    handle: self.handle,
                    behavior,
                }
                .encode();
                let envelope = transport
                    .send_and_wait(MessageKind::ExecuteReaderRequest, body, timeout)
                    .await?;
                match envelope.kind {
                    MessageKind::ExecuteReaderResponse => {
                        Ok(ExecuteReaderInitialResponse::decode(envelope.body)?.columns)
                    }
                    MessageKind::ExecuteReaderException => {
                        Err(Error::ServerException(ExceptionBody::decode(envelope.body)?.message))
                    }
                    other => Err(unexpected(other)),
                }
            }
        }
    }

    pub(crate) async fn read(&self, timeout: Duration) -> Result<bool, Error> {
        match &self.backend {
            #[cfg(feature = "leader")]
            Backend::Local(engine) => {
                let mut engine = engine.lock().await;
                engine
                    .reader_read(self.statement_handle())
                    .await
                    .map_err(Error::from_engine)
            }
            Backend::Remote(transport) => {
                let body = HandleOnly { handle: self.handle }.encode();
                let envelope = transport
                    .send_and_wait(MessageKind::ExecuteReaderReadRequest, body, timeout)
                    .await?;
                match envelope.kind {
                    MessageKind::ExecuteReaderResponse => {
                        Ok(ExecuteReaderReadResponse::decode(envelope.body)?.has_row)
                    }
                    MessageKind::ExecuteReaderException => {
                        Err(Error::ServerException(ExceptionBody::decode(envelope.body)?.message))
                    }
                    other => Err(unexpected(other)),
                }
            }
        }
    }

    pub(crate) async fn get_ordinal(&self, name: &str, timeout: Duration) -> Result<i32, Error> {
        match &self.backend {
            #[cfg(feature = "leader")]
            Backend::Local(engine) => {
                let engine = engine.lock().await;
                engine
                    .reader_get_ordinal(self.statement_handle(), name)
                    .map_err(Error::from_engine)
            }
            Backend::Remote(transport) => {
                let body = ExecuteReaderGetOrdinalRequest {
                    handle: self.handle,
                    name: name.to_owned(),
                }
                .encode();
                let envelope = transport
                    .send_and_wait(MessageKind::ExecuteReaderGetOrdinalRequest, body, timeout)
                    .await?;
                match envelope.kind {
                    MessageKind::ExecuteReaderResponse => {
                        match ExecuteReaderTypedResponse::decode(envelope.body)?.value {
                            TypedValue::Int32(ordinal) => Ok(ordinal),
                            _ => Err(unexpected(MessageKind::ExecuteReaderResponse)),
                        }
                    }
                    MessageKind::ExecuteReaderException => {
                        Err(Error::ServerException(ExceptionBody::decode(envelope.body)?.message))
                    }
                    other => Err(unexpected(other)),
                }
            }
        }
    }

    pub(crate) async fn get_typed(&self, ordinal: u16, kind: GetKind, timeout: Duration) -> Result<TypedValue, Error> {
        match &self.backend {
            #[cfg(feature = "leader")]
            Backend::Local(engine) => {
                let engine = engine.lock().await;
                let statement = self.statement_handle();
                match kind {
                    GetKind::Int16 => engine.reader_get_int16(statement, ordinal),
                    GetKind::Int32 => engine.reader_get_int32(statement, ordinal),
                    GetKind::Int64 => engine.reader_get_int64(statement, ordinal),
                    GetKind::String => engine.reader_get_string(statement, ordinal),
                    GetKind::FieldType => engine.reader_get_field_type(statement, ordinal),
                }
                .map_err(Error::from_engine)
            }
            Backend::Remote(transport) => {
                let body = ExecuteReaderGetRequest {
                    handle: self.handle,
                    ordinal,
                }
                .encode();
                let envelope = transport.send_and_wait(kind.message_kind(), body, timeout).await?;
                match envelope.kind {
                    MessageKind::ExecuteReaderResponse => Ok(ExecuteReaderTypedResponse::decode(envelope.body)?.value),
                    MessageKind::ExecuteReaderException => {
                        Err(Error::ServerException(ExceptionBody::decode(envelope.body)?.message))
                    }
                    other => Err(unexpected(other)),
                }
            }
        }
    }

    /// Best-effort: dispose errors are swallowed per `spec.md §4.4`/`§7`.
    pub(crate) async fn dispose(&self) {
        match &self.backend {
            #[cfg(feature = "leader")]
            Backend::Local(engine) => {
                engine.lock().await.dispose_command(self.statement_handle()).await;
            }
            Backend::Remote(transport) => {
                let body = HandleOnly { handle: self.handle }.encode();
                let _ = transport.send(MessageKind::DisposeCommand, body);
            }
        }
    }

    #[cfg(feature = "leader")]
    fn statement_handle(&self) -> sqlrelay_engine::StatementHandle {
        sqlrelay_engine::StatementHandle::from(self.handle)
    }
}

/// Convert a `FieldType` or `Null` response into the `SqliteType` a caller
/// asked `get_field_type` for. A null column's type is reported as
/// [`SqliteType::Null`], matching the engine's own classification.
pub(crate) fn field_type_from_value(value: TypedValue) -> Result<SqliteType, Error> {
    match value {
        TypedValue::FieldType(t) => Ok(t),
        TypedValue::Null => Ok(SqliteType::Null),
        _ => Err(unexpected(MessageKind::ExecuteReaderResponse)),
    }
}
