//! The six error kinds named in `spec.md §7`, each a `thiserror` variant the
//! way `bridge/src/repository.rs`'s `OpenError`/`MirrorError` are built: one
//! variant per failure cause, `#[from]`/`#[source]` wiring instead of string
//! formatting, except for `ServerException`/`InvalidOperation` which carry a
//! leader- or caller-supplied message verbatim (there is nothing further to
//! structure).

use sqlrelay_net::{ProtocolError, TransportError};
use thiserror::Error;

/// Every failure a `Command`, `Reader`, or `Connection` operation can
/// surface to its caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Empty command text, a missing connection, or an operation on a
    /// reader that isn't positioned on a row.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Any operation attempted on a disposed command, reader, or
    /// connection.
    #[error("object has already been disposed")]
    ObjectDisposed,

    /// The leader rejected the request; the message is the leader's text,
    /// unchanged.
    #[error("{0}")]
    ServerException(String),

    /// A malformed frame, an unknown message kind, or a response with an
    /// unexpected shape. Fatal to the underlying transport.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The transport to the leader was lost. All operations on the worker
    /// that observed this fail the same way until reconnection succeeds.
    #[error("disconnected from the leader")]
    Disconnected,

    /// `send_and_wait` exceeded the command's timeout.
    #[error("operation timed out")]
    Timeout,
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Disconnected => Error::Disconnected,
            TransportError::Timeout => Error::Timeout,
            TransportError::Protocol(error) => Error::Protocol(error),
        }
    }
}

#[cfg(feature = "leader")]
impl Error {
    /// Classifies a leader-side engine failure. This split only exists on
    /// the in-process Leader path: the wire protocol carries a single
    /// exception kind per request, so a Follower always sees
    /// `ServerException` regardless of cause (see `DESIGN.md`).
    pub(crate) fn from_engine(error: sqlrelay_engine::EngineError) -> Self {
        use sqlrelay_engine::EngineError;
        match error {
            EngineError::InvalidOperation => {
                Error::InvalidOperation("command text must not be empty or whitespace".to_owned())
            }
            other => Error::ServerException(other.to_string()),
        }
    }
}
