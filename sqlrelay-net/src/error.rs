use thiserror::Error;

/// A malformed frame, an unknown message kind, or a response whose body
/// doesn't match the shape its request expects. Fatal to the transport:
/// the connection is dropped rather than resynchronized.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("malformed string field: {0}")]
    MalformedString(#[from] std::str::Utf8Error),

    #[error("message body did not match the shape expected for kind {0:?}")]
    UnexpectedBody(crate::kind::MessageKind),

    #[error("trailing bytes left after decoding message body")]
    TrailingBytes,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
