//! Framed transport and wire codec for the SQLite leader/follower protocol.

mod error;
mod kind;
mod transport;
mod value;
pub mod wire;

pub use error::ProtocolError;
pub use kind::MessageKind;
pub use transport::{Incoming, Transport, TransportError};
pub use value::{ColumnDescriptor, SqliteType, TypedValue};
pub use wire::Envelope;
