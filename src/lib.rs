//! Leader/follower access to a single embedded SQLite database over a
//! framed transport.
//!
//! This crate is the client-facing facade: a [`Connection`] elects and
//! tracks a role (Leader or Follower), a [`Command`] runs SQL against it,
//! and a [`Reader`] iterates a command's result set — the same shapes a
//! caller would reach for against an embedded database directly, so
//! callers cannot tell whether the database is being driven locally or
//! relayed to a leader process over the wire (`spec.md §1`).
//!
//! The wire protocol and framed transport live in `sqlrelay-net`; the
//! leader-side SQLite engine and its handle tables live in
//! `sqlrelay-engine`, pulled in here (by default, via the `leader` feature)
//! so a process can serve the Leader role in-process rather than only ever
//! dialing one.

mod command;
mod connection;
mod options;
mod reader;
mod worker;

pub use command::Command;
pub use connection::{Connection, FixedRole, Role, RoleAssignment, RoleSource};
pub use options::ConnectionOptions;
pub use reader::Reader;

mod error;
pub use error::Error;

pub use sqlrelay_net::{ColumnDescriptor, SqliteType};

#[cfg(feature = "leader")]
pub use sqlrelay_engine::LeaderEngine;
