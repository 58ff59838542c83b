//! The client-facing `Reader`, per `spec.md §3`/`§4.6`.

use std::time::Duration;

use sqlrelay_net::{ColumnDescriptor, SqliteType};

use crate::{
    worker::{field_type_from_value, GetKind, RelayWorker},
    Error,
};

/// The reader's current-row state, per `spec.md §3`. Column accessors are
/// only valid while `OnRow`; this is enforced client-side, in addition to
/// whatever the leader itself enforces, so the invariant holds identically
/// whether the command is local or relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    BeforeFirst,
    OnRow,
    AfterLast,
}

/// A forward-only cursor over a command's result set. Holds no client-side
/// row cache: every accessor issues a fresh request to the leader
/// (`spec.md §4.4`).
pub struct Reader {
    worker: RelayWorker,
    columns: Vec<ColumnDescriptor>,
    timeout: Duration,
    position: Position,
    disposed: bool,
}

impl Reader {
    pub(crate) fn new(worker: RelayWorker, columns: Vec<ColumnDescriptor>, timeout: Duration) -> Self {
        Self {
            worker,
            columns,
            timeout,
            position: Position::BeforeFirst,
            disposed: false,
        }
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    fn ensure_not_disposed(&self) -> Result<(), Error> {
        if self.disposed {
            Err(Error::ObjectDisposed)
        } else {
            Ok(())
        }
    }

    /// Advances to the next row. Once this returns `false` the reader is in
    /// a terminal state from which only `dispose` is valid (`spec.md §4.6`,
    /// testable property 5): further calls keep returning `false` without
    /// forwarding to the leader again.
    pub async fn read(&mut self) -> Result<bool, Error> {
        self.ensure_not_disposed()?;

        if self.position == Position::AfterLast {
            return Ok(false);
        }

        let has_row = self.worker.read(self.timeout).await?;
        self.position = if has_row { Position::OnRow } else { Position::AfterLast };
        Ok(has_row)
    }

    /// Case-insensitive column name lookup; `-1` if absent. Valid in any
    /// reader state, mirroring the leader's own `reader_get_ordinal`, which
    /// does not require the cursor to be positioned on a row.
    pub async fn get_ordinal(&self, name: &str) -> Result<i32, Error> {
        self.ensure_not_disposed()?;
        self.worker.get_ordinal(name, self.timeout).await
    }

    fn check_column_access(&self, ordinal: u16) -> Result<(), Error> {
        self.ensure_not_disposed()?;
        if self.position != Position::OnRow {
            return Err(Error::InvalidOperation(
                "reader is not positioned on a row".to_owned(),
            ));
        }
        if ordinal as usize >= self.columns.len() {
            return Err(Error::InvalidOperation(format!(
                "ordinal {ordinal} out of range (0..{})",
                self.columns.len()
            )));
        }
        Ok(())
    }

    pub async fn get_string(&self, ordinal: u16) -> Result<Option<String>, Error> {
        self.check_column_access(ordinal)?;
        match self.worker.get_typed(ordinal, GetKind::String, self.timeout).await? {
            sqlrelay_net::TypedValue::Null => Ok(None),
            sqlrelay_net::TypedValue::Text(value) => Ok(Some(value)),
            _ => Err(Error::Protocol(sqlrelay_net::ProtocolError::UnexpectedBody(
                sqlrelay_net::MessageKind::ExecuteReaderResponse,
            ))),
        }
    }

    pub async fn get_int16(&self, ordinal: u16) -> Result<Option<i16>, Error> {
        self.check_column_access(ordinal)?;
        match self.worker.get_typed(ordinal, GetKind::Int16, self.timeout).await? {
            sqlrelay_net::TypedValue::Null => Ok(None),
            sqlrelay_net::TypedValue::Int16(value) => Ok(Some(value)),
            _ => Err(Error::Protocol(sqlrelay_net::ProtocolError::UnexpectedBody(
                sqlrelay_net::MessageKind::ExecuteReaderResponse,
            ))),
        }
    }

    pub async fn get_int32(&self, ordinal: u16) -> Result<Option<i32>, Error> {
        self.check_column_access(ordinal)?;
        match self.worker.get_typed(ordinal, GetKind::Int32, self.timeout).await? {
            sqlrelay_net::TypedValue::Null => Ok(None),
            sqlrelay_net::TypedValue::Int32(value) => Ok(Some(value)),
            _ => Err(Error::Protocol(sqlrelay_net::ProtocolError::UnexpectedBody(
                sqlrelay_net::MessageKind::ExecuteReaderResponse,
            ))),
        }
    }

    pub async fn get_int64(&self, ordinal: u16) -> Result<Option<i64>, Error> {
        self.check_column_access(ordinal)?;
        match self.worker.get_typed(ordinal, GetKind::Int64, self.timeout).await? {
            sqlrelay_net::TypedValue::Null => Ok(None),
            sqlrelay_net::TypedValue::Int64(value) => Ok(Some(value)),
            _ => Err(Error::Protocol(sqlrelay_net::ProtocolError::UnexpectedBody(
                sqlrelay_net::MessageKind::ExecuteReaderResponse,
            ))),
        }
    }

    pub async fn get_field_type(&self, ordinal: u16) -> Result<SqliteType, Error> {
        self.check_column_access(ordinal)?;
        let value = self.worker.get_typed(ordinal, GetKind::FieldType, self.timeout).await?;
        field_type_from_value(value)
    }

    /// Best-effort: errors are swallowed, per `spec.md §4.4`/`§7`. Safe to
    /// call more than once; does not dispose the owning `Command`'s
    /// statement (the statement may still be reused to open another
    /// reader).
    pub async fn dispose(&mut self) {
        self.disposed = true;
    }
}
