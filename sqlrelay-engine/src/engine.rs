//! The leader's single-threaded SQLite executor.
//!
//! Modeled on `lib/src/db/mod.rs`'s database layer: a `SqlitePool`
//! configured with `max_connections(1)` so sqlx itself serializes every
//! statement against the one writable connection, giving the SQLite handle
//! to exactly one executor at a time. Rows are fetched eagerly into the
//! reader's handle entry rather than streamed lazily from a borrowed
//! connection — see DESIGN.md for why.

use crate::handle::{HandleMap, ReaderHandle, StatementHandle};
use sqlrelay_net::{ColumnDescriptor, SqliteType, TypedValue};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous},
    Column, Executor, Row, SqlitePool, TypeInfo, ValueRef,
};
use std::path::Path;
use thiserror::Error;

/// Identifies the follower connection that owns a given handle, so its
/// handles can be finalized in creation order when it disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u64);

/// Failures the engine can report for a single request. These always
/// surface to the requester as the corresponding `*Exception` wire message;
/// whether that exception is further classified as `InvalidOperation` or
/// `ServerException` is a decision made only on the in-process Leader path
/// (see `DESIGN.md`), since the wire protocol carries just one exception
/// kind per request.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("command text must not be empty or consist only of whitespace")]
    InvalidOperation,
    #[error("{0}")]
    Sql(String),
    #[error("{0}")]
    ReaderState(String),
}

fn sql_err(error: sqlx::Error) -> EngineError {
    EngineError::Sql(error.to_string())
}

/// The position of a cursor over an active reader's buffered rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorPosition {
    BeforeFirst,
    OnRow(usize),
    AfterLast,
}

struct StatementEntry {
    sql: String,
    owner: PeerId,
    /// Order this statement was created in, relative to other statements
    /// on the same peer; used to finalize a disconnected peer's handles in
    /// creation order.
    seq: u64,
    reader: Option<ReaderHandle>,
}

struct ReaderEntry {
    columns: Vec<ColumnDescriptor>,
    rows: Vec<SqliteRow>,
    position: CursorPosition,
    owner: PeerId,
}

enum WantedType {
    Int16,
    Int32,
    Int64,
    String,
    FieldType,
}

fn classify_name(name: &str) -> SqliteType {
    match name.to_ascii_uppercase().as_str() {
        "INTEGER" | "INT" | "BIGINT" | "TINYINT" | "SMALLINT" => SqliteType::Integer,
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" | "DECIMAL" => SqliteType::Real,
        "BLOB" => SqliteType::Blob,
        "" | "NULL" => SqliteType::Null,
        _ => SqliteType::Text,
    }
}

fn decode_value(row: &SqliteRow, ordinal: usize, want: WantedType) -> Result<TypedValue, EngineError> {
    let raw = row.try_get_raw(ordinal).map_err(sql_err)?;
    if raw.is_null() {
        return Ok(TypedValue::Null);
    }

    let classification = classify_name(raw.type_info().name());

    match want {
        WantedType::FieldType => Ok(TypedValue::FieldType(classification)),
        WantedType::String => {
            let text = match classification {
                SqliteType::Text => row.try_get::<String, _>(ordinal).map_err(sql_err)?,
                SqliteType::Integer => row.try_get::<i64, _>(ordinal).map_err(sql_err)?.to_string(),
                SqliteType::Real => row.try_get::<f64, _>(ordinal).map_err(sql_err)?.to_string(),
                SqliteType::Blob => {
                    return Err(EngineError::ReaderState(
                        "cannot read a BLOB column as a string".to_owned(),
                    ))
                }
                SqliteType::Null => unreachable!("checked raw.is_null() above"),
            };
            Ok(TypedValue::Text(text))
        }
        WantedType::Int16 => {
            let value = row.try_get::<i64, _>(ordinal).map_err(sql_err)?;
            let value = i16::try_from(value)
                .map_err(|_| EngineError::ReaderState(format!("value {value} out of range for Int16")))?;
            Ok(TypedValue::Int16(value))
        }
        WantedType::Int32 => {
            let value = row.try_get::<i64, _>(ordinal).map_err(sql_err)?;
            let value = i32::try_from(value)
                .map_err(|_| EngineError::ReaderState(format!("value {value} out of range for Int32")))?;
            Ok(TypedValue::Int32(value))
        }
        WantedType::Int64 => Ok(TypedValue::Int64(row.try_get::<i64, _>(ordinal).map_err(sql_err)?)),
    }
}

/// Owns the SQLite handle and the statement/reader handle tables.
/// Not `Clone`; callers share it behind an
/// `Arc<tokio::sync::Mutex<_>>` (see `sqlrelay_engine::server`), which is
/// what gives "single-threaded executor" its teeth: only one request is
/// ever mid-flight against the database at a time.
pub struct LeaderEngine {
    pool: SqlitePool,
    statements: HandleMap<StatementHandle, StatementEntry>,
    readers: HandleMap<ReaderHandle, ReaderEntry>,
    next_seq: u64,
}

impl LeaderEngine {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .test_before_acquire(false)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            statements: HandleMap::new(),
            readers: HandleMap::new(),
            next_seq: 0,
        })
    }

    /// Opens a private, process-local in-memory database. Useful for tests
    /// and for a `Connection` that only ever needs the Leader role within a
    /// single process.
    pub async fn open_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new().filename(":memory:").create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            statements: HandleMap::new(),
            readers: HandleMap::new(),
            next_seq: 0,
        })
    }

    /// Registers a new command. SQL is not actually prepared against SQLite
    /// until the first execute — the handle up to that point identifies
    /// only the command text — but syntax is validated eagerly here via
    /// `describe` so a bad statement is rejected at creation time.
    pub async fn create_command(&mut self, peer: PeerId, sql: String) -> Result<StatementHandle, EngineError> {
        if sql.trim().is_empty() {
            return Err(EngineError::InvalidOperation);
        }

        self.pool.describe(&sql).await.map_err(sql_err)?;

        let seq = self.next_seq;
        self.next_seq += 1;

        let handle = self.statements.insert(StatementEntry {
            sql,
            owner: peer,
            seq,
            reader: None,
        });

        Ok(handle)
    }

    /// Idempotent: disposing an absent or already-disposed handle is a
    /// silent no-op.
    pub async fn dispose_command(&mut self, handle: StatementHandle) {
        if let Some(entry) = self.statements.remove(handle) {
            if let Some(reader) = entry.reader {
                self.readers.remove(reader);
            }
        }
    }

    pub async fn execute_non_query(&mut self, handle: StatementHandle) -> Result<i32, EngineError> {
        let sql = self
            .statements
            .get(handle)
            .ok_or_else(|| EngineError::ReaderState("no such statement handle".to_owned()))?
            .sql
            .clone();

        let result = sqlx::query(&sql).execute(&self.pool).await.map_err(sql_err)?;
        Ok(result.rows_affected() as i32)
    }

    /// Runs the statement and opens a cursor over its result set. The
    /// reader (cursor) handle this creates is purely internal bookkeeping:
    /// every subsequent read/get request addresses the cursor by the
    /// *statement* handle, never a separately-exposed reader handle, since
    /// a reader is always a child of the statement that opened it and is
    /// never put on the wire by itself. Re-issuing this against a
    /// statement that already has an active reader replaces it.
    pub async fn execute_reader(
        &mut self,
        handle: StatementHandle,
        _behavior: u32,
    ) -> Result<Vec<ColumnDescriptor>, EngineError> {
        let (sql, owner, previous_reader) = {
            let entry = self
                .statements
                .get(handle)
                .ok_or_else(|| EngineError::ReaderState("no such statement handle".to_owned()))?;
            (entry.sql.clone(), entry.owner, entry.reader)
        };

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(sql_err)?;
        let columns = self.describe_columns(&sql, &rows).await?;

        if let Some(previous) = previous_reader {
            self.readers.remove(previous);
        }

        let reader_handle = self.readers.insert(ReaderEntry {
            columns: columns.clone(),
            rows,
            position: CursorPosition::BeforeFirst,
            owner,
        });

        self.statements.get_mut(handle).expect("checked above").reader = Some(reader_handle);

        Ok(columns)
    }

    fn reader_handle_for(&self, statement: StatementHandle) -> Result<ReaderHandle, EngineError> {
        self.statements
            .get(statement)
            .ok_or_else(|| EngineError::ReaderState("no such statement handle".to_owned()))?
            .reader
            .ok_or_else(|| EngineError::ReaderState("ExecuteReader has not been called on this statement".to_owned()))
    }

    async fn describe_columns(
        &self,
        sql: &str,
        rows: &[SqliteRow],
    ) -> Result<Vec<ColumnDescriptor>, EngineError> {
        let described = self.pool.describe(sql).await.map_err(sql_err)?;

        let mut columns = Vec::with_capacity(described.columns().len());
        for (ordinal, column) in described.columns().iter().enumerate() {
            let mut sqlite_type = classify_name(column.type_info().name());

            if let Some(first_row) = rows.first() {
                if let Ok(raw) = first_row.try_get_raw(ordinal) {
                    if !raw.is_null() {
                        sqlite_type = classify_name(raw.type_info().name());
                    }
                }
            }

            columns.push(ColumnDescriptor {
                ordinal: ordinal as u16,
                name: column.name().to_owned(),
                sqlite_type,
            });
        }

        Ok(columns)
    }

    /// Steps the cursor one row forward. Addressed by the statement handle,
    /// as the wire protocol does.
    pub async fn reader_read(&mut self, statement: StatementHandle) -> Result<bool, EngineError> {
        let handle = self.reader_handle_for(statement)?;
        let entry = self
            .readers
            .get_mut(handle)
            .expect("reader_handle_for returned a live handle");

        let next_index = match entry.position {
            CursorPosition::BeforeFirst => 0,
            CursorPosition::OnRow(i) => i + 1,
            CursorPosition::AfterLast => {
                return Ok(false);
            }
        };

        if next_index < entry.rows.len() {
            entry.position = CursorPosition::OnRow(next_index);
            Ok(true)
        } else {
            entry.position = CursorPosition::AfterLast;
            Ok(false)
        }
    }

    /// Case-insensitive column name lookup, `-1` if absent. Does not
    /// require the cursor to be on a
    /// row, since column names are fixed for the statement's lifetime.
    pub fn reader_get_ordinal(&self, statement: StatementHandle, name: &str) -> Result<i32, EngineError> {
        let handle = self.reader_handle_for(statement)?;
        let entry = self.readers.get(handle).expect("reader_handle_for returned a live handle");

        Ok(entry
            .columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
            .map(|column| column.ordinal as i32)
            .unwrap_or(-1))
    }

    fn current_row(&self, statement: StatementHandle) -> Result<(&SqliteRow, usize), EngineError> {
        let handle = self.reader_handle_for(statement)?;
        let entry = self.readers.get(handle).expect("reader_handle_for returned a live handle");

        let index = match entry.position {
            CursorPosition::OnRow(i) => i,
            _ => return Err(EngineError::ReaderState("reader is not positioned on a row".to_owned())),
        };

        Ok((&entry.rows[index], entry.columns.len()))
    }

    fn get_typed(&self, statement: StatementHandle, ordinal: u16, want: WantedType) -> Result<TypedValue, EngineError> {
        let (row, column_count) = self.current_row(statement)?;
        if ordinal as usize >= column_count {
            return Err(EngineError::ReaderState(format!(
                "ordinal {ordinal} out of range (0..{column_count})"
            )));
        }
        decode_value(row, ordinal as usize, want)
    }

    pub fn reader_get_int16(&self, statement: StatementHandle, ordinal: u16) -> Result<TypedValue, EngineError> {
        self.get_typed(statement, ordinal, WantedType::Int16)
    }

    pub fn reader_get_int32(&self, statement: StatementHandle, ordinal: u16) -> Result<TypedValue, EngineError> {
        self.get_typed(statement, ordinal, WantedType::Int32)
    }

    pub fn reader_get_int64(&self, statement: StatementHandle, ordinal: u16) -> Result<TypedValue, EngineError> {
        self.get_typed(statement, ordinal, WantedType::Int64)
    }

    pub fn reader_get_string(&self, statement: StatementHandle, ordinal: u16) -> Result<TypedValue, EngineError> {
        self.get_typed(statement, ordinal, WantedType::String)
    }

    pub fn reader_get_field_type(&self, statement: StatementHandle, ordinal: u16) -> Result<TypedValue, EngineError> {
        self.get_typed(statement, ordinal, WantedType::FieldType)
    }

    /// Finalizes every handle owned by `peer`, in creation order, when that
    /// peer disconnects.
    pub async fn dispose_peer(&mut self, peer: PeerId) {
        let mut handles: Vec<(u64, StatementHandle)> = self
            .statements
            .iter()
            .filter(|(_, entry)| entry.owner == peer)
            .map(|(handle, entry)| (entry.seq, *handle))
            .collect();
        handles.sort_by_key(|(seq, _)| *seq);

        for (_, handle) in handles {
            self.dispose_command(handle).await;
        }

        let orphaned_readers: Vec<ReaderHandle> = self
            .readers
            .iter()
            .filter(|(_, entry)| entry.owner == peer)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in orphaned_readers {
            self.readers.remove(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_execute_dispose_round_trip() {
        let mut engine = LeaderEngine::open_in_memory().await.unwrap();
        let peer = PeerId(1);

        let h1 = engine
            .create_command(peer, "CREATE TABLE t(x INTEGER)".to_owned())
            .await
            .unwrap();
        assert_eq!(engine.execute_non_query(h1).await.unwrap(), 0);
        engine.dispose_command(h1).await;

        let h2 = engine
            .create_command(peer, "INSERT INTO t VALUES(42)".to_owned())
            .await
            .unwrap();
        assert_eq!(engine.execute_non_query(h2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn read_one_row_and_exhaust_cursor() {
        let mut engine = LeaderEngine::open_in_memory().await.unwrap();
        let peer = PeerId(1);

        let create = engine
            .create_command(peer, "CREATE TABLE t(x INTEGER)".to_owned())
            .await
            .unwrap();
        engine.execute_non_query(create).await.unwrap();
        let insert = engine
            .create_command(peer, "INSERT INTO t VALUES(42)".to_owned())
            .await
            .unwrap();
        engine.execute_non_query(insert).await.unwrap();

        let select = engine
            .create_command(peer, "SELECT x FROM t".to_owned())
            .await
            .unwrap();
        let columns = engine.execute_reader(select, 0).await.unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].name, "x");

        assert!(engine.reader_read(select).await.unwrap());
        let value = engine.reader_get_int32(select, 0).unwrap();
        assert_eq!(value, TypedValue::Int32(42));
        assert!(!engine.reader_read(select).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_column_ordinal_is_negative_one() {
        let mut engine = LeaderEngine::open_in_memory().await.unwrap();
        let peer = PeerId(1);
        let create = engine
            .create_command(peer, "CREATE TABLE t(x INTEGER)".to_owned())
            .await
            .unwrap();
        engine.execute_non_query(create).await.unwrap();
        let select = engine
            .create_command(peer, "SELECT x FROM t".to_owned())
            .await
            .unwrap();
        engine.execute_reader(select, 0).await.unwrap();
        assert_eq!(engine.reader_get_ordinal(select, "missing").unwrap(), -1);
    }

    #[tokio::test]
    async fn bad_sql_is_rejected_at_create_time() {
        let mut engine = LeaderEngine::open_in_memory().await.unwrap();
        let result = engine.create_command(PeerId(1), "NOT SQL".to_owned()).await;
        assert!(matches!(result, Err(EngineError::Sql(_))));
    }

    #[tokio::test]
    async fn empty_sql_is_invalid_operation() {
        let mut engine = LeaderEngine::open_in_memory().await.unwrap();
        let result = engine.create_command(PeerId(1), "   ".to_owned()).await;
        assert!(matches!(result, Err(EngineError::InvalidOperation)));
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let mut engine = LeaderEngine::open_in_memory().await.unwrap();
        let h1 = engine
            .create_command(PeerId(1), "CREATE TABLE t(x INTEGER)".to_owned())
            .await
            .unwrap();
        engine.dispose_command(h1).await;
        engine.dispose_command(h1).await; // must not panic
    }

    #[tokio::test]
    async fn handles_are_never_reused_across_creates() {
        let mut engine = LeaderEngine::open_in_memory().await.unwrap();
        let peer = PeerId(1);
        let h1 = engine
            .create_command(peer, "CREATE TABLE t(x INTEGER)".to_owned())
            .await
            .unwrap();
        engine.dispose_command(h1).await;
        let h2 = engine
            .create_command(peer, "CREATE TABLE u(y INTEGER)".to_owned())
            .await
            .unwrap();
        assert_ne!(h1, h2);
    }
}
