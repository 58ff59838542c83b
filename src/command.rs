//! The client-facing `Command`, per `spec.md §3`/`§4.6`.

use std::time::Duration;

use crate::{
    connection::Connection,
    reader::Reader,
    worker::RelayWorker,
    Error,
};

/// A SQL statement bound to a [`Connection`]. Mirrors the normal embedded
/// database client surface: callers cannot tell whether execution happens
/// locally (Leader role) or is relayed to the leader over the wire
/// (Follower role).
///
/// The worker is created at most once, on the first `execute*` call, and
/// bound for the command's lifetime — later changes to
/// [`Command::set_command_text`] or [`Command::set_timeout`] after that
/// point are rejected rather than silently ignored.
pub struct Command {
    connection: Connection,
    command_text: String,
    timeout: Duration,
    worker: Option<RelayWorker>,
    disposed: bool,
}

impl Command {
    pub(crate) fn new(connection: Connection, command_text: String, timeout: Duration) -> Self {
        Self {
            connection,
            command_text,
            timeout,
            worker: None,
            disposed: false,
        }
    }

    pub fn command_text(&self) -> &str {
        &self.command_text
    }

    /// Fails with [`Error::InvalidOperation`] once the worker has been
    /// bound — this crate's stricter reading of "worker created at most
    /// once" (`spec.md §3`): a bound command's text cannot be changed out
    /// from under its already-prepared statement.
    pub fn set_command_text(&mut self, command_text: impl Into<String>) -> Result<(), Error> {
        self.ensure_not_disposed()?;
        if self.worker.is_some() {
            return Err(Error::InvalidOperation(
                "command text cannot change after the command has executed".to_owned(),
            ));
        }
        self.command_text = command_text.into();
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.ensure_not_disposed()?;
        self.timeout = timeout;
        Ok(())
    }

    fn ensure_not_disposed(&self) -> Result<(), Error> {
        if self.disposed {
            Err(Error::ObjectDisposed)
        } else {
            Ok(())
        }
    }

    fn validate_command_text(&self) -> Result<(), Error> {
        if self.command_text.trim().is_empty() {
            return Err(Error::InvalidOperation(
                "command text must not be empty or consist only of whitespace".to_owned(),
            ));
        }
        Ok(())
    }

    async fn worker(&mut self) -> Result<&RelayWorker, Error> {
        self.ensure_not_disposed()?;
        self.validate_command_text()?;

        if self.worker.is_none() {
            let worker = self
                .connection
                .create_worker(self.command_text.clone(), self.timeout)
                .await?;
            self.worker = Some(worker);
        }

        Ok(self.worker.as_ref().expect("just bound"))
    }

    pub async fn execute_non_query(&mut self) -> Result<i32, Error> {
        let timeout = self.timeout;
        let worker = self.worker().await?;
        worker.execute_non_query(timeout).await
    }

    /// `behavior` mirrors the wire field of the same name (`spec.md §6`);
    /// this crate does not interpret it beyond forwarding it to the leader.
    pub async fn execute_reader(&mut self, behavior: u32) -> Result<Reader, Error> {
        let timeout = self.timeout;
        let worker = self.worker().await?.clone();
        let columns = worker.execute_reader(behavior, timeout).await?;
        Ok(Reader::new(worker, columns, timeout))
    }

    /// Best-effort: errors are swallowed, per `spec.md §4.4`/`§7`. Safe to
    /// call more than once.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(worker) = self.worker.take() {
            worker.dispose().await;
        }
    }
}
