//! The connection controller: election, reconnection, and the
//! wait-if-connecting gate (`spec.md §4.5`).
//!
//! Election itself is explicitly out of this crate's scope (`spec.md §1`);
//! [`RoleSource`] is the seam an external collaborator plugs into. It is
//! handed a fresh [`RoleAssignment`] every time the connection should (re)
//! acquire a role, and is trusted to notice when that assignment is lost —
//! mirroring how `lib/src/network/mod.rs` hands connection-state changes to
//! a `watch` channel that callers subscribe to rather than poll.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use sqlrelay_net::Transport;
use tokio::sync::{watch, Notify};

use crate::{
    command::Command,
    options::ConnectionOptions,
    worker::{Backend, RelayWorker},
    Error,
};

#[cfg(feature = "leader")]
use tokio::sync::Mutex as AsyncMutex;

/// The role a [`Connection`] currently holds, per `spec.md §3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Connecting,
    Leader,
    Follower,
}

/// What an election handed the connection. Produced by a [`RoleSource`].
pub enum RoleAssignment {
    /// This process is the leader: the engine it should drive directly.
    #[cfg(feature = "leader")]
    Leader(Arc<AsyncMutex<sqlrelay_engine::LeaderEngine>>),
    /// This process is a follower: the transport to the current leader.
    Follower(Transport),
}

/// The external election/reconnection collaborator `spec.md §1` carves out
/// of this crate's scope. `next_role` is called in a loop by the
/// connection's background driver: it should resolve once a role has been
/// (re)acquired, and the resulting assignment is expected to know when it
/// has been lost (e.g. a `Follower` assignment backed by a [`Transport`]
/// whose [`Transport::disconnected`] has fired) so the driver can go back
/// to `Connecting` and call `next_role` again.
#[async_trait]
pub trait RoleSource: Send + Sync + 'static {
    async fn next_role(&self) -> RoleAssignment;

    /// Resolves when a previously returned assignment should be considered
    /// lost. The default implementation is appropriate for a `Follower`
    /// assignment; a source whose `Leader` assignments can also be lost
    /// should override this.
    async fn lost(&self, assignment: &RoleAssignment) {
        match assignment {
            #[cfg(feature = "leader")]
            RoleAssignment::Leader(_) => std::future::pending().await,
            RoleAssignment::Follower(transport) => transport.disconnected().await,
        }
    }
}

#[derive(Clone)]
enum ConnState {
    Connecting,
    Ready(Role, Backend),
}

struct Shared {
    state: watch::Sender<ConnState>,
    closed: AtomicBool,
    close_notify: Notify,
}

/// Holds a connection string, a role, and — when Follower — the framed
/// transport to the leader, per `spec.md §3`. Cloning is cheap: all clones
/// share the same background driver and role state.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    options: Arc<ConnectionOptions>,
}

impl Connection {
    /// Starts the background driver against `source` and returns
    /// immediately in the `Connecting` role; callers that need to block
    /// until a role is acquired should call [`Connection::wait_if_connecting`].
    pub fn new(source: impl RoleSource, options: ConnectionOptions) -> Self {
        let (tx, _rx) = watch::channel(ConnState::Connecting);
        let shared = Arc::new(Shared {
            state: tx,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });

        let driver_shared = shared.clone();
        let source = Arc::new(source);
        tokio::spawn(async move { drive(driver_shared, source).await });

        Self {
            shared,
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Builds a [`Command`] bound to this connection, with `CommandTimeout`
    /// defaulting to `DefaultTimeout` from the connection's options
    /// (`spec.md §4.6`). The command's worker is not created yet — that
    /// happens lazily on first execute.
    pub fn command(&self, command_text: impl Into<String>) -> Command {
        Command::new(self.clone(), command_text.into(), self.options.default_timeout())
    }

    pub fn role(&self) -> Role {
        match &*self.shared.state.borrow() {
            ConnState::Connecting => Role::Connecting,
            ConnState::Ready(role, _) => *role,
        }
    }

    /// Blocks until the role is `Leader` or `Follower`, the connection is
    /// closed, or `cancel` resolves — whichever comes first.
    pub async fn wait_if_connecting(&self) -> Result<(), Error> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Disconnected);
        }

        let mut rx = self.shared.state.subscribe();
        loop {
            if matches!(&*rx.borrow(), ConnState::Ready(..)) {
                return Ok(());
            }

            tokio::select! {
                changed = rx.changed() => {
                    changed.map_err(|_| Error::Disconnected)?;
                }
                _ = self.shared.close_notify.notified() => {
                    return Err(Error::Disconnected);
                }
            }
        }
    }

    /// In Leader state, constructs a worker that calls directly into
    /// SQLite; in Follower state, issues `CreateCommandRequest` and wraps
    /// the returned handle. Called lazily on first execute by `Command`.
    pub(crate) async fn create_worker(&self, sql: String, timeout: std::time::Duration) -> Result<RelayWorker, Error> {
        self.wait_if_connecting().await?;

        let backend = match &*self.shared.state.borrow() {
            ConnState::Ready(_, backend) => backend.clone(),
            ConnState::Connecting => return Err(Error::Disconnected),
        };

        RelayWorker::create_command(backend, sql, timeout).await
    }

    /// Explicit close: releases every waiter with `Disconnected` and stops
    /// the background driver from re-electing. Idempotent.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.close_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

async fn drive(shared: Arc<Shared>, source: Arc<dyn RoleSource>) {
    loop {
        if shared.closed.load(Ordering::Acquire) {
            return;
        }

        let _ = shared.state.send(ConnState::Connecting);

        let assignment = source.next_role().await;
        let (role, backend) = match &assignment {
            #[cfg(feature = "leader")]
            RoleAssignment::Leader(engine) => (Role::Leader, Backend::Local(engine.clone())),
            RoleAssignment::Follower(transport) => (Role::Follower, Backend::Remote(transport.clone())),
        };

        let _ = shared.state.send(ConnState::Ready(role, backend));

        tokio::select! {
            () = source.lost(&assignment) => {}
            () = async {
                shared.close_notify.notified().await;
            } => {
                return;
            }
        }
    }
}

/// A [`RoleSource`] that hands out a single, fixed assignment once and
/// never reports it lost. Appropriate for a caller that has already
/// resolved its leader out-of-band and doesn't need reconnection — e.g.
/// `sqlrelay-cli exec`'s one-shot connection, or a test that doesn't
/// exercise election.
pub struct FixedRole(tokio::sync::Mutex<Option<RoleAssignment>>);

impl FixedRole {
    pub fn new(assignment: RoleAssignment) -> Self {
        Self(tokio::sync::Mutex::new(Some(assignment)))
    }
}

#[async_trait]
impl RoleSource for FixedRole {
    async fn next_role(&self) -> RoleAssignment {
        let mut slot = self.0.lock().await;
        slot.take().expect("FixedRole asked for a role more than once")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnectionOptions;
    use sqlrelay_net::Transport;
    use tokio::io::duplex;

    #[tokio::test]
    async fn wait_if_connecting_resolves_once_a_role_is_assigned() {
        let (client_io, _server_io) = duplex(4096);
        let (transport, _incoming) = Transport::new(client_io);
        let connection = Connection::new(FixedRole::new(RoleAssignment::Follower(transport)), ConnectionOptions::default());

        connection.wait_if_connecting().await.unwrap();
        assert_eq!(connection.role(), Role::Follower);
    }

    #[tokio::test]
    async fn close_releases_a_waiting_caller() {
        let connection = Connection::new(
            HangingSource,
            ConnectionOptions::default(),
        );
        let waiter = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.wait_if_connecting().await })
        };

        tokio::task::yield_now().await;
        connection.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Disconnected)));
    }

    struct HangingSource;

    #[async_trait]
    impl RoleSource for HangingSource {
        async fn next_role(&self) -> RoleAssignment {
            std::future::pending().await
        }
    }
}
