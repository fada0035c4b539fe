//! The event-handler contract between the framework and user code.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use bytes::Bytes;

use crate::connection::Conn;
use crate::error::Error;
use crate::net::NetAddr;

/// What the loop should do after a handler callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep going.
    #[default]
    None,
    /// Close the current connection once its outbound bytes drain.
    Close,
    /// Stop the whole server gracefully.
    Shutdown,
}

/// Read-only view of a running server, handed to [`EventHandler::on_init`]
/// and [`EventHandler::on_shutdown`].
pub struct Server {
    pub(crate) addr: NetAddr,
    pub(crate) num_event_loops: usize,
    pub(crate) loads: Vec<Arc<AtomicI32>>,
    pub(crate) listen_fd: Option<RawFd>,
}

impl Server {
    /// The resolved address the listener is bound to.
    pub fn local_addr(&self) -> &NetAddr {
        &self.addr
    }

    /// Number of sub-reactor loops.
    pub fn num_event_loops(&self) -> usize {
        self.num_event_loops
    }

    /// Connections currently owned by the sub-reactors.
    pub fn count_connections(&self) -> usize {
        self.loads
            .iter()
            .map(|l| l.load(Ordering::Relaxed).max(0) as usize)
            .sum()
    }

    /// Duplicate the listener fd for socket-handoff scenarios.
    ///
    /// The caller owns the returned descriptor.
    pub fn dup_fd(&self) -> Result<RawFd, Error> {
        let fd = self.listen_fd.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "server has no listener",
            ))
        })?;
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(dup)
    }
}

/// Callbacks driving a server. All methods default to no-ops so handlers
/// override only what they need.
///
/// Invariants the framework guarantees:
/// - between `on_opened` and `on_closed`, every callback for one connection
///   runs on the same sub-reactor thread;
/// - frames arrive in byte-stream order;
/// - `on_closed` fires exactly once per opened connection.
///
/// Handlers must be short and non-blocking: the loop does no other work
/// while a callback runs. Blocking CPU work belongs on an external worker
/// pool that re-enters through [`crate::ConnHandle::async_write`].
pub trait EventHandler: Send + Sync + 'static {
    /// Called once after the listener is bound, before accepting.
    fn on_init(&self, _server: &Server) -> Action {
        Action::None
    }

    /// Called once per new connection. Returned bytes are written before
    /// any frame processing, bypassing the codec.
    fn on_opened(&self, _conn: &mut Conn) -> (Option<Bytes>, Action) {
        (None, Action::None)
    }

    /// Called once per connection teardown. `err` is the transport or
    /// codec error that caused the close, if any.
    fn on_closed(&self, _conn: &mut Conn, _err: Option<&Error>) -> Action {
        Action::None
    }

    /// Called per decoded frame (or per datagram for UDP; a `wake()`
    /// delivers an empty frame). Returned bytes are codec-encoded and
    /// queued on the outbound ring.
    fn react(&self, _frame: &[u8], _conn: &mut Conn) -> (Option<Bytes>, Action) {
        (None, Action::None)
    }

    /// Diagnostic hook invoked just before a write syscall.
    fn pre_write(&self) {}

    /// Periodic callback when the ticker option is enabled. The returned
    /// delay governs the next invocation.
    fn tick(&self) -> (Duration, Action) {
        (Duration::from_secs(1), Action::None)
    }

    /// Called once during graceful stop, after the loops quiesce.
    fn on_shutdown(&self, _server: &Server) {}
}
