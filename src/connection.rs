//! Per-connection state and the off-loop handle.
//!
//! A [`Conn`] lives inside exactly one sub-reactor's connection map and is
//! only ever touched by that loop's thread. Code running anywhere else
//! holds a [`ConnHandle`] — a `(id, task-queue)` pair. Every handle
//! operation becomes a task posted to the owning loop, which keeps
//! cross-thread aliasing impossible without per-operation reference
//! counting.

use std::any::Any;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::buffer::RingBuffer;
use crate::error::Error;
use crate::net::{self, NetAddr};
use crate::poller::{Task, Trigger};

/// Monotonic connection ids for user-level addressing. Never reused.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Outbound connect in flight; write readiness reports the outcome.
    Connecting,
    /// Established and registered for reads.
    Open,
    /// Close requested; completes once the outbound ring drains.
    Closing,
}

/// A single connection: fd identity, byte rings, address snapshots and an
/// opaque user-context slot.
pub struct Conn {
    pub(crate) id: u64,
    pub(crate) fd: RawFd,
    pub(crate) loop_idx: usize,
    pub(crate) state: ConnState,
    pub(crate) want_write: bool,
    pub(crate) inbound: RingBuffer,
    pub(crate) outbound: RingBuffer,
    pub(crate) local_addr: Option<NetAddr>,
    pub(crate) remote_addr: Option<NetAddr>,
    pub(crate) trigger: Trigger,
    /// Source address of the datagram for synthesized UDP connections.
    pub(crate) udp_peer: Option<SocketAddr>,
    pub(crate) dialed: bool,
    ctx: Option<Box<dyn Any + Send>>,
}

impl Conn {
    pub(crate) fn accepted(
        fd: RawFd,
        loop_idx: usize,
        trigger: Trigger,
        local_addr: Option<NetAddr>,
        remote_addr: Option<NetAddr>,
    ) -> Conn {
        Conn {
            id: next_conn_id(),
            fd,
            loop_idx,
            state: ConnState::Open,
            want_write: false,
            inbound: RingBuffer::new(),
            outbound: RingBuffer::new(),
            local_addr,
            remote_addr,
            trigger,
            udp_peer: None,
            dialed: false,
            ctx: None,
        }
    }

    pub(crate) fn dialed(
        fd: RawFd,
        loop_idx: usize,
        trigger: Trigger,
        remote_addr: NetAddr,
        established: bool,
    ) -> Conn {
        Conn {
            id: next_conn_id(),
            fd,
            loop_idx,
            state: if established {
                ConnState::Open
            } else {
                ConnState::Connecting
            },
            want_write: false,
            inbound: RingBuffer::new(),
            outbound: RingBuffer::new(),
            local_addr: net::local_addr_of(fd),
            remote_addr: Some(remote_addr),
            trigger,
            udp_peer: None,
            dialed: true,
            ctx: None,
        }
    }

    /// Short-lived connection-like value wrapping one datagram.
    /// Lifecycle is create → react → drop; it never enters the map.
    pub(crate) fn datagram(
        fd: RawFd,
        loop_idx: usize,
        trigger: Trigger,
        local_addr: Option<NetAddr>,
        peer: SocketAddr,
        payload: &[u8],
    ) -> Conn {
        let mut inbound = RingBuffer::with_capacity(payload.len());
        inbound.write(payload);
        Conn {
            id: next_conn_id(),
            fd,
            loop_idx,
            state: ConnState::Open,
            want_write: false,
            inbound,
            outbound: RingBuffer::new(),
            local_addr,
            remote_addr: Some(NetAddr::Inet(peer)),
            trigger,
            udp_peer: Some(peer),
            dialed: false,
            ctx: None,
        }
    }

    /// Monotonic 64-bit id, unique for the process lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Index of the sub-reactor that owns this connection.
    pub fn loop_index(&self) -> usize {
        self.loop_idx
    }

    /// Address of this end of the connection.
    pub fn local_addr(&self) -> Option<&NetAddr> {
        self.local_addr.as_ref()
    }

    /// Address of the remote peer (datagram source for UDP).
    pub fn remote_addr(&self) -> Option<&NetAddr> {
        self.remote_addr.as_ref()
    }

    /// Store an opaque user context on the connection.
    pub fn set_context<T: Any + Send>(&mut self, ctx: T) {
        self.ctx = Some(Box::new(ctx));
    }

    /// Borrow the user context, if one of type `T` is stored.
    pub fn context<T: Any + Send>(&self) -> Option<&T> {
        self.ctx.as_ref().and_then(|c| c.downcast_ref())
    }

    /// Mutably borrow the user context.
    pub fn context_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.ctx.as_mut().and_then(|c| c.downcast_mut())
    }

    /// Bytes received but not yet consumed by the codec.
    pub fn buffer_len(&self) -> usize {
        self.inbound.len()
    }

    /// Peek at the first `n` inbound bytes without consuming. The view may
    /// span two slices when the ring wraps; treat the pair as one range.
    pub fn peek(&self, n: usize) -> (&[u8], &[u8]) {
        self.inbound.peek(n)
    }

    /// Peek at all buffered inbound bytes.
    pub fn peek_all(&self) -> (&[u8], &[u8]) {
        self.inbound.peek_all()
    }

    /// Copy out the first `n` inbound bytes without consuming them.
    /// `n == 0` reads everything, mirroring the buffered length query.
    pub fn read_n(&self, n: usize) -> Vec<u8> {
        let n = if n == 0 { self.inbound.len() } else { n };
        self.inbound.copy_out(n)
    }

    /// Explicitly discard `n` consumed inbound bytes. Clamped to the
    /// buffered length; zero is a no-op.
    pub fn shift_n(&mut self, n: usize) {
        self.inbound.shift(n);
    }

    /// Whether the connection is established and not closing.
    pub fn is_open(&self) -> bool {
        self.state == ConnState::Open
    }

    /// A cloneable handle for off-loop operations on this connection.
    pub fn handle(&self) -> ConnHandle {
        ConnHandle {
            id: self.id,
            trigger: self.trigger.clone(),
            udp: self.udp_peer.map(|peer| (self.fd, peer)),
        }
    }

    /// Open an outbound connection owned by this connection's loop.
    ///
    /// Intended for proxy patterns: both ends end up serviced by the same
    /// thread, so no cross-loop hop sits between them. The connect is
    /// non-blocking; `on_opened` fires once it completes. The returned
    /// handle is valid immediately (writes queue until established).
    pub fn dial(&self, proto_addr: &str) -> Result<ConnHandle, Error> {
        let (proto, rest) = net::split_proto_addr(proto_addr)?;
        if !proto.is_stream() {
            return Err(Error::UnsupportedProtocol(proto_addr.to_string()));
        }
        let target = match proto {
            net::Protocol::Unix => NetAddr::Unix(rest.into()),
            _ => NetAddr::Inet(net::resolve_inet(rest, proto)?),
        };
        let (fd, established) = net::start_connect(&target)?;
        let conn = Conn::dialed(fd, self.loop_idx, self.trigger.clone(), target, established);
        let handle = conn.handle();
        self.trigger.submit(Task::Register(Box::new(conn)))?;
        Ok(handle)
    }
}

/// Stable `(connection-id, task-queue)` handle for use from any thread.
///
/// A handle is only a lookup key: it never keeps the connection alive, and
/// operations on a closed connection are silently dropped by the owning
/// loop.
#[derive(Clone)]
pub struct ConnHandle {
    id: u64,
    trigger: Trigger,
    udp: Option<(RawFd, SocketAddr)>,
}

impl ConnHandle {
    /// Id of the connection this handle refers to.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue `data` on the connection's outbound ring and arm write
    /// interest. Returns once the task is posted, without awaiting the
    /// flush. Bytes are written raw, bypassing the codec.
    pub fn async_write(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        let data = data.into();
        match self.udp {
            Some((fd, peer)) => self.trigger.submit(Task::SendTo { fd, peer, data }),
            None => self.trigger.submit(Task::AsyncWrite {
                conn_id: self.id,
                data,
            }),
        }
    }

    /// Invoke the frame handler with an empty frame, letting user code
    /// emit bytes on demand.
    pub fn wake(&self) -> Result<(), Error> {
        self.trigger.submit(Task::Wake { conn_id: self.id })
    }

    /// Write a single datagram back to the peer of a UDP connection.
    pub fn send_to(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        let (fd, peer) = self.udp.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "send_to on a stream connection",
            ))
        })?;
        self.trigger.submit(Task::SendTo {
            fd,
            peer,
            data: data.into(),
        })
    }

    /// Initiate the close path on the owning loop.
    pub fn close(&self) -> Result<(), Error> {
        self.trigger.submit(Task::Close { conn_id: self.id })
    }
}
