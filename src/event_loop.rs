//! The sub-reactor: a single-threaded event pump owning a set of
//! connections.
//!
//! Each poll tick services, in kernel-notification order, readable fds
//! (read → decode loop → `react` per frame → encoded output → immediate
//! flush), writable fds (drain the outbound ring, complete deferred
//! closes), then the cross-loop task queue in FIFO order, then the ticker
//! when this loop hosts it. The loop thread is the sole mutator of its
//! connection map; everything foreign arrives as a [`Task`].

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};

use crate::codec::Codec;
use crate::connection::{Conn, ConnState};
use crate::counter;
use crate::error::Error;
use crate::handler::{Action, EventHandler};
use crate::metrics;
use crate::net::{self, NetAddr};
use crate::poller::{PollEvent, Poller, Task};
use crate::server::Shared;

const READ_BUF_SIZE: usize = 64 * 1024;

enum FlushResult {
    Kept,
    Closed,
}

pub(crate) struct EventLoop {
    idx: usize,
    poller: Poller,
    connections: HashMap<RawFd, Conn>,
    conn_ids: HashMap<u64, RawFd>,
    load: Arc<AtomicI32>,
    handler: Arc<dyn EventHandler>,
    codec: Arc<dyn Codec>,
    shared: Arc<Shared>,
    /// Datagram sockets serviced by this loop (fd → bound address).
    /// The server owns these fds; the loop only polls them.
    udp_fds: HashMap<RawFd, Option<NetAddr>>,
    read_buf: Vec<u8>,
    events: Vec<PollEvent>,
    /// Next tick deadline when this loop hosts the ticker.
    next_tick: Option<Instant>,
    exiting: bool,
}

impl EventLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        idx: usize,
        poller: Poller,
        handler: Arc<dyn EventHandler>,
        codec: Arc<dyn Codec>,
        shared: Arc<Shared>,
        load: Arc<AtomicI32>,
        udp_fds: HashMap<RawFd, Option<NetAddr>>,
        ticker: bool,
    ) -> EventLoop {
        EventLoop {
            idx,
            poller,
            connections: HashMap::new(),
            conn_ids: HashMap::new(),
            load,
            handler,
            codec,
            shared,
            udp_fds,
            read_buf: vec![0u8; READ_BUF_SIZE],
            events: Vec::new(),
            next_tick: if ticker { Some(Instant::now()) } else { None },
            exiting: false,
        }
    }

    /// Run the event pump. Blocks the current thread until shutdown.
    pub fn run(&mut self) -> Result<(), Error> {
        counter::set_loop_shard(self.idx);
        debug!("event loop {} starting", self.idx);

        for (&fd, _) in &self.udp_fds {
            self.poller.register(fd, true, false).map_err(Error::Poller)?;
        }

        loop {
            let timeout = self
                .next_tick
                .map(|at| at.saturating_duration_since(Instant::now()));

            let woken = match self.poller.wait(&mut self.events, timeout) {
                Ok(woken) => woken,
                Err(e) => {
                    log::error!("event loop {}: poll failed: {e}", self.idx);
                    self.shared.signal_shutdown();
                    self.teardown();
                    return Err(Error::Poller(e));
                }
            };

            for i in 0..self.events.len() {
                let ev = self.events[i];
                if self.udp_fds.contains_key(&ev.fd) {
                    if ev.readable {
                        self.service_udp(ev.fd);
                    }
                    continue;
                }
                if ev.readable {
                    self.service_readable(ev.fd);
                } else if ev.error {
                    let err = net::take_socket_error(ev.fd)
                        .err()
                        .unwrap_or_else(|| io::Error::other("socket error event"));
                    self.close_conn(ev.fd, Some(Error::Io(err)));
                }
                if ev.writable {
                    self.service_writable(ev.fd);
                }
            }

            if woken {
                self.drain_tasks();
            }

            if let Some(at) = self.next_tick
                && Instant::now() >= at
            {
                self.run_tick();
            }

            if self.exiting || self.shared.is_shutdown() {
                self.teardown();
                return Ok(());
            }
        }
    }

    fn run_tick(&mut self) {
        let result = catch_unwind(AssertUnwindSafe(|| self.handler.tick()));
        match result {
            Ok((delay, action)) => {
                self.next_tick = Some(Instant::now() + delay);
                if action == Action::Shutdown {
                    self.shared.signal_shutdown();
                }
            }
            Err(_) => {
                metrics::HANDLER_PANICS.increment();
                self.next_tick = Some(Instant::now() + Duration::from_secs(1));
            }
        }
    }

    // ── Read path ───────────────────────────────────────────────────

    fn service_readable(&mut self, fd: RawFd) {
        let Some(conn) = self.connections.get_mut(&fd) else {
            return;
        };
        if conn.state == ConnState::Connecting {
            // Readability on a half-open connect only means failure (HUP);
            // success arrives as writability.
            if let Err(e) = net::take_socket_error(fd) {
                self.close_conn(fd, Some(Error::Io(e)));
            }
            return;
        }
        let n = unsafe {
            libc::read(
                fd,
                self.read_buf.as_mut_ptr() as *mut libc::c_void,
                self.read_buf.len(),
            )
        };
        if n == 0 {
            // EOF from the peer.
            self.close_conn(fd, None);
            return;
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => return,
                _ => {
                    self.close_conn(fd, Some(Error::Io(err)));
                    return;
                }
            }
        }
        let n = n as usize;
        conn.inbound.write(&self.read_buf[..n]);
        metrics::BYTES_RECEIVED.add(n as u64);

        self.drain_frames(fd);
    }

    /// Run the codec against the inbound ring until it stops yielding
    /// frames, invoking `react` per frame.
    fn drain_frames(&mut self, fd: RawFd) {
        loop {
            let Some(conn) = self.connections.get_mut(&fd) else {
                return;
            };
            if conn.state != ConnState::Open {
                return;
            }
            let frame = match self.codec.decode(conn) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.close_conn(fd, Some(Error::Codec(e)));
                    return;
                }
            };
            metrics::FRAMES_DECODED.increment();
            if !self.dispatch_frame(fd, &frame) {
                return;
            }
        }
        // No complete frame left; make sure queued output is moving.
        self.flush_outbound(fd);
    }

    /// Invoke `react` for one frame. Returns false when the connection is
    /// gone or no further frames should be delivered this tick.
    fn dispatch_frame(&mut self, fd: RawFd, frame: &[u8]) -> bool {
        let Some(conn) = self.connections.get_mut(&fd) else {
            return false;
        };
        let result = catch_unwind(AssertUnwindSafe(|| self.handler.react(frame, conn)));
        let Ok((out, action)) = result else {
            metrics::HANDLER_PANICS.increment();
            warn!("handler panicked in react; closing connection");
            self.close_conn(fd, None);
            return false;
        };
        self.apply_handler_output(fd, out, action, true) && action == Action::None
    }

    /// Queue handler output, apply its action, flush. Returns false when
    /// the connection was closed along the way.
    fn apply_handler_output(
        &mut self,
        fd: RawFd,
        out: Option<Bytes>,
        action: Action,
        encode: bool,
    ) -> bool {
        if let Some(bytes) = out {
            let Some(conn) = self.connections.get_mut(&fd) else {
                return false;
            };
            if encode {
                match self.codec.encode(conn, &bytes) {
                    Ok(wire) => conn.outbound.write(&wire),
                    Err(e) => {
                        self.close_conn(fd, Some(Error::Codec(e)));
                        return false;
                    }
                }
            } else {
                conn.outbound.write(&bytes);
            }
        }
        match action {
            Action::None => {}
            Action::Close => {
                if let Some(conn) = self.connections.get_mut(&fd) {
                    conn.state = ConnState::Closing;
                }
            }
            Action::Shutdown => self.shared.signal_shutdown(),
        }
        matches!(self.flush_outbound(fd), FlushResult::Kept)
    }

    // ── Write path ──────────────────────────────────────────────────

    fn service_writable(&mut self, fd: RawFd) {
        let state = match self.connections.get(&fd) {
            Some(conn) => conn.state,
            None => return,
        };
        if state == ConnState::Connecting {
            match net::take_socket_error(fd) {
                Ok(()) => self.finish_connect(fd),
                Err(e) => self.close_conn(fd, Some(Error::Io(e))),
            }
            return;
        }
        self.flush_outbound(fd);
    }

    /// Drain as much of the outbound ring as the kernel accepts, keep the
    /// write-interest flag in sync, and complete deferred closes.
    fn flush_outbound(&mut self, fd: RawFd) -> FlushResult {
        let Some(conn) = self.connections.get_mut(&fd) else {
            return FlushResult::Closed;
        };
        if conn.state == ConnState::Connecting {
            return FlushResult::Kept;
        }

        let mut io_err = None;
        while !conn.outbound.is_empty() {
            self.handler.pre_write();
            let n = {
                let (a, b) = conn.outbound.peek_all();
                let iov = [
                    libc::iovec {
                        iov_base: a.as_ptr() as *mut libc::c_void,
                        iov_len: a.len(),
                    },
                    libc::iovec {
                        iov_base: b.as_ptr() as *mut libc::c_void,
                        iov_len: b.len(),
                    },
                ];
                let cnt: libc::c_int = if b.is_empty() { 1 } else { 2 };
                unsafe { libc::writev(fd, iov.as_ptr(), cnt) }
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR) => continue,
                    _ => {
                        io_err = Some(err);
                        break;
                    }
                }
            }
            conn.outbound.shift(n as usize);
            metrics::BYTES_SENT.add(n as u64);
        }

        if let Some(err) = io_err {
            self.close_conn(fd, Some(Error::Io(err)));
            return FlushResult::Closed;
        }

        let closing = conn.state == ConnState::Closing;
        if closing && conn.outbound.is_empty() {
            self.close_conn(fd, None);
            return FlushResult::Closed;
        }

        let want_write = !conn.outbound.is_empty();
        // A closing connection stops reading while its tail drains.
        if want_write != conn.want_write || closing {
            conn.want_write = want_write;
            if let Err(e) = self.poller.modify(fd, !closing, want_write) {
                self.close_conn(fd, Some(Error::Poller(e)));
                return FlushResult::Closed;
            }
        }
        FlushResult::Kept
    }

    // ── Connect completion ──────────────────────────────────────────

    fn finish_connect(&mut self, fd: RawFd) {
        {
            let Some(conn) = self.connections.get_mut(&fd) else {
                return;
            };
            conn.state = ConnState::Open;
            conn.want_write = false;
            conn.local_addr = net::local_addr_of(fd);
            if conn.remote_addr.is_none() {
                conn.remote_addr = net::peer_addr_of(fd);
            }
            if let Err(e) = self.poller.modify(fd, true, false) {
                self.close_conn(fd, Some(Error::Poller(e)));
                return;
            }
        }
        self.fire_on_opened(fd);
    }

    fn fire_on_opened(&mut self, fd: RawFd) {
        let Some(conn) = self.connections.get_mut(&fd) else {
            return;
        };
        let result = catch_unwind(AssertUnwindSafe(|| self.handler.on_opened(conn)));
        let Ok((out, action)) = result else {
            metrics::HANDLER_PANICS.increment();
            warn!("handler panicked in on_opened; closing connection");
            self.close_conn(fd, None);
            return;
        };
        // on_opened bytes bypass the codec.
        self.apply_handler_output(fd, out, action, false);
    }

    // ── Task queue ──────────────────────────────────────────────────

    fn drain_tasks(&mut self) {
        while let Some(task) = self.poller.next_task() {
            metrics::TASKS_EXECUTED.increment();
            match task {
                Task::Register(conn) => self.register_conn(conn),
                Task::AsyncWrite { conn_id, data } => {
                    let Some(&fd) = self.conn_ids.get(&conn_id) else {
                        continue;
                    };
                    if let Some(conn) = self.connections.get_mut(&fd) {
                        if conn.state == ConnState::Closing {
                            continue;
                        }
                        conn.outbound.write(&data);
                    }
                    self.flush_outbound(fd);
                }
                Task::Wake { conn_id } => {
                    let Some(&fd) = self.conn_ids.get(&conn_id) else {
                        continue;
                    };
                    self.wake_conn(fd);
                }
                Task::Close { conn_id } => {
                    let Some(&fd) = self.conn_ids.get(&conn_id) else {
                        continue;
                    };
                    if let Some(conn) = self.connections.get_mut(&fd) {
                        conn.state = ConnState::Closing;
                    }
                    self.flush_outbound(fd);
                }
                Task::SendTo { fd, peer, data } => {
                    send_datagram(fd, peer, &data);
                }
                Task::Shutdown => self.exiting = true,
            }
        }
    }

    /// Deliver an empty frame so the handler can emit bytes on demand.
    fn wake_conn(&mut self, fd: RawFd) {
        let Some(conn) = self.connections.get_mut(&fd) else {
            return;
        };
        if conn.state != ConnState::Open {
            return;
        }
        let result = catch_unwind(AssertUnwindSafe(|| self.handler.react(&[], conn)));
        let Ok((out, action)) = result else {
            metrics::HANDLER_PANICS.increment();
            self.close_conn(fd, None);
            return;
        };
        self.apply_handler_output(fd, out, action, true);
    }

    /// Adopt a connection handed over by the acceptor or a dial call.
    fn register_conn(&mut self, conn: Box<Conn>) {
        let fd = conn.fd;
        let id = conn.id;
        let connecting = conn.state == ConnState::Connecting;
        if let Err(e) = self.poller.register(fd, !connecting, connecting) {
            warn!("loop {}: failed to register fd {fd}: {e}", self.idx);
            unsafe { libc::close(fd) };
            return;
        }
        let mut conn = *conn;
        if connecting {
            conn.want_write = true;
        }
        let dialed = conn.dialed;
        self.connections.insert(fd, conn);
        self.conn_ids.insert(id, fd);
        self.load.fetch_add(1, Ordering::Relaxed);
        metrics::CONNECTIONS_ACTIVE.increment();
        if dialed {
            metrics::CONNECTIONS_DIALED.increment();
        } else {
            metrics::CONNECTIONS_ACCEPTED.increment();
        }
        if !connecting {
            self.fire_on_opened(fd);
        }
    }

    // ── Datagrams ───────────────────────────────────────────────────

    fn service_udp(&mut self, fd: RawFd) {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    fd,
                    self.read_buf.as_mut_ptr() as *mut libc::c_void,
                    self.read_buf.len(),
                    0,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut addr_len,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR) => continue,
                    _ => {
                        warn!("loop {}: recvfrom failed: {err}", self.idx);
                        break;
                    }
                }
            }
            let n = n as usize;
            metrics::UDP_DATAGRAMS_RECEIVED.increment();
            metrics::BYTES_RECEIVED.add(n as u64);

            let Some(peer) = net::sockaddr_to_socket_addr(&storage) else {
                continue;
            };
            let local = self.udp_fds.get(&fd).cloned().flatten();

            // Lifecycle of a datagram connection is create → react → drop;
            // it never enters the connection map.
            let mut conn = Conn::datagram(
                fd,
                self.idx,
                self.poller.trigger(),
                local,
                peer,
                &self.read_buf[..n],
            );
            let result = catch_unwind(AssertUnwindSafe(|| {
                self.handler.react(&self.read_buf[..n], &mut conn)
            }));
            let Ok((out, action)) = result else {
                metrics::HANDLER_PANICS.increment();
                continue;
            };
            if let Some(bytes) = out {
                self.handler.pre_write();
                send_datagram(fd, peer, &bytes);
            }
            if action == Action::Shutdown {
                self.shared.signal_shutdown();
            }
        }
    }

    // ── Close path ──────────────────────────────────────────────────

    /// Tear one connection down: disarm interest, best-effort drain,
    /// `on_closed`, unmap, close the fd, drop the loop's load count.
    fn close_conn(&mut self, fd: RawFd, err: Option<Error>) {
        let Some(mut conn) = self.connections.remove(&fd) else {
            return;
        };
        self.conn_ids.remove(&conn.id);
        let _ = self.poller.deregister(fd);

        if err.is_none() && !conn.outbound.is_empty() {
            drain_best_effort(fd, &mut conn);
        }

        let opened = conn.state != ConnState::Connecting;
        conn.state = ConnState::Closing;
        let action = if opened {
            let result =
                catch_unwind(AssertUnwindSafe(|| {
                    self.handler.on_closed(&mut conn, err.as_ref())
                }));
            match result {
                Ok(action) => action,
                Err(_) => {
                    metrics::HANDLER_PANICS.increment();
                    Action::None
                }
            }
        } else {
            Action::None
        };

        unsafe { libc::close(fd) };
        self.load.fetch_sub(1, Ordering::Relaxed);
        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();
        if let Some(e) = &err {
            debug!("loop {}: connection {} closed: {e}", self.idx, conn.id);
        }
        if action == Action::Shutdown {
            self.shared.signal_shutdown();
        }
    }

    /// Close everything this loop owns and drop any unprocessed tasks.
    fn teardown(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            self.close_conn(fd, None);
        }
        for (&fd, _) in &self.udp_fds {
            let _ = self.poller.deregister(fd);
        }
        // Registrations queued behind the shutdown task never opened;
        // close their fds without callbacks.
        while let Some(task) = self.poller.next_task() {
            if let Task::Register(conn) = task {
                unsafe { libc::close(conn.fd) };
            }
        }
        debug!("event loop {} exited", self.idx);
    }
}

/// Write one datagram; short sends cannot happen for UDP.
fn send_datagram(fd: RawFd, peer: SocketAddr, data: &[u8]) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = net::socket_addr_to_sockaddr(peer, &mut storage);
    let n = unsafe {
        libc::sendto(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            0,
            &storage as *const _ as *const libc::sockaddr,
            addr_len,
        )
    };
    if n < 0 {
        warn!("sendto {peer} failed: {}", io::Error::last_os_error());
    } else {
        metrics::UDP_DATAGRAMS_SENT.increment();
        metrics::BYTES_SENT.add(n as u64);
    }
}

/// One last attempt to hand queued bytes to the kernel before closing.
fn drain_best_effort(fd: RawFd, conn: &mut Conn) {
    while !conn.outbound.is_empty() {
        let n = {
            let (a, b) = conn.outbound.peek_all();
            let iov = [
                libc::iovec {
                    iov_base: a.as_ptr() as *mut libc::c_void,
                    iov_len: a.len(),
                },
                libc::iovec {
                    iov_base: b.as_ptr() as *mut libc::c_void,
                    iov_len: b.len(),
                },
            ];
            let cnt: libc::c_int = if b.is_empty() { 1 } else { 2 };
            unsafe { libc::writev(fd, iov.as_ptr(), cnt) }
        };
        if n <= 0 {
            break;
        }
        conn.outbound.shift(n as usize);
        metrics::BYTES_SENT.add(n as u64);
    }
}
