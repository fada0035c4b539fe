//! epoll-backed readiness poller with a cross-thread wake channel.
//!
//! Each event loop owns one [`Poller`]: an epoll instance plus an eventfd
//! registered for readability. Foreign threads reach the loop through a
//! [`Trigger`] — an unbounded MPSC send half paired with the eventfd. A
//! submit is a lock-free channel push and an 8-byte eventfd write, safe
//! from any thread; the receiving loop drains tasks in FIFO order.
//!
//! Readiness is level-triggered: the kernel keeps reporting an fd while it
//! has pending data, so a single read/write pass per event suffices.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};

use crate::connection::Conn;

/// Marker carried in the epoll user-data slot for the wake eventfd.
const WAKE_TOKEN: u64 = u64::MAX;

/// An operation posted to a specific event loop's thread.
///
/// Tasks on one queue execute in submission order.
pub(crate) enum Task {
    /// Adopt a newly accepted or dialed connection.
    Register(Box<Conn>),
    /// Append bytes to a connection's outbound ring and arm write interest.
    AsyncWrite { conn_id: u64, data: Bytes },
    /// Invoke the frame handler with an empty frame.
    Wake { conn_id: u64 },
    /// Initiate the close path for a connection.
    Close { conn_id: u64 },
    /// Write one datagram back to a UDP peer.
    SendTo {
        fd: RawFd,
        peer: SocketAddr,
        data: Bytes,
    },
    /// Drain and exit the loop.
    Shutdown,
}

/// One readiness event delivered by [`Poller::wait`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// EPOLLERR / EPOLLHUP — routed to the close path by the loop.
    pub error: bool,
}

/// Send half of a loop's task queue. Cheap to clone, safe from any thread.
#[derive(Clone)]
pub(crate) struct Trigger {
    wake_fd: RawFd,
    tx: Sender<Task>,
}

impl Trigger {
    /// Post a task and wake the owning loop's poll call.
    pub fn submit(&self, task: Task) -> Result<(), crate::error::Error> {
        self.tx
            .send(task)
            .map_err(|_| crate::error::Error::LoopTerminated)?;
        let one: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &one as *const u64 as *const libc::c_void, 8);
        }
        Ok(())
    }
}

/// epoll instance + wake eventfd + task receiver for one loop.
pub(crate) struct Poller {
    epfd: RawFd,
    wake_fd: RawFd,
    tasks: Receiver<Task>,
    tx: Sender<Task>,
    event_buf: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        let ret = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epfd);
            }
            return Err(err);
        }

        let (tx, tasks) = crossbeam_channel::unbounded();
        Ok(Poller {
            epfd,
            wake_fd,
            tasks,
            tx,
            event_buf: vec![libc::epoll_event { events: 0, u64: 0 }; 1024],
        })
    }

    /// A send handle for this loop's task queue.
    pub fn trigger(&self) -> Trigger {
        Trigger {
            wake_fd: self.wake_fd,
            tx: self.tx.clone(),
        }
    }

    /// Register interest for `fd`. The fd itself is the lookup key.
    pub fn register(&self, fd: RawFd, readable: bool, writable: bool) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, readable, writable)
    }

    /// Change interest for an already registered fd.
    pub fn modify(&self, fd: RawFd, readable: bool, writable: bool) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, readable, writable)
    }

    /// Remove all interest for `fd`.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let ret =
            unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, readable: bool, writable: bool) -> io::Result<()> {
        let mut events = 0u32;
        if readable {
            events |= libc::EPOLLIN as u32;
        }
        if writable {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until readiness or a wake, filling `events` with fd-level
    /// events. Returns true when the wake eventfd fired (tasks pending).
    pub fn wait(&mut self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> io::Result<bool> {
        events.clear();
        let timeout_ms: libc::c_int = match timeout {
            // Round sub-millisecond deadlines up so they do not spin.
            Some(t) => {
                let ms = t.as_millis().min(i32::MAX as u128) as libc::c_int;
                if ms == 0 && !t.is_zero() { 1 } else { ms }
            }
            None => -1,
        };

        let n = loop {
            let ret = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    self.event_buf.as_mut_ptr(),
                    self.event_buf.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if ret >= 0 {
                break ret as usize;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        };

        let mut woken = false;
        for ev in &self.event_buf[..n] {
            if ev.u64 == WAKE_TOKEN {
                // Drain the eventfd counter so level-triggered polling
                // does not re-report it.
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                }
                woken = true;
                continue;
            }
            let flags = ev.events;
            events.push(PollEvent {
                fd: ev.u64 as RawFd,
                readable: flags & (libc::EPOLLIN as u32 | libc::EPOLLHUP as u32) != 0,
                writable: flags & libc::EPOLLOUT as u32 != 0,
                error: flags & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0,
            });
        }
        Ok(woken)
    }

    /// Pop the next pending task, if any.
    pub fn next_task(&self) -> Option<Task> {
        self.tasks.try_recv().ok()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epfd);
        }
    }
}
