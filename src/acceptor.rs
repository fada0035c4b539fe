//! The main acceptor loop.
//!
//! Watches the listener fd only. On readability it accepts until the
//! kernel reports would-block, applies socket options, asks the balancer
//! for a target sub-reactor and hands the new connection over through that
//! loop's task queue. Registration (poller add, map insert, `on_opened`)
//! then happens on the owning loop's thread, preserving single ownership.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use log::{debug, warn};

use crate::balancer::Balancer;
use crate::config::Options;
use crate::connection::Conn;
use crate::counter;
use crate::net::{self, NetAddr};
use crate::poller::{Poller, Task, Trigger};
use crate::server::Shared;

pub(crate) struct Acceptor {
    poller: Poller,
    listen_fd: RawFd,
    balancer: Arc<Balancer>,
    loop_triggers: Vec<Trigger>,
    shared: Arc<Shared>,
    opts: Options,
}

impl Acceptor {
    pub fn new(
        poller: Poller,
        listen_fd: RawFd,
        balancer: Arc<Balancer>,
        loop_triggers: Vec<Trigger>,
        shared: Arc<Shared>,
        opts: Options,
    ) -> Acceptor {
        Acceptor {
            poller,
            listen_fd,
            balancer,
            loop_triggers,
            shared,
            opts,
        }
    }

    /// Run until the shutdown signal. The listener fd stays owned by the
    /// server; this loop never closes it.
    pub fn run(&mut self) -> Result<(), crate::error::Error> {
        counter::set_loop_shard(self.balancer.len());
        self.poller
            .register(self.listen_fd, true, false)
            .map_err(crate::error::Error::Poller)?;

        let mut events = Vec::new();
        loop {
            let woken = match self.poller.wait(&mut events, None) {
                Ok(woken) => woken,
                Err(e) => {
                    log::error!("acceptor: poll failed: {e}");
                    self.shared.signal_shutdown();
                    return Err(crate::error::Error::Poller(e));
                }
            };

            if woken || self.shared.is_shutdown() {
                // The only tasks the acceptor receives are shutdown pokes.
                while self.poller.next_task().is_some() {}
                if self.shared.is_shutdown() {
                    debug!("acceptor exiting");
                    return Ok(());
                }
            }

            for ev in &events {
                if ev.fd == self.listen_fd && ev.readable {
                    self.accept_ready();
                }
            }
        }
    }

    /// Accept in a loop until would-block.
    fn accept_ready(&mut self) {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept4(
                    self.listen_fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut addr_len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => return,
                    Some(libc::EINTR) => continue,
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        // Out of descriptors; back off instead of spinning.
                        warn!("acceptor: out of file descriptors, backing off");
                        std::thread::sleep(std::time::Duration::from_millis(10));
                        return;
                    }
                    Some(libc::ECONNABORTED) => continue,
                    _ => {
                        warn!("acceptor: accept failed: {err}");
                        return;
                    }
                }
            }

            if self.opts.tcp_nodelay {
                net::set_nodelay(fd);
            }
            if let Some(period) = self.opts.tcp_keepalive {
                net::set_keepalive(fd, period.as_secs().max(1) as u32);
            }

            let remote = match storage.ss_family as libc::c_int {
                libc::AF_INET | libc::AF_INET6 => {
                    net::sockaddr_to_socket_addr(&storage).map(NetAddr::Inet)
                }
                _ => net::peer_addr_of(fd),
            };
            let local = net::local_addr_of(fd);

            let idx = self.balancer.next(remote.as_ref());
            let trigger = self.loop_triggers[idx].clone();
            let conn = Conn::accepted(fd, idx, trigger.clone(), local, remote);

            if trigger.submit(Task::Register(Box::new(conn))).is_err() {
                // The target loop is gone; the server is coming down.
                unsafe { libc::close(fd) };
                return;
            }
        }
    }
}
