//! Server lifecycle: bind, spawn loops, run until stopped.
//!
//! [`serve`] blocks the calling thread until the server stops — through a
//! [`Action::Shutdown`](crate::Action) returned by any handler callback,
//! or an external [`stop`] keyed by the same `proto://addr` string. Every
//! running server registers itself in a process-global table so `stop` can
//! find it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::debug;

use crate::acceptor::Acceptor;
use crate::balancer::Balancer;
use crate::config::{Options, pin_to_core};
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::handler::{Action, EventHandler, Server};
use crate::net::{self, NetAddr, Protocol};
use crate::poller::{Poller, Task, Trigger};

static REGISTRY: Mutex<BTreeMap<String, Arc<Shared>>> = Mutex::new(BTreeMap::new());

/// State shared between the acceptor, the loops and the `serve`/`stop`
/// callers.
pub(crate) struct Shared {
    shutdown: AtomicBool,
    signal: Mutex<bool>,
    signal_cv: Condvar,
    stopped: Mutex<bool>,
    stopped_cv: Condvar,
    triggers: Mutex<Vec<Trigger>>,
}

impl Shared {
    fn new() -> Shared {
        Shared {
            shutdown: AtomicBool::new(false),
            signal: Mutex::new(false),
            signal_cv: Condvar::new(),
            stopped: Mutex::new(false),
            stopped_cv: Condvar::new(),
            triggers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Begin graceful shutdown: flips the flag once and wakes the acceptor
    /// and every loop so they observe it.
    pub fn signal_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for trigger in self.triggers.lock().unwrap().iter() {
            let _ = trigger.submit(Task::Shutdown);
        }
        *self.signal.lock().unwrap() = true;
        self.signal_cv.notify_all();
    }

    fn set_triggers(&self, triggers: Vec<Trigger>) {
        *self.triggers.lock().unwrap() = triggers;
    }

    fn wait_signal(&self) {
        let mut signalled = self.signal.lock().unwrap();
        while !*signalled {
            signalled = self.signal_cv.wait(signalled).unwrap();
        }
    }

    fn mark_stopped(&self) {
        *self.stopped.lock().unwrap() = true;
        self.stopped_cv.notify_all();
    }

    fn wait_stopped(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut stopped = self.stopped.lock().unwrap();
        while !*stopped {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .stopped_cv
                        .wait_timeout(stopped, deadline - now)
                        .unwrap();
                    stopped = guard;
                }
                None => stopped = self.stopped_cv.wait(stopped).unwrap(),
            }
        }
        true
    }
}

/// Bind `proto_addr`, spin up the reactor loops and serve until shutdown.
///
/// Returns after the server stops cleanly; configuration errors surface
/// synchronously before any loop starts.
pub fn serve<H: EventHandler>(handler: H, proto_addr: &str, opts: Options) -> Result<(), Error> {
    serve_inner(Arc::new(handler), proto_addr, opts)
}

/// Stop the server bound to `proto_addr`.
///
/// With a timeout, loops that do not quiesce by the deadline are abandoned
/// and [`Error::StopTimeout`] is returned; the server keeps winding down in
/// the background.
pub fn stop(proto_addr: &str, timeout: Option<Duration>) -> Result<(), Error> {
    let shared = REGISTRY
        .lock()
        .unwrap()
        .get(proto_addr)
        .cloned()
        .ok_or_else(|| Error::ServerNotFound(proto_addr.to_string()))?;
    shared.signal_shutdown();
    if shared.wait_stopped(timeout) {
        Ok(())
    } else {
        Err(Error::StopTimeout)
    }
}

fn serve_inner(
    handler: Arc<dyn EventHandler>,
    proto_addr: &str,
    opts: Options,
) -> Result<(), Error> {
    opts.validate()?;
    let (proto, rest) = net::split_proto_addr(proto_addr)?;
    let num_loops = opts.effective_loops();

    // Bind the listener (stream) or the datagram socket.
    let (listen_fd, bound_addr) = match proto {
        Protocol::Unix => {
            let fd = net::create_unix_listener(rest, opts.backlog)?;
            (fd, NetAddr::Unix(rest.into()))
        }
        _ if proto.is_stream() => {
            let sa = net::resolve_inet(rest, proto)?;
            let fd = net::create_stream_listener(sa, opts.reuse_port, opts.backlog)?;
            let bound = net::local_addr_of(fd).unwrap_or(NetAddr::Inet(sa));
            (fd, bound)
        }
        _ => {
            let sa = net::resolve_inet(rest, proto)?;
            let fd = net::create_udp_socket(sa, opts.reuse_port)?;
            let bound = net::local_addr_of(fd).unwrap_or(NetAddr::Inet(sa));
            (fd, bound)
        }
    };

    let shared = Arc::new(Shared::new());
    let loads: Vec<Arc<AtomicI32>> = (0..num_loops).map(|_| Arc::new(AtomicI32::new(0))).collect();

    // Pollers are created up front so their triggers can be wired into the
    // balancer, the shutdown broadcast and the acceptor before any thread
    // spawns.
    let mut pollers = Vec::with_capacity(num_loops);
    for _ in 0..num_loops {
        pollers.push(Poller::new().map_err(Error::Poller)?);
    }
    let loop_triggers: Vec<Trigger> = pollers.iter().map(|p| p.trigger()).collect();

    let acceptor_poller = if proto.is_stream() {
        Some(Poller::new().map_err(Error::Poller)?)
    } else {
        None
    };

    let mut all_triggers = loop_triggers.clone();
    if let Some(p) = &acceptor_poller {
        all_triggers.push(p.trigger());
    }
    shared.set_triggers(all_triggers);

    REGISTRY
        .lock()
        .unwrap()
        .insert(proto_addr.to_string(), shared.clone());

    let server = Server {
        addr: bound_addr,
        num_event_loops: num_loops,
        loads: loads.clone(),
        listen_fd: Some(listen_fd),
    };

    let cleanup = |shared: &Shared| {
        unsafe { libc::close(listen_fd) };
        if let Protocol::Unix = proto {
            let _ = std::fs::remove_file(rest);
        }
        REGISTRY.lock().unwrap().remove(proto_addr);
        shared.mark_stopped();
    };

    if handler.on_init(&server) == Action::Shutdown {
        handler.on_shutdown(&server);
        cleanup(&shared);
        return Ok(());
    }

    debug!(
        "serving {proto_addr} on {} with {num_loops} event loop(s)",
        server.addr
    );

    // Spawn sub-reactors.
    let mut loop_handles = Vec::with_capacity(num_loops);
    for (idx, poller) in pollers.into_iter().enumerate() {
        let mut udp_fds = HashMap::new();
        if !proto.is_stream() && idx == 0 {
            udp_fds.insert(listen_fd, Some(server.addr.clone()));
        }
        let mut event_loop = EventLoop::new(
            idx,
            poller,
            handler.clone(),
            opts.codec.clone(),
            shared.clone(),
            loads[idx].clone(),
            udp_fds,
            opts.ticker && idx == 0,
        );
        let pin = opts.lock_os_thread;
        let handle = std::thread::Builder::new()
            .name(format!("spindle-loop-{idx}"))
            .spawn(move || {
                if pin {
                    let _ = pin_to_core(idx);
                }
                event_loop.run()
            })
            .map_err(Error::Io)?;
        loop_handles.push(handle);
    }

    // Spawn the acceptor for connection-oriented transports.
    let acceptor_handle = match acceptor_poller {
        Some(poller) => {
            let balancer = Arc::new(Balancer::new(opts.load_balancing, loads.clone()));
            let mut acceptor = Acceptor::new(
                poller,
                listen_fd,
                balancer,
                loop_triggers,
                shared.clone(),
                opts.clone(),
            );
            Some(
                std::thread::Builder::new()
                    .name("spindle-acceptor".to_string())
                    .spawn(move || acceptor.run())
                    .map_err(Error::Io)?,
            )
        }
        None => None,
    };

    // Block until a shutdown action or an external stop.
    shared.wait_signal();

    // Quiesce: the acceptor stops accepting, loops drain and close their
    // connections, then callbacks are done for good.
    let mut first_err = None;
    if let Some(handle) = acceptor_handle
        && let Ok(Err(e)) = handle.join()
    {
        first_err.get_or_insert(e);
    }
    for handle in loop_handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(_) => {
                first_err.get_or_insert(Error::Io(std::io::Error::other("event loop panicked")));
            }
        }
    }

    // The listener is still open here so on_shutdown can dup it for
    // handoff; accepting already stopped with the acceptor.
    handler.on_shutdown(&server);
    cleanup(&shared);

    debug!("server {proto_addr} stopped");
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
