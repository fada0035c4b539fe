//! Server options.
//!
//! [`Options`] is a plain value cloned into each loop at server start;
//! [`OptionsBuilder`] provides discoverable setters with `build()`
//! validation. Nothing here is consulted after `serve()` returns.

use std::sync::Arc;
use std::time::Duration;

use crate::balancer::LoadBalancing;
use crate::codec::{Codec, TransparentCodec};
use crate::error::Error;

/// Hard cap on explicit event-loop counts. Exceeding it with
/// `lock_os_thread` set is a configuration error; without the pin flag the
/// count is silently clamped.
pub(crate) const MAX_EVENT_LOOPS: usize = 10_000;

/// Immutable configuration snapshot for one server.
#[derive(Clone)]
pub struct Options {
    /// Use one sub-reactor per logical CPU instead of a single loop.
    pub multicore: bool,
    /// Explicit sub-reactor count; overrides `multicore` when non-zero.
    pub num_event_loop: usize,
    /// Bind the listener with SO_REUSEPORT so multiple instances co-bind.
    pub reuse_port: bool,
    /// Enable the periodic `tick` callback (hosted by loop 0).
    pub ticker: bool,
    /// TCP keepalive applied to accepted sockets. None disables.
    pub tcp_keepalive: Option<Duration>,
    /// Disable Nagle's algorithm on accepted sockets.
    pub tcp_nodelay: bool,
    /// Pin each loop thread to a CPU core.
    pub lock_os_thread: bool,
    /// Policy assigning accepted connections to sub-reactors.
    pub load_balancing: LoadBalancing,
    /// Frame codec splitting the byte stream into application frames.
    pub codec: Arc<dyn Codec>,
    /// Listen backlog for stream transports.
    pub backlog: i32,
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("multicore", &self.multicore)
            .field("num_event_loop", &self.num_event_loop)
            .field("reuse_port", &self.reuse_port)
            .field("ticker", &self.ticker)
            .field("tcp_keepalive", &self.tcp_keepalive)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("lock_os_thread", &self.lock_os_thread)
            .field("load_balancing", &self.load_balancing)
            .field("backlog", &self.backlog)
            .finish()
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            multicore: false,
            num_event_loop: 0,
            reuse_port: false,
            ticker: false,
            tcp_keepalive: None,
            tcp_nodelay: false,
            lock_os_thread: false,
            load_balancing: LoadBalancing::RoundRobin,
            codec: Arc::new(TransparentCodec),
            backlog: 1024,
        }
    }
}

impl Options {
    /// Resolve the effective sub-reactor count.
    ///
    /// Explicit `num_event_loop` wins over `multicore`; the result is
    /// bounded by [`MAX_EVENT_LOOPS`].
    pub(crate) fn effective_loops(&self) -> usize {
        let n = if self.num_event_loop > 0 {
            self.num_event_loop
        } else if self.multicore {
            num_cpus()
        } else {
            1
        };
        n.clamp(1, MAX_EVENT_LOOPS)
    }

    /// Reject combinations that must fail before any loop starts.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.lock_os_thread && self.num_event_loop > MAX_EVENT_LOOPS {
            return Err(Error::TooManyEventLoopThreads);
        }
        Ok(())
    }
}

/// Builder for [`Options`].
///
/// # Example
///
/// ```rust
/// use spindle::{LoadBalancing, OptionsBuilder};
/// use std::time::Duration;
///
/// let opts = OptionsBuilder::new()
///     .multicore(true)
///     .reuse_port(true)
///     .tcp_keepalive(Duration::from_secs(60))
///     .load_balancing(LoadBalancing::LeastConnections)
///     .build()
///     .expect("invalid options");
/// ```
#[derive(Default)]
pub struct OptionsBuilder {
    opts: Options,
}

impl OptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use one sub-reactor per logical CPU.
    pub fn multicore(mut self, enable: bool) -> Self {
        self.opts.multicore = enable;
        self
    }

    /// Set an explicit sub-reactor count (overrides `multicore`).
    pub fn num_event_loop(mut self, n: usize) -> Self {
        self.opts.num_event_loop = n;
        self
    }

    /// Bind with kernel port-sharing.
    pub fn reuse_port(mut self, enable: bool) -> Self {
        self.opts.reuse_port = enable;
        self
    }

    /// Enable periodic `tick` callbacks.
    pub fn ticker(mut self, enable: bool) -> Self {
        self.opts.ticker = enable;
        self
    }

    /// Apply TCP keepalive to accepted sockets.
    pub fn tcp_keepalive(mut self, period: Duration) -> Self {
        self.opts.tcp_keepalive = Some(period);
        self
    }

    /// Disable Nagle's algorithm on accepted sockets.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.opts.tcp_nodelay = enable;
        self
    }

    /// Pin each loop thread to a CPU core.
    pub fn lock_os_thread(mut self, enable: bool) -> Self {
        self.opts.lock_os_thread = enable;
        self
    }

    /// Choose the accept-time load-balancing policy.
    pub fn load_balancing(mut self, lb: LoadBalancing) -> Self {
        self.opts.load_balancing = lb;
        self
    }

    /// Install a frame codec.
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.opts.codec = codec;
        self
    }

    /// Set the listen backlog.
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.opts.backlog = backlog;
        self
    }

    /// Validate and produce the final [`Options`].
    pub fn build(self) -> Result<Options, Error> {
        self.opts.validate()?;
        Ok(self.opts)
    }
}

/// Number of online logical CPUs.
pub(crate) fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}

/// Pin the current thread to a CPU core.
pub(crate) fn pin_to_core(core: usize) -> std::io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core % num_cpus(), &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
