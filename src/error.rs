use std::io;

use thiserror::Error;

/// Errors returned by the spindle runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Address scheme is not one of tcp/tcp4/tcp6/udp/udp4/udp6/unix.
    #[error("unsupported protocol in address {0:?}")]
    UnsupportedProtocol(String),
    /// num_event_loop exceeds the safety cap while lock_os_thread is set.
    #[error("too many event-loop threads")]
    TooManyEventLoopThreads,
    /// Binding the listener socket failed.
    #[error("bind: {0}")]
    Bind(io::Error),
    /// The epoll instance or its wake eventfd could not be created or used.
    #[error("poller: {0}")]
    Poller(io::Error),
    /// Socket-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Frame decoding failed; the offending connection has been closed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The owning event loop has already terminated.
    #[error("event loop terminated")]
    LoopTerminated,
    /// No running server is registered under the given proto-address.
    #[error("no server bound to {0:?}")]
    ServerNotFound(String),
    /// The stop deadline elapsed before all loops quiesced.
    #[error("server did not stop before the deadline")]
    StopTimeout,
}

/// Errors produced by frame codecs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Decoded frame length is negative, absurd, or inconsistent.
    #[error("invalid frame length {0}")]
    InvalidLength(i64),
    /// Payload handed to encode does not fit the codec's framing rules.
    #[error("unencodable payload: {0}")]
    Unencodable(&'static str),
    /// Length-field configuration is out of range.
    #[error("invalid codec config: {0}")]
    InvalidConfig(&'static str),
}
