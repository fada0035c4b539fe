//! spindle — a multi-reactor, non-blocking network server framework for
//! Linux.
//!
//! spindle runs one acceptor loop plus N sub-reactor event loops on
//! dedicated OS threads, multiplexing connections with epoll. User code
//! implements [`EventHandler`]: per decoded frame the framework calls
//! [`react`](EventHandler::react), which returns bytes to send and an
//! [`Action`]. A [`Codec`] slices the inbound byte stream into frames.
//! Each connection is owned by exactly one loop; foreign threads operate
//! on it through a [`ConnHandle`] whose operations ride a lock-free task
//! queue paired with an eventfd wake.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use spindle::{Action, Conn, EventHandler, OptionsBuilder};
//! use bytes::Bytes;
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn react(&self, frame: &[u8], _conn: &mut Conn) -> (Option<Bytes>, Action) {
//!         (Some(Bytes::copy_from_slice(frame)), Action::None)
//!     }
//! }
//!
//! fn main() -> Result<(), spindle::Error> {
//!     let opts = OptionsBuilder::new().multicore(true).build()?;
//!     spindle::serve(Echo, "tcp://:7878", opts)
//! }
//! ```
//!
//! # Platform
//!
//! Linux only: the poller is epoll, loop wake-ups are eventfd, and socket
//! setup goes through raw libc.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;

pub(crate) mod acceptor;
pub(crate) mod balancer;
pub(crate) mod connection;
pub(crate) mod counter;
pub(crate) mod event_loop;
pub(crate) mod metrics;
pub(crate) mod net;
pub(crate) mod poller;
pub(crate) mod server;

/// What a handler callback tells the loop to do next.
pub use handler::Action;
/// The event-handler contract; all methods default to no-ops.
pub use handler::EventHandler;
/// Read-only view of a running server (bound address, loop count, dup fd).
pub use handler::Server;

/// A connection owned by one sub-reactor.
pub use connection::Conn;
/// Cloneable off-loop handle: async_write / wake / send_to / close.
pub use connection::ConnHandle;

/// Bidirectional framing contract: bytes ↔ frames.
pub use codec::Codec;
/// Byte order for the length-field codec.
pub use codec::ByteOrder;
/// Frames delimited by a configurable byte.
pub use codec::DelimiterCodec;
/// Decode-side configuration for [`LengthFieldCodec`].
pub use codec::DecoderConfig;
/// Encode-side configuration for [`LengthFieldCodec`].
pub use codec::EncoderConfig;
/// Fixed-size frames.
pub use codec::FixedLengthCodec;
/// Length-field framing with configurable offset, width and adjustments.
pub use codec::LengthFieldCodec;
/// Frames delimited by `\n`.
pub use codec::LineCodec;
/// Default codec: the whole inbound buffer is one frame.
pub use codec::TransparentCodec;

/// Accept-time load-balancing policy.
pub use balancer::LoadBalancing;
/// Grow-on-write FIFO byte buffer with zero-copy two-slice peek.
pub use buffer::RingBuffer;
/// Immutable server configuration snapshot.
pub use config::Options;
/// Builder for [`Options`] with `build()` validation.
pub use config::OptionsBuilder;
/// Frame codec failures.
pub use error::CodecError;
/// Runtime errors.
pub use error::Error;
/// A bound or peer address: inet or unix-domain.
pub use net::NetAddr;

/// Bind an address and serve until shutdown.
pub use server::serve;
/// Stop the server bound to a `proto://addr`, with an optional deadline.
pub use server::stop;
