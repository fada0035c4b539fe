//! Runtime metrics.
//!
//! Counters are sharded per event loop (see [`crate::counter`]) and
//! registered with metriken for exposition by whatever admin surface the
//! embedding application runs.

use metriken::{Gauge, metric};

use crate::counter::{CounterBank, LoopCounter};

static CONN: CounterBank = CounterBank::new();
static BYTES: CounterBank = CounterBank::new();
static LOOPS: CounterBank = CounterBank::new();
static UDP: CounterBank = CounterBank::new();

mod slot {
    pub const ACCEPTED: usize = 0;
    pub const CLOSED: usize = 1;
    pub const DIALED: usize = 2;

    pub const RECEIVED: usize = 0;
    pub const SENT: usize = 1;

    pub const FRAMES: usize = 0;
    pub const TASKS: usize = 1;
    pub const HANDLER_PANICS: usize = 2;

    pub const DGRAM_RX: usize = 0;
    pub const DGRAM_TX: usize = 1;
}

#[metric(
    name = "spindle/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: LoopCounter = LoopCounter::new(&CONN, slot::ACCEPTED);

#[metric(
    name = "spindle/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: LoopCounter = LoopCounter::new(&CONN, slot::CLOSED);

#[metric(
    name = "spindle/connections/dialed",
    description = "Total outbound connections opened"
)]
pub static CONNECTIONS_DIALED: LoopCounter = LoopCounter::new(&CONN, slot::DIALED);

#[metric(
    name = "spindle/connections/active",
    description = "Currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "spindle/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: LoopCounter = LoopCounter::new(&BYTES, slot::RECEIVED);

#[metric(name = "spindle/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: LoopCounter = LoopCounter::new(&BYTES, slot::SENT);

#[metric(
    name = "spindle/loop/frames_decoded",
    description = "Frames delivered to the handler"
)]
pub static FRAMES_DECODED: LoopCounter = LoopCounter::new(&LOOPS, slot::FRAMES);

#[metric(
    name = "spindle/loop/tasks_executed",
    description = "Cross-loop tasks executed"
)]
pub static TASKS_EXECUTED: LoopCounter = LoopCounter::new(&LOOPS, slot::TASKS);

#[metric(
    name = "spindle/loop/handler_panics",
    description = "Handler panics caught at the loop boundary"
)]
pub static HANDLER_PANICS: LoopCounter = LoopCounter::new(&LOOPS, slot::HANDLER_PANICS);

#[metric(
    name = "spindle/udp/datagrams_received",
    description = "Total UDP datagrams received"
)]
pub static UDP_DATAGRAMS_RECEIVED: LoopCounter = LoopCounter::new(&UDP, slot::DGRAM_RX);

#[metric(
    name = "spindle/udp/datagrams_sent",
    description = "Total UDP datagrams sent"
)]
pub static UDP_DATAGRAMS_SENT: LoopCounter = LoopCounter::new(&UDP, slot::DGRAM_TX);
