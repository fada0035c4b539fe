//! Loop-sharded counter storage.
//!
//! Every event-loop thread (and the acceptor) claims a shard at startup via
//! [`set_loop_shard`]; increments land in the claiming thread's shard so
//! loops never contend on a cache line. Reads sum across shards.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

const SLOTS: usize = 8;
const NUM_SHARDS: usize = 32;

thread_local! {
    static SHARD: Cell<usize> = const { Cell::new(0) };
}

/// Claim a shard for the current thread. Loop `idx` maps to shard
/// `idx % NUM_SHARDS`; unclaimed threads share shard 0.
pub(crate) fn set_loop_shard(idx: usize) {
    SHARD.set(idx % NUM_SHARDS);
}

#[repr(C, align(64))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

/// Storage for up to [`SLOTS`] related counters, one shard per loop.
pub struct CounterBank {
    shards: [Shard; NUM_SHARDS],
}

impl CounterBank {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        const EMPTY: Shard = Shard { slots: [ZERO; SLOTS] };
        CounterBank {
            shards: [EMPTY; NUM_SHARDS],
        }
    }

    #[inline]
    fn add(&self, slot: usize, value: u64) {
        debug_assert!(slot < SLOTS);
        self.shards[SHARD.get()].slots[slot].fetch_add(value, Ordering::Relaxed);
    }

    fn value(&self, slot: usize) -> u64 {
        self.shards
            .iter()
            .map(|s| s.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for CounterBank {
    fn default() -> Self {
        Self::new()
    }
}

/// One counter slot in a [`CounterBank`], registrable with metriken.
pub struct LoopCounter {
    bank: &'static CounterBank,
    slot: usize,
}

impl LoopCounter {
    pub const fn new(bank: &'static CounterBank, slot: usize) -> Self {
        LoopCounter { bank, slot }
    }

    #[inline]
    pub fn increment(&self) {
        self.bank.add(self.slot, 1);
    }

    #[inline]
    pub fn add(&self, value: u64) {
        self.bank.add(self.slot, value);
    }

    pub fn value(&self) -> u64 {
        self.bank.value(self.slot)
    }
}

impl metriken::Metric for LoopCounter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(LoopCounter::value(self)))
    }
}
