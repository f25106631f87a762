//! Process-wide memory pressure signal.
//!
//! The monitor does not evict anything itself. The registry periodically feeds
//! it the in-memory volume summed over all queues; while usage is above
//! capacity the send path derives forced length caps for the queues it
//! touches.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug)]
pub struct MemoryMonitor {
    /// Byte budget for buffered payloads; 0 disables the monitor.
    capacity: u64,
    /// Forced cap as a percentage of a queue's current length.
    forced_limit_percent: u64,
    usage: AtomicU64,
    pressure: AtomicBool,
}

impl MemoryMonitor {
    pub fn new(capacity: u64, forced_limit_percent: u64) -> Self {
        Self {
            capacity,
            forced_limit_percent: forced_limit_percent.clamp(1, 100),
            usage: AtomicU64::new(0),
            pressure: AtomicBool::new(false),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, 100)
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[inline]
    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn under_pressure(&self) -> bool {
        self.pressure.load(Ordering::Relaxed)
    }

    /// Records the latest usage sample; returns the new pressure state.
    pub fn refresh(&self, usage: u64) -> bool {
        self.usage.store(usage, Ordering::Relaxed);
        let pressure = self.capacity > 0 && usage > self.capacity;
        let previous = self.pressure.swap(pressure, Ordering::Relaxed);
        if previous != pressure {
            if pressure {
                tracing::warn!(
                    target: "relaymq::memory",
                    usage,
                    capacity = self.capacity,
                    "memory pressure detected; forcing queue length caps"
                );
            } else {
                tracing::info!(target: "relaymq::memory", usage, "memory pressure cleared");
            }
        }
        pressure
    }

    /// Cap derived from a queue's current length, never below 1.
    pub fn forced_limit_for(&self, current_length: u64) -> u64 {
        (current_length.saturating_mul(self.forced_limit_percent) / 100).max(1)
    }
}
