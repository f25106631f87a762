use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// Global counters (low overhead). These are coarse-grained and process-wide.
static PUBLISHED: AtomicU64 = AtomicU64::new(0);
static ENQUEUED: AtomicU64 = AtomicU64::new(0);
static DELIVERED: AtomicU64 = AtomicU64::new(0);
static REDELIVERED: AtomicU64 = AtomicU64::new(0);
static REJECTED: AtomicU64 = AtomicU64::new(0);
static DISCARDED: AtomicU64 = AtomicU64::new(0);
static DELAY_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static REPLIES_ROUTED: AtomicU64 = AtomicU64::new(0);
static REPLIES_DROPPED: AtomicU64 = AtomicU64::new(0);
static PROXIED: AtomicU64 = AtomicU64::new(0);

static READY: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn set_ready(v: bool) {
    READY.store(v, Ordering::Relaxed);
}

#[inline]
pub fn is_ready() -> bool {
    READY.load(Ordering::Relaxed)
}

#[inline]
pub fn inc_published(n: u64) {
    PUBLISHED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_enqueued(n: u64) {
    ENQUEUED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_delivered(n: u64) {
    DELIVERED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_redelivered(n: u64) {
    REDELIVERED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_rejected(n: u64) {
    REJECTED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_discarded(n: u64) {
    DISCARDED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_delay_timeouts(n: u64) {
    DELAY_TIMEOUTS.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_replies_routed(n: u64) {
    REPLIES_ROUTED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_replies_dropped(n: u64) {
    REPLIES_DROPPED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_proxied(n: u64) {
    PROXIED.fetch_add(n, Ordering::Relaxed);
}

pub fn snapshot() -> String {
    // Prometheus-style text without HELP/TYPE lines.
    format!(
        "relaymq_published {}\nrelaymq_enqueued {}\nrelaymq_delivered {}\nrelaymq_redelivered {}\nrelaymq_rejected {}\nrelaymq_discarded {}\nrelaymq_delay_timeouts {}\nrelaymq_replies_routed {}\nrelaymq_replies_dropped {}\nrelaymq_proxied {}\n",
        PUBLISHED.load(Ordering::Relaxed),
        ENQUEUED.load(Ordering::Relaxed),
        DELIVERED.load(Ordering::Relaxed),
        REDELIVERED.load(Ordering::Relaxed),
        REJECTED.load(Ordering::Relaxed),
        DISCARDED.load(Ordering::Relaxed),
        DELAY_TIMEOUTS.load(Ordering::Relaxed),
        REPLIES_ROUTED.load(Ordering::Relaxed),
        REPLIES_DROPPED.load(Ordering::Relaxed),
        PROXIED.load(Ordering::Relaxed),
    )
}
