//! Peer selection for idle subscriptions.

use super::stats::PeerQueueStat;

/// Peers worth hinting at: more messages waiting and fewer consumers than
/// here. Longest queues first.
pub fn hint_candidates(
    local_length: u64,
    local_subscriptions: usize,
    peers: &[PeerQueueStat],
) -> Vec<PeerQueueStat> {
    let mut candidates: Vec<PeerQueueStat> = peers
        .iter()
        .filter(|p| p.length > local_length && p.subscriptions < local_subscriptions)
        .cloned()
        .collect();
    candidates.sort_by(|a, b| {
        b.length
            .cmp(&a.length)
            .then(a.subscriptions.cmp(&b.subscriptions))
    });
    candidates
}

/// Single best peer for a redirect or proxy: among peers with fewer
/// subscriptions than here, the one with the fewest, ties broken by the
/// greatest length.
pub fn redirect_target(
    local_subscriptions: usize,
    peers: &[PeerQueueStat],
) -> Option<PeerQueueStat> {
    peers
        .iter()
        .filter(|p| p.subscriptions < local_subscriptions)
        .min_by(|a, b| {
            a.subscriptions
                .cmp(&b.subscriptions)
                .then(b.length.cmp(&a.length))
        })
        .cloned()
}
