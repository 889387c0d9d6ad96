//! Traffic counters and loop gauges shared by every task of a pool.

use crate::tunnel_info_bridge::TunnelTraffic;
use std::sync::atomic::{AtomicU64, Ordering};

/// Packet counters owned by a [`crate::ConnectionPool`].
///
/// Each counter is bumped independently from whichever task handled the
/// packet; readers take a [`TunnelTraffic`] snapshot. Only completed
/// operations count: `recv_udp_packets` and `sent_udp_packets` are bumped
/// after a successful socket read or write, `sent_tunnel_packets` after a
/// message write succeeded. Failed attempts are logged, never counted.
///
/// The two gauges hold the number of sender and receiver loops running right
/// now across all connections.
#[derive(Debug, Default)]
pub struct Stats {
    sent_tunnel_packets: AtomicU64,
    recv_tunnel_packets: AtomicU64,
    sent_udp_packets: AtomicU64,
    recv_udp_packets: AtomicU64,
    active_senders: AtomicU64,
    active_receivers: AtomicU64,
}

/// Keeps a gauge raised until dropped.
pub(crate) struct ActiveGuard<'a>(&'a AtomicU64);

impl<'a> ActiveGuard<'a> {
    fn enter(gauge: &'a AtomicU64) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        ActiveGuard(gauge)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_sent_tunnel_packets(&self) {
        self.sent_tunnel_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_recv_tunnel_packets(&self) {
        self.recv_tunnel_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_sent_udp_packets(&self) {
        self.sent_udp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_recv_udp_packets(&self) {
        self.recv_udp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn track_sender(&self) -> ActiveGuard<'_> {
        ActiveGuard::enter(&self.active_senders)
    }

    pub(crate) fn track_receiver(&self) -> ActiveGuard<'_> {
        ActiveGuard::enter(&self.active_receivers)
    }

    pub fn snapshot(&self) -> TunnelTraffic {
        TunnelTraffic {
            sent_tunnel_packets: self.sent_tunnel_packets.load(Ordering::Relaxed),
            recv_tunnel_packets: self.recv_tunnel_packets.load(Ordering::Relaxed),
            sent_udp_packets: self.sent_udp_packets.load(Ordering::Relaxed),
            recv_udp_packets: self.recv_udp_packets.load(Ordering::Relaxed),
            active_senders: self.active_senders.load(Ordering::Relaxed),
            active_receivers: self.active_receivers.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let stats = Stats::new();
        stats.inc_sent_tunnel_packets();
        stats.inc_sent_tunnel_packets();
        stats.inc_recv_udp_packets();

        let traffic = stats.snapshot();
        assert_eq!(traffic.sent_tunnel_packets, 2);
        assert_eq!(traffic.recv_tunnel_packets, 0);
        assert_eq!(traffic.sent_udp_packets, 0);
        assert_eq!(traffic.recv_udp_packets, 1);
    }

    #[test]
    fn snapshots_never_go_backwards() {
        let stats = Stats::new();
        let mut last = stats.snapshot();
        for _ in 0..100 {
            stats.inc_recv_tunnel_packets();
            stats.inc_sent_udp_packets();
            let now = stats.snapshot();
            assert!(now.recv_tunnel_packets > last.recv_tunnel_packets);
            assert!(now.sent_udp_packets > last.sent_udp_packets);
            last = now;
        }
    }

    #[test]
    fn gauges_follow_live_guards() {
        let stats = Stats::new();
        let sender_a = stats.track_sender();
        let sender_b = stats.track_sender();
        let receiver = stats.track_receiver();
        assert_eq!(stats.snapshot().active_senders, 2);
        assert_eq!(stats.snapshot().active_receivers, 1);

        drop(sender_a);
        drop(receiver);
        let traffic = stats.snapshot();
        assert_eq!(traffic.active_senders, 1);
        assert_eq!(traffic.active_receivers, 0);
        assert_eq!(traffic.sent_tunnel_packets, 0);

        drop(sender_b);
        assert_eq!(stats.snapshot().active_senders, 0);
    }
}
