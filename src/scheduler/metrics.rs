//! Operational counters for the measurement pipeline.

use crate::eventlog::Protocol;

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct ProtocolCounters {
    enqueued: AtomicU64,
    backpressure_waits: AtomicU64,
    dropped: AtomicU64,
}

/// Shared counters, updated by schedulers and the ingestion writer.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    icmp: ProtocolCounters,
    udp: ProtocolCounters,
    tcp: ProtocolCounters,
    http: ProtocolCounters,
    records_written: AtomicU64,
    batches_flushed: AtomicU64,
    write_retries: AtomicU64,
    batches_lost: AtomicU64,
    records_lost: AtomicU64,
}

/// Per-protocol part of a [`MetricsSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProtocolSnapshot {
    pub enqueued: u64,
    /// Enqueues that found the queue full and had to wait.
    pub backpressure_waits: u64,
    /// Records produced after the writer had already closed its queues.
    pub dropped: u64,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub queues: BTreeMap<Protocol, ProtocolSnapshot>,
    pub records_written: u64,
    pub batches_flushed: u64,
    pub write_retries: u64,
    pub batches_lost: u64,
    pub records_lost: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn protocol(&self, protocol: Protocol) -> &ProtocolCounters {
        match protocol {
            Protocol::Icmp => &self.icmp,
            Protocol::Udp => &self.udp,
            Protocol::Tcp => &self.tcp,
            Protocol::Http => &self.http,
        }
    }

    pub fn record_enqueued(&self, protocol: Protocol) {
        self.protocol(protocol).enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure(&self, protocol: Protocol) {
        self.protocol(protocol)
            .backpressure_waits
            .fetch_add(1, Ordering::Relaxed);
    }

    /// A record that never reached a queue. Counted in `records_lost` too.
    pub fn record_dropped(&self, protocol: Protocol) {
        self.protocol(protocol).dropped.fetch_add(1, Ordering::Relaxed);
        self.records_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, records: usize) {
        self.records_written.fetch_add(records as u64, Ordering::Relaxed);
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.write_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost(&self, records: usize) {
        self.records_lost.fetch_add(records as u64, Ordering::Relaxed);
        self.batches_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let queues = Protocol::ALL
            .iter()
            .map(|&p| {
                let c = self.protocol(p);
                (
                    p,
                    ProtocolSnapshot {
                        enqueued: c.enqueued.load(Ordering::Relaxed),
                        backpressure_waits: c.backpressure_waits.load(Ordering::Relaxed),
                        dropped: c.dropped.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            queues,
            records_written: self.records_written.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            write_retries: self.write_retries.load(Ordering::Relaxed),
            batches_lost: self.batches_lost.load(Ordering::Relaxed),
            records_lost: self.records_lost.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = PipelineMetrics::new();
        metrics.record_enqueued(Protocol::Tcp);
        metrics.record_enqueued(Protocol::Tcp);
        metrics.record_backpressure(Protocol::Udp);
        metrics.record_flush(10);
        metrics.record_retry();
        metrics.record_lost(3);
        metrics.record_dropped(Protocol::Http);

        let snap = metrics.snapshot();
        assert_eq!(snap.queues[&Protocol::Tcp].enqueued, 2);
        assert_eq!(snap.queues[&Protocol::Udp].backpressure_waits, 1);
        assert_eq!(snap.queues[&Protocol::Icmp].enqueued, 0);
        assert_eq!(snap.records_written, 10);
        assert_eq!(snap.batches_flushed, 1);
        assert_eq!(snap.write_retries, 1);
        assert_eq!(snap.queues[&Protocol::Http].dropped, 1);
        assert_eq!((snap.batches_lost, snap.records_lost), (1, 4));

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["queues"]["tcp"]["enqueued"], 2);
    }
}
