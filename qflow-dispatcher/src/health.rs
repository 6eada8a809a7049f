//! Node bookkeeping: plain atomics behind an `Arc`, read without locking,
//! written by a single owner task, rather than a locked struct.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use qflow_common::time::TimestampSeconds;
use qflow_common::{LoadSample, NodeCapabilities, NodeHealth, NodeId, NodeRecord};

fn health_tag(h: NodeHealth) -> u8 {
    match h {
        NodeHealth::Healthy => 0,
        NodeHealth::Unhealthy => 1,
        NodeHealth::Offline => 2,
    }
}

fn health_from_tag(tag: u8) -> NodeHealth {
    match tag {
        0 => NodeHealth::Healthy,
        1 => NodeHealth::Unhealthy,
        _ => NodeHealth::Offline,
    }
}

/// One registered node's live state. Float fields are stored as their
/// bit pattern in an `AtomicU64`, since `std` has no `AtomicF64`.
pub struct NodeEntry {
    pub node_id: NodeId,
    pub capabilities: NodeCapabilities,
    cpu_pct: AtomicU64,
    mem_pct: AtomicU64,
    net_pct: AtomicU64,
    queue_depth: AtomicU32,
    avg_latency_ms: AtomicU64,
    throughput: AtomicU64,
    error_rate: AtomicU64,
    last_updated: AtomicU64,
    missed_heartbeats: AtomicU32,
    health: AtomicU8,
}

impl NodeEntry {
    pub fn new(node_id: NodeId, capabilities: NodeCapabilities, at: TimestampSeconds) -> Self {
        Self {
            node_id,
            capabilities,
            cpu_pct: AtomicU64::new(0),
            mem_pct: AtomicU64::new(0),
            net_pct: AtomicU64::new(0),
            queue_depth: AtomicU32::new(0),
            avg_latency_ms: AtomicU64::new(0),
            throughput: AtomicU64::new(0),
            error_rate: AtomicU64::new(0),
            last_updated: AtomicU64::new(at),
            missed_heartbeats: AtomicU32::new(0),
            health: AtomicU8::new(health_tag(NodeHealth::Healthy)),
        }
    }

    /// A fresh load sample clears the missed-heartbeat counter and
    /// restores `Healthy`.
    pub fn record_load(&self, sample: LoadSample, at: TimestampSeconds) {
        self.cpu_pct.store(sample.cpu_pct.to_bits(), Ordering::Relaxed);
        self.mem_pct.store(sample.mem_pct.to_bits(), Ordering::Relaxed);
        self.net_pct.store(sample.net_pct.to_bits(), Ordering::Relaxed);
        self.queue_depth.store(sample.queue_depth, Ordering::Relaxed);
        self.avg_latency_ms.store(sample.avg_latency_ms.to_bits(), Ordering::Relaxed);
        self.throughput.store(sample.throughput.to_bits(), Ordering::Relaxed);
        self.error_rate.store(sample.error_rate.to_bits(), Ordering::Relaxed);
        self.last_updated.store(at, Ordering::Relaxed);
        self.missed_heartbeats.store(0, Ordering::Relaxed);
        self.health.store(health_tag(NodeHealth::Healthy), Ordering::Relaxed);
    }

    /// A node that misses `N` consecutive samples is marked `unhealthy`;
    /// `2N` marks it `offline`.
    pub fn note_missed_heartbeat(&self, missed_threshold: u32) -> NodeHealth {
        let missed = self.missed_heartbeats.fetch_add(1, Ordering::Relaxed) + 1;
        let health = if missed >= missed_threshold.saturating_mul(2) {
            NodeHealth::Offline
        } else if missed >= missed_threshold {
            NodeHealth::Unhealthy
        } else {
            NodeHealth::Healthy
        };
        self.health.store(health_tag(health), Ordering::Relaxed);
        health
    }

    pub fn health(&self) -> NodeHealth {
        health_from_tag(self.health.load(Ordering::Relaxed))
    }

    pub fn mark_offline(&self) {
        self.health.store(health_tag(NodeHealth::Offline), Ordering::Relaxed);
    }

    pub fn last_updated(&self) -> TimestampSeconds {
        self.last_updated.load(Ordering::Relaxed)
    }

    pub fn load(&self) -> LoadSample {
        LoadSample {
            cpu_pct: f64::from_bits(self.cpu_pct.load(Ordering::Relaxed)),
            mem_pct: f64::from_bits(self.mem_pct.load(Ordering::Relaxed)),
            net_pct: f64::from_bits(self.net_pct.load(Ordering::Relaxed)),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            avg_latency_ms: f64::from_bits(self.avg_latency_ms.load(Ordering::Relaxed)),
            throughput: f64::from_bits(self.throughput.load(Ordering::Relaxed)),
            error_rate: f64::from_bits(self.error_rate.load(Ordering::Relaxed)),
        }
    }

    pub fn snapshot(&self) -> NodeRecord {
        NodeRecord {
            node_id: self.node_id.clone(),
            capabilities: self.capabilities.clone(),
            load: self.load(),
            health: self.health(),
            last_updated: self.last_updated(),
        }
    }

    /// Samples older than `staleness_ms` are unreliable and down-weighted.
    pub fn is_stale(&self, now: TimestampSeconds, staleness_secs: u64) -> bool {
        now.saturating_sub(self.last_updated()) > staleness_secs
    }
}
