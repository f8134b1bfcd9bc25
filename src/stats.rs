//! Per-process relay counters, logged on shutdown

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Counters updated by a driver
#[derive(Debug, Default)]
pub struct FlowStats {
    pub flows_opened: AtomicU64,
    pub flows_closed: AtomicU64,
    pub flows_rejected: AtomicU64,
    /// Bytes pushed into shared rings by this process
    pub bytes_in: AtomicU64,
    /// Bytes popped from shared rings and written out by this process
    pub bytes_out: AtomicU64,
    /// Padding received (shaped) or discarded (unshaped)
    pub dummy_bytes: AtomicU64,
    pub control_messages: AtomicU64,
    pub protocol_violations: AtomicU64,
}

impl FlowStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            flows_opened: self.flows_opened.load(Ordering::Relaxed),
            flows_closed: self.flows_closed.load(Ordering::Relaxed),
            flows_rejected: self.flows_rejected.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            dummy_bytes: self.dummy_bytes.load(Ordering::Relaxed),
            control_messages: self.control_messages.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self, role: impl fmt::Display) {
        info!(%role, "relay summary: {}", self.snapshot());
    }
}

/// Plain copy of [`FlowStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub flows_opened: u64,
    pub flows_closed: u64,
    pub flows_rejected: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub dummy_bytes: u64,
    pub control_messages: u64,
    pub protocol_violations: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flows opened={} closed={} rejected={}, bytes in={} out={} dummy={}, control={}, violations={}",
            self.flows_opened,
            self.flows_closed,
            self.flows_rejected,
            self.bytes_in,
            self.bytes_out,
            self.dummy_bytes,
            self.control_messages,
            self.protocol_violations
        )
    }
}
