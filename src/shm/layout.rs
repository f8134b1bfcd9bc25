//! Offset table of the shared region.
//!
//! ```text
//! +----------------------+  0
//! | SignalInfo header    |
//! | signal ring (to)     |
//! | signal ring (from)   |
//! +----------------------+  rings_offset
//! | pair 0 (dummy)       |  from_shaped, to_shaped
//! | pair 1 .. max_flows  |  from_shaped, to_shaped
//! +----------------------+  total_size
//! ```
//!
//! Every ring is a header plus `capacity` bytes, rounded up to `RING_ALIGN`.
//! Both processes compute the table from the same configuration; all
//! arithmetic is checked so an oversized configuration fails up front.

use super::ring::RingHeader;
use super::signal::SignalInfoHeader;
use crate::constants::{RESERVED_PAIRS, RING_ALIGN, SIGNAL_RECORD_LEN, SIGNAL_SLOTS_BASE, SIGNAL_SLOTS_PER_FLOW};
use crate::error::LayoutError;
use std::fmt;

/// Smallest per-flow ring capacity accepted
pub const MIN_QUEUE_CAPACITY: usize = 64;

/// Byte offsets of every structure in the shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmLayout {
    max_flows: usize,
    queue_capacity: usize,
    signal_capacity: usize,
    signal_stride: usize,
    ring_stride: usize,
    rings_offset: usize,
    total_size: usize,
}

impl ShmLayout {
    pub fn new(max_flows: usize, queue_capacity: usize) -> Result<Self, LayoutError> {
        if max_flows == 0 {
            return Err(LayoutError::NoFlows);
        }
        if queue_capacity < MIN_QUEUE_CAPACITY {
            return Err(LayoutError::CapacityTooSmall(queue_capacity, MIN_QUEUE_CAPACITY));
        }

        let signal_slots = max_flows
            .checked_mul(SIGNAL_SLOTS_PER_FLOW)
            .and_then(|n| n.checked_add(SIGNAL_SLOTS_BASE))
            .ok_or(LayoutError::Overflow)?;
        // One spare byte: a ring holds at most capacity - 1
        let signal_capacity = signal_slots
            .checked_mul(SIGNAL_RECORD_LEN)
            .and_then(|n| n.checked_add(1))
            .ok_or(LayoutError::Overflow)?;
        let signal_stride = ring_stride(signal_capacity)?;
        let ring_stride = ring_stride(queue_capacity)?;

        let rings_offset = signal_stride
            .checked_mul(2)
            .and_then(|n| n.checked_add(align_up(SignalInfoHeader::SIZE, RING_ALIGN)?))
            .ok_or(LayoutError::Overflow)?;
        let ring_count = max_flows
            .checked_add(RESERVED_PAIRS)
            .and_then(|n| n.checked_mul(2))
            .ok_or(LayoutError::Overflow)?;
        let total_size = ring_stride
            .checked_mul(ring_count)
            .and_then(|n| n.checked_add(rings_offset))
            .ok_or(LayoutError::Overflow)?;

        Ok(Self {
            max_flows,
            queue_capacity,
            signal_capacity,
            signal_stride,
            ring_stride,
            rings_offset,
            total_size,
        })
    }

    pub fn max_flows(&self) -> usize {
        self.max_flows
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn signal_capacity(&self) -> usize {
        self.signal_capacity
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Number of ring pairs, dummy pair included
    pub fn pair_count(&self) -> usize {
        self.max_flows + RESERVED_PAIRS
    }

    /// Offset of a signal ring (0 = to shaped, 1 = from shaped)
    pub fn signal_ring_offset(&self, index: usize) -> usize {
        debug_assert!(index < 2);
        align_up(SignalInfoHeader::SIZE, RING_ALIGN).unwrap_or(0) + index * self.signal_stride
    }

    /// Offset of ring `index`; even indices are from-shaped rings
    pub fn ring_offset(&self, index: usize) -> usize {
        debug_assert!(index < 2 * self.pair_count());
        self.rings_offset + index * self.ring_stride
    }

    /// Offsets of (from_shaped, to_shaped) for pair `pair`
    pub fn pair_offsets(&self, pair: usize) -> (usize, usize) {
        (self.ring_offset(2 * pair), self.ring_offset(2 * pair + 1))
    }
}

impl fmt::Display for ShmLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "max_flows        {}", self.max_flows)?;
        writeln!(f, "queue_capacity   {}", self.queue_capacity)?;
        writeln!(f, "ring header      {}", RingHeader::SIZE)?;
        writeln!(f, "ring stride      {}", self.ring_stride)?;
        writeln!(f, "signal capacity  {}", self.signal_capacity)?;
        writeln!(f, "signal header    0x{:08x}", 0)?;
        for index in 0..2 {
            let name = if index == 0 { "to_shaped" } else { "from_shaped" };
            writeln!(f, "signal {:<11} 0x{:08x}", name, self.signal_ring_offset(index))?;
        }
        for pair in 0..self.pair_count() {
            let (from, to) = self.pair_offsets(pair);
            let label = if pair == 0 { "dummy".to_string() } else { format!("flow {}", pair) };
            writeln!(f, "{:<16} from 0x{:08x} to 0x{:08x}", label, from, to)?;
        }
        write!(f, "total            {} bytes", self.total_size)
    }
}

fn ring_stride(capacity: usize) -> Result<usize, LayoutError> {
    RingHeader::SIZE
        .checked_add(capacity)
        .and_then(|n| align_up(n, RING_ALIGN))
        .ok_or(LayoutError::Overflow)
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|n| n / align * align)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_degenerate_shapes() {
        assert_eq!(ShmLayout::new(0, 4096), Err(LayoutError::NoFlows));
        assert_eq!(
            ShmLayout::new(1, 10),
            Err(LayoutError::CapacityTooSmall(10, MIN_QUEUE_CAPACITY))
        );
        assert_eq!(ShmLayout::new(usize::MAX / 2, 4096), Err(LayoutError::Overflow));
    }

    #[test]
    fn test_rings_are_aligned_and_disjoint() {
        let layout = ShmLayout::new(3, 1000).unwrap();
        assert_eq!(layout.pair_count(), 4);

        let mut previous_end = layout.signal_ring_offset(1) + RingHeader::SIZE + layout.signal_capacity();
        for index in 0..2 * layout.pair_count() {
            let offset = layout.ring_offset(index);
            assert_eq!(offset % RING_ALIGN, 0);
            assert!(offset >= previous_end);
            previous_end = offset + RingHeader::SIZE + layout.queue_capacity();
        }
        assert!(previous_end <= layout.total_size());
    }

    #[test]
    fn test_signal_rings_follow_header() {
        let layout = ShmLayout::new(2, 4096).unwrap();
        assert!(layout.signal_ring_offset(0) >= SignalInfoHeader::SIZE);
        assert_eq!(layout.signal_ring_offset(0) % RING_ALIGN, 0);
        assert!(layout.signal_ring_offset(1) >= layout.signal_ring_offset(0) + RingHeader::SIZE + layout.signal_capacity());
        assert!(layout.ring_offset(0) >= layout.signal_ring_offset(1) + RingHeader::SIZE + layout.signal_capacity());
    }

    #[test]
    fn test_signal_ring_holds_per_flow_budget() {
        let layout = ShmLayout::new(10, 4096).unwrap();
        let slots = (layout.signal_capacity() - 1) / SIGNAL_RECORD_LEN;
        assert_eq!(slots, 10 * SIGNAL_SLOTS_PER_FLOW + SIGNAL_SLOTS_BASE);
    }

    #[test]
    fn test_display_lists_every_pair() {
        let layout = ShmLayout::new(2, 4096).unwrap();
        let table = layout.to_string();
        assert!(table.contains("dummy"));
        assert!(table.contains("flow 1"));
        assert!(table.contains("flow 2"));
        assert!(!table.contains("flow 3"));
    }
}
