//! Fixed-size lifecycle records exchanged between the two processes.
//!
//! The `SignalInfo` header sits at offset 0 of the shared region and owns two
//! signal rings, one per direction. Each direction has exactly one pushing
//! process and one polling process; a mutex per direction keeps multiple
//! threads of the same process from interleaving partial records.

use super::ring::RingBuffer;
use crate::constants::{SHM_LAYOUT_VERSION, SHM_MAGIC, SIGNAL_RECORD_LEN};
use crate::error::{ControlError, LayoutError, RingError};
use crate::flow::pool::QueueId;
use crate::protocol::ConnStatus;
use byteorder::{ByteOrder, LittleEndian};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Header at the start of the shared region.
#[repr(C, align(128))]
pub(crate) struct SignalInfoHeader {
    magic: [u8; 8],
    version: u32,
    unshaped_pid: AtomicU32,
    shaped_pid: AtomicU32,
    _reserved: u32,
    max_flows: AtomicU64,
    queue_capacity: AtomicU64,
}

impl SignalInfoHeader {
    pub(crate) const SIZE: usize = std::mem::size_of::<SignalInfoHeader>();

    pub(crate) fn new(max_flows: usize, queue_capacity: usize) -> Self {
        Self {
            magic: SHM_MAGIC,
            version: SHM_LAYOUT_VERSION,
            unshaped_pid: AtomicU32::new(0),
            shaped_pid: AtomicU32::new(0),
            _reserved: 0,
            max_flows: AtomicU64::new(max_flows as u64),
            queue_capacity: AtomicU64::new(queue_capacity as u64),
        }
    }

    /// Check that a region was created with the layout this process expects
    pub(crate) fn validate(&self, max_flows: usize, queue_capacity: usize) -> Result<(), LayoutError> {
        if self.magic != SHM_MAGIC {
            return Err(LayoutError::BadMagic);
        }
        if self.version != SHM_LAYOUT_VERSION {
            return Err(LayoutError::VersionMismatch {
                expected: SHM_LAYOUT_VERSION,
                found: self.version,
            });
        }
        let found_flows = self.max_flows.load(Ordering::Acquire) as usize;
        let found_capacity = self.queue_capacity.load(Ordering::Acquire) as usize;
        if found_flows != max_flows || found_capacity != queue_capacity {
            return Err(LayoutError::ShapeMismatch {
                expected_flows: max_flows,
                expected_capacity: queue_capacity,
                found_flows,
                found_capacity,
            });
        }
        Ok(())
    }

    pub(crate) fn unshaped_pid(&self) -> u32 {
        self.unshaped_pid.load(Ordering::Acquire)
    }

    pub(crate) fn set_unshaped_pid(&self, pid: u32) {
        self.unshaped_pid.store(pid, Ordering::Release);
    }

    pub(crate) fn shaped_pid(&self) -> u32 {
        self.shaped_pid.load(Ordering::Acquire)
    }

    pub(crate) fn set_shaped_pid(&self, pid: u32) {
        self.shaped_pid.store(pid, Ordering::Release);
    }
}

/// Which way a signal travels between the processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Pushed by the unshaped process, polled by the shaped process
    ToShaped,
    /// Pushed by the shaped process, polled by the unshaped process
    FromShaped,
}

/// One lifecycle event for a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalRecord {
    pub queue_id: QueueId,
    pub status: ConnStatus,
}

impl SignalRecord {
    pub fn new(queue_id: QueueId, status: ConnStatus) -> Self {
        Self { queue_id, status }
    }

    /// Layout: `[queue id: u64 LE][status: u8][padding: 7]`
    pub fn encode(&self) -> [u8; SIGNAL_RECORD_LEN] {
        let mut buf = [0u8; SIGNAL_RECORD_LEN];
        LittleEndian::write_u64(&mut buf[..8], self.queue_id);
        buf[8] = self.status as u8;
        buf
    }

    pub fn decode(buf: &[u8; SIGNAL_RECORD_LEN]) -> Result<Self, ControlError> {
        Ok(Self {
            queue_id: LittleEndian::read_u64(&buf[..8]),
            status: ConnStatus::try_from(buf[8])?,
        })
    }
}

/// Both signal rings of a region.
pub struct SignalChannel {
    to_shaped: RingBuffer,
    from_shaped: RingBuffer,
    push_lock: [Mutex<()>; 2],
    poll_lock: [Mutex<()>; 2],
}

impl SignalChannel {
    pub(crate) fn new(to_shaped: RingBuffer, from_shaped: RingBuffer) -> Self {
        Self {
            to_shaped,
            from_shaped,
            push_lock: [Mutex::new(()), Mutex::new(())],
            poll_lock: [Mutex::new(()), Mutex::new(())],
        }
    }

    fn ring(&self, direction: Direction) -> (&RingBuffer, usize) {
        match direction {
            Direction::ToShaped => (&self.to_shaped, 0),
            Direction::FromShaped => (&self.from_shaped, 1),
        }
    }

    /// Push one record; `Full` means the poller is behind and the caller
    /// should retry on its next tick.
    pub fn send(&self, direction: Direction, record: SignalRecord) -> Result<(), RingError> {
        let (ring, slot) = self.ring(direction);
        let _guard = self.push_lock[slot].lock().unwrap_or_else(|e| e.into_inner());
        ring.push(&record.encode())
    }

    /// Pop the next record, if any.
    ///
    /// Undecodable records are skipped; both processes write through
    /// [`SignalRecord::encode`], so one indicates memory corruption.
    pub fn recv(&self, direction: Direction) -> Option<SignalRecord> {
        let (ring, slot) = self.ring(direction);
        let _guard = self.poll_lock[slot].lock().unwrap_or_else(|e| e.into_inner());
        let mut buf = [0u8; SIGNAL_RECORD_LEN];
        loop {
            ring.pop(&mut buf).ok()?;
            match SignalRecord::decode(&buf) {
                Ok(record) => return Some(record),
                Err(e) => tracing::error!(error = %e, "discarding corrupt signal record"),
            }
        }
    }

    /// Pop every record currently queued in one direction
    pub fn drain(&self, direction: Direction) -> Vec<SignalRecord> {
        std::iter::from_fn(|| self.recv(direction)).collect()
    }

    /// Records queued in one direction (a snapshot)
    pub fn pending(&self, direction: Direction) -> usize {
        self.ring(direction).0.size() / SIGNAL_RECORD_LEN
    }
}
