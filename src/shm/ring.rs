//! Lock-free single-producer/single-consumer byte ring.
//!
//! Each ring is a [`RingHeader`] followed by `capacity` bytes of storage,
//! both living inside a [`SharedRegion`]. The producer owns `back`, the
//! consumer owns `front`; each side keeps a private cached copy of the other
//! side's index and only refreshes it (acquire) when the cached value says
//! the operation cannot proceed. One slot always stays empty, so at most
//! `capacity - 1` bytes are resident.
//!
//! The header also carries the per-flow lifecycle flags and address pair,
//! which both processes read through the same mapping.

use super::region::SharedRegion;
use crate::constants::ADDRESS_PAIR_LEN;
use crate::error::{ControlError, RingError, ShmError};
use crate::flow::address::AddressPair;
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[repr(C, align(128))]
struct CachePadded<T>(T);

#[repr(C)]
struct Cursor {
    /// Index owned by this side
    index: AtomicUsize,
    /// This side's private copy of the other side's index
    cached_peer: AtomicUsize,
}

#[repr(C)]
struct LifecycleFlags {
    marked_for_deletion: AtomicBool,
    sent_fin: AtomicBool,
    /// Set while the ring's producer process has the flow bound
    in_use: AtomicBool,
}

/// In-region ring header. Both processes must agree on this layout.
#[repr(C, align(128))]
pub(crate) struct RingHeader {
    id: AtomicU64,
    capacity: AtomicU64,
    consumer: CachePadded<Cursor>,
    producer: CachePadded<Cursor>,
    flags: CachePadded<LifecycleFlags>,
    address: UnsafeCell<[u8; ADDRESS_PAIR_LEN]>,
}

impl RingHeader {
    pub(crate) const SIZE: usize = std::mem::size_of::<RingHeader>();
}

/// Handle to one ring inside a shared region.
///
/// Cloning the handle does not clone the ring. At any moment exactly one
/// thread (in one process) may push and exactly one may pop; the flow pool
/// and the drivers uphold that discipline.
#[derive(Clone)]
pub struct RingBuffer {
    /// Keeps the mapping alive for `header` and `storage`
    _region: Arc<SharedRegion>,
    header: NonNull<RingHeader>,
    storage: NonNull<u8>,
    capacity: usize,
}

// SAFETY: all shared state in the header is atomic; the storage bytes are
// only touched by the single producer (free part) or the single consumer
// (resident part), ordered by the release/acquire index publication.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Standalone ring in its own anonymous mapping
    pub fn with_capacity(capacity: usize) -> Result<Self, ShmError> {
        let len = RingHeader::SIZE + capacity;
        let region = Arc::new(SharedRegion::anonymous(len)?);
        // SAFETY: the region is fresh and large enough for one ring.
        Ok(unsafe { Self::init(region, 0, 0, capacity) })
    }

    /// Construct a ring in place at `offset`.
    ///
    /// # Safety
    /// Nothing else may be using the ring at `offset` while it is initialised.
    pub(crate) unsafe fn init(region: Arc<SharedRegion>, offset: usize, id: u64, capacity: usize) -> Self {
        assert!(capacity >= 2, "ring capacity must be at least 2 bytes");
        let header = region.ptr_at(offset, RingHeader::SIZE + capacity).cast::<RingHeader>();
        header.as_ptr().write(RingHeader {
            id: AtomicU64::new(id),
            capacity: AtomicU64::new(capacity as u64),
            consumer: CachePadded(Cursor {
                index: AtomicUsize::new(0),
                cached_peer: AtomicUsize::new(0),
            }),
            producer: CachePadded(Cursor {
                index: AtomicUsize::new(0),
                cached_peer: AtomicUsize::new(0),
            }),
            flags: CachePadded(LifecycleFlags {
                marked_for_deletion: AtomicBool::new(false),
                sent_fin: AtomicBool::new(false),
                in_use: AtomicBool::new(false),
            }),
            address: UnsafeCell::new([0; ADDRESS_PAIR_LEN]),
        });
        Self::from_parts(region, offset, capacity)
    }

    /// View a ring another process already initialised at `offset`.
    ///
    /// Fails with the stored capacity if it does not match `capacity`.
    pub(crate) fn attach(region: Arc<SharedRegion>, offset: usize, capacity: usize) -> Result<Self, usize> {
        let ring = Self::from_parts(region, offset, capacity);
        let stored = ring.header().capacity.load(Ordering::Acquire) as usize;
        if stored == capacity {
            Ok(ring)
        } else {
            Err(stored)
        }
    }

    fn from_parts(region: Arc<SharedRegion>, offset: usize, capacity: usize) -> Self {
        let header = region.ptr_at(offset, RingHeader::SIZE + capacity).cast::<RingHeader>();
        let storage = region.ptr_at(offset + RingHeader::SIZE, capacity);
        Self {
            _region: region,
            header,
            storage,
            capacity,
        }
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: the header was placed by `init` and lives as long as `region`.
        unsafe { self.header.as_ref() }
    }

    /// Ring identifier (its index in the region)
    pub fn id(&self) -> u64 {
        self.header().id.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append all of `bytes`, or nothing.
    ///
    /// Panics if `bytes.len() >= capacity`.
    pub fn push(&self, bytes: &[u8]) -> Result<(), RingError> {
        let len = bytes.len();
        assert!(
            len < self.capacity,
            "push of {} bytes into ring {} with capacity {}",
            len,
            self.id(),
            self.capacity
        );
        if len == 0 {
            return Ok(());
        }

        let header = self.header();
        let producer = &header.producer.0;
        let back = producer.index.load(Ordering::Relaxed);
        let mut front = producer.cached_peer.load(Ordering::Relaxed);
        if self.free_between(front, back) < len {
            front = header.consumer.0.index.load(Ordering::Acquire);
            producer.cached_peer.store(front, Ordering::Relaxed);
            if self.free_between(front, back) < len {
                return Err(RingError::Full);
            }
        }

        let first = len.min(self.capacity - back);
        // SAFETY: [back, back + len) mod capacity is free space owned by the producer.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.storage.as_ptr().add(back), first);
            ptr::copy_nonoverlapping(bytes.as_ptr().add(first), self.storage.as_ptr(), len - first);
        }
        producer.index.store((back + len) % self.capacity, Ordering::Release);
        Ok(())
    }

    /// Remove exactly `out.len()` bytes into `out`, or nothing.
    ///
    /// Panics if `out.len() >= capacity`.
    pub fn pop(&self, out: &mut [u8]) -> Result<(), RingError> {
        let len = out.len();
        assert!(
            len < self.capacity,
            "pop of {} bytes from ring {} with capacity {}",
            len,
            self.id(),
            self.capacity
        );
        if len == 0 {
            return Ok(());
        }

        let header = self.header();
        let consumer = &header.consumer.0;
        let front = consumer.index.load(Ordering::Relaxed);
        let mut back = consumer.cached_peer.load(Ordering::Relaxed);
        if self.used_between(front, back) < len {
            back = header.producer.0.index.load(Ordering::Acquire);
            consumer.cached_peer.store(back, Ordering::Relaxed);
            if self.used_between(front, back) < len {
                return Err(RingError::Empty);
            }
        }

        let first = len.min(self.capacity - front);
        // SAFETY: [front, front + len) mod capacity is resident data owned by the consumer.
        unsafe {
            ptr::copy_nonoverlapping(self.storage.as_ptr().add(front), out.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(self.storage.as_ptr(), out.as_mut_ptr().add(first), len - first);
        }
        consumer.index.store((front + len) % self.capacity, Ordering::Release);
        Ok(())
    }

    /// Pop exactly `len` bytes into a new buffer
    pub fn pop_vec(&self, len: usize) -> Result<Vec<u8>, RingError> {
        let mut out = vec![0u8; len];
        self.pop(&mut out)?;
        Ok(out)
    }

    /// Resident bytes (a snapshot)
    pub fn size(&self) -> usize {
        let header = self.header();
        let front = header.consumer.0.index.load(Ordering::Relaxed);
        let back = header.producer.0.index.load(Ordering::Acquire);
        self.used_between(front, back)
    }

    /// Bytes that can currently be pushed (a snapshot)
    pub fn free_space(&self) -> usize {
        self.capacity - self.size() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Reset both indices. Only valid while neither side is using the ring.
    pub fn clear(&self) {
        let header = self.header();
        header.consumer.0.index.store(0, Ordering::Relaxed);
        header.consumer.0.cached_peer.store(0, Ordering::Relaxed);
        header.producer.0.index.store(0, Ordering::Relaxed);
        header.producer.0.cached_peer.store(0, Ordering::Release);
    }

    fn used_between(&self, front: usize, back: usize) -> usize {
        (back + self.capacity - front) % self.capacity
    }

    fn free_between(&self, front: usize, back: usize) -> usize {
        self.capacity - self.used_between(front, back) - 1
    }

    // ------------------------------------------------------------------
    // Lifecycle metadata
    // ------------------------------------------------------------------

    pub fn is_marked_for_deletion(&self) -> bool {
        self.header().flags.0.marked_for_deletion.load(Ordering::Acquire)
    }

    pub fn mark_for_deletion(&self) {
        self.header().flags.0.marked_for_deletion.store(true, Ordering::Release);
    }

    pub fn sent_fin(&self) -> bool {
        self.header().flags.0.sent_fin.load(Ordering::Acquire)
    }

    pub fn set_sent_fin(&self) {
        self.header().flags.0.sent_fin.store(true, Ordering::Release);
    }

    pub fn in_use(&self) -> bool {
        self.header().flags.0.in_use.load(Ordering::Acquire)
    }

    pub fn set_in_use(&self, in_use: bool) {
        self.header().flags.0.in_use.store(in_use, Ordering::Release);
    }

    /// Clear the FIN flags ahead of reuse; `in_use` is left alone
    pub fn reset_flags(&self) {
        let flags = &self.header().flags.0;
        flags.marked_for_deletion.store(false, Ordering::Relaxed);
        flags.sent_fin.store(false, Ordering::Release);
    }

    /// Stamp the address pair. Must happen before the SYN that announces it.
    pub(crate) fn write_address(&self, address: &AddressPair) {
        // SAFETY: only the allocating side writes, before publishing the flow
        // through a signal record (release on the signal ring's index).
        unsafe { address.encode_into(&mut *self.header().address.get()) };
    }

    /// Read the address pair stamped by the allocating side
    pub(crate) fn read_address(&self) -> Result<AddressPair, ControlError> {
        // SAFETY: readers observe the address after acquiring the SYN signal.
        let bytes = unsafe { &*self.header().address.get() };
        AddressPair::decode(bytes)
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("id", &self.id())
            .field("capacity", &self.capacity)
            .field("size", &self.size())
            .finish()
    }
}
