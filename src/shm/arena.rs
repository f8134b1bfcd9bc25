//! Typed view over an initialised shared region.

use super::layout::ShmLayout;
use super::region::{region_path, SharedRegion};
use super::ring::RingBuffer;
use super::signal::{SignalChannel, SignalInfoHeader};
use crate::error::{LayoutError, ShmError};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::info;

/// The shared region seen as signal channel, dummy pair and flow rings.
pub struct ShmArena {
    region: Arc<SharedRegion>,
    header: NonNull<SignalInfoHeader>,
    layout: ShmLayout,
    signals: SignalChannel,
    /// (from_shaped, to_shaped) per pair; index 0 is the dummy pair
    pairs: Vec<(RingBuffer, RingBuffer)>,
}

// SAFETY: the header is only accessed through atomics; rings are Send + Sync.
unsafe impl Send for ShmArena {}
unsafe impl Sync for ShmArena {}

impl ShmArena {
    /// Initialise every structure in `region` and record this process as the
    /// unshaped side.
    pub fn create(region: SharedRegion, layout: ShmLayout) -> Result<Self, ShmError> {
        check_len(&region, &layout)?;
        let region = Arc::new(region);

        let header = region.ptr_at(0, SignalInfoHeader::SIZE).cast::<SignalInfoHeader>();
        // SAFETY: the creator is the only process touching the region so far.
        unsafe {
            header
                .as_ptr()
                .write(SignalInfoHeader::new(layout.max_flows(), layout.queue_capacity()))
        };

        let signal_ring = |index: usize| {
            // SAFETY: as above; offsets come from the checked layout.
            unsafe {
                RingBuffer::init(
                    region.clone(),
                    layout.signal_ring_offset(index),
                    index as u64,
                    layout.signal_capacity(),
                )
            }
        };
        let signals = SignalChannel::new(signal_ring(0), signal_ring(1));

        let pairs = (0..layout.pair_count())
            .map(|pair| {
                let (from, to) = layout.pair_offsets(pair);
                let capacity = layout.queue_capacity();
                // SAFETY: as above.
                unsafe {
                    (
                        RingBuffer::init(region.clone(), from, (2 * pair) as u64, capacity),
                        RingBuffer::init(region.clone(), to, (2 * pair + 1) as u64, capacity),
                    )
                }
            })
            .collect();

        let arena = Self {
            region,
            header,
            layout,
            signals,
            pairs,
        };
        arena.header().set_unshaped_pid(std::process::id());
        Ok(arena)
    }

    /// Attach to a region the unshaped process already created and record
    /// this process as the shaped side.
    ///
    /// A region that is still being sized or initialised reports
    /// `UnshapedNotStarted`, so callers can retry.
    pub fn attach(region: SharedRegion, layout: ShmLayout) -> Result<Self, ShmError> {
        if region.len() < SignalInfoHeader::SIZE {
            return Err(ShmError::UnshapedNotStarted);
        }
        let region = Arc::new(region);
        let header = region.ptr_at(0, SignalInfoHeader::SIZE).cast::<SignalInfoHeader>();
        // SAFETY: header bytes are in bounds; the pid is atomic and the
        // creator stores it last, after every other header field.
        let info = unsafe { header.as_ref() };
        if info.unshaped_pid() == 0 {
            return Err(ShmError::UnshapedNotStarted);
        }
        check_len(&region, &layout)?;
        info.validate(layout.max_flows(), layout.queue_capacity())?;

        let attach = |offset: usize, capacity: usize| {
            RingBuffer::attach(region.clone(), offset, capacity).map_err(|found| LayoutError::ShapeMismatch {
                expected_flows: layout.max_flows(),
                expected_capacity: capacity,
                found_flows: layout.max_flows(),
                found_capacity: found,
            })
        };

        let signals = SignalChannel::new(
            attach(layout.signal_ring_offset(0), layout.signal_capacity())?,
            attach(layout.signal_ring_offset(1), layout.signal_capacity())?,
        );
        let mut pairs = Vec::with_capacity(layout.pair_count());
        for pair in 0..layout.pair_count() {
            let (from, to) = layout.pair_offsets(pair);
            pairs.push((
                attach(from, layout.queue_capacity())?,
                attach(to, layout.queue_capacity())?,
            ));
        }

        let arena = Self {
            region,
            header,
            layout,
            signals,
            pairs,
        };
        arena.header().set_shaped_pid(std::process::id());
        Ok(arena)
    }

    /// Create the named region for `app_name` under `dir`
    pub fn create_named(dir: &Path, app_name: &str, layout: ShmLayout) -> Result<Self, ShmError> {
        let path = region_path(dir, app_name);
        let arena = Self::create(SharedRegion::create(&path, layout.total_size())?, layout)?;
        info!(path = %path.display(), size = layout.total_size(), "shared region ready");
        Ok(arena)
    }

    /// Attach to the named region for `app_name`, then unlink its name so the
    /// region is destroyed once both processes have exited.
    pub fn attach_named(dir: &Path, app_name: &str, layout: ShmLayout) -> Result<Self, ShmError> {
        let path = region_path(dir, app_name);
        let arena = Self::attach(SharedRegion::open(&path)?, layout)?;
        arena.region.unlink()?;
        info!(
            path = %path.display(),
            unshaped_pid = arena.unshaped_pid(),
            "attached to shared region"
        );
        Ok(arena)
    }

    /// Fully initialised region in anonymous memory, shared by handle only
    pub fn in_memory(layout: ShmLayout) -> Result<Self, ShmError> {
        Self::create(SharedRegion::anonymous(layout.total_size())?, layout)
    }

    fn header(&self) -> &SignalInfoHeader {
        // SAFETY: placed by `create` (or validated by `attach`); lives as long as `region`.
        unsafe { self.header.as_ref() }
    }

    pub fn layout(&self) -> &ShmLayout {
        &self.layout
    }

    pub fn max_flows(&self) -> usize {
        self.layout.max_flows()
    }

    pub fn signals(&self) -> &SignalChannel {
        &self.signals
    }

    /// Rings reserved for padding traffic: (from_shaped, to_shaped)
    pub fn dummy_pair(&self) -> (&RingBuffer, &RingBuffer) {
        let (from, to) = &self.pairs[0];
        (from, to)
    }

    /// Rings of flow pair `index` (1-based; 0 is the dummy pair)
    pub fn flow_pair(&self, index: usize) -> Option<(&RingBuffer, &RingBuffer)> {
        if index == 0 {
            return None;
        }
        self.pairs.get(index).map(|(from, to)| (from, to))
    }

    pub fn unshaped_pid(&self) -> u32 {
        self.header().unshaped_pid()
    }

    pub fn shaped_pid(&self) -> u32 {
        self.header().shaped_pid()
    }
}

fn check_len(region: &SharedRegion, layout: &ShmLayout) -> Result<(), LayoutError> {
    if region.len() < layout.total_size() {
        return Err(LayoutError::RegionTooSmall {
            required: layout.total_size(),
            actual: region.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ConnStatus;
    use crate::shm::signal::{Direction, SignalRecord};

    #[test]
    fn test_in_memory_arena_exposes_every_pair() {
        let layout = ShmLayout::new(3, 256).unwrap();
        let arena = ShmArena::in_memory(layout).unwrap();
        assert_eq!(arena.max_flows(), 3);
        assert!(arena.flow_pair(0).is_none());
        assert!(arena.flow_pair(3).is_some());
        assert!(arena.flow_pair(4).is_none());

        let (from, to) = arena.flow_pair(2).unwrap();
        assert_eq!(from.id(), 4);
        assert_eq!(to.id(), 5);
        assert_eq!(arena.unshaped_pid(), std::process::id());
    }

    #[test]
    fn test_attach_sees_creator_state() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ShmLayout::new(2, 512).unwrap();
        let unshaped = ShmArena::create_named(dir.path(), "attach-test", layout).unwrap();
        let shaped = ShmArena::attach_named(dir.path(), "attach-test", layout).unwrap();

        // Name is gone once both sides are mapped
        assert!(!region_path(dir.path(), "attach-test").exists());
        assert_eq!(unshaped.shaped_pid(), std::process::id());

        let (_, to_shaped) = unshaped.flow_pair(1).unwrap();
        to_shaped.push(b"across").unwrap();
        unshaped
            .signals()
            .send(Direction::ToShaped, SignalRecord::new(1, ConnStatus::Syn))
            .unwrap();

        assert_eq!(
            shaped.signals().recv(Direction::ToShaped),
            Some(SignalRecord::new(1, ConnStatus::Syn))
        );
        let (_, seen) = shaped.flow_pair(1).unwrap();
        assert_eq!(seen.pop_vec(6).unwrap(), b"across");
    }

    #[test]
    fn test_attach_rejects_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let _unshaped = ShmArena::create_named(dir.path(), "mismatch", ShmLayout::new(2, 512).unwrap()).unwrap();
        let err = ShmArena::attach_named(dir.path(), "mismatch", ShmLayout::new(2, 1024).unwrap());
        assert!(matches!(err, Err(ShmError::Layout(_))));
    }

    #[test]
    fn test_attach_requires_unshaped_pid() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ShmLayout::new(1, 256).unwrap();
        let path = region_path(dir.path(), "no-unshaped");
        let region = SharedRegion::create(&path, layout.total_size()).unwrap();
        let arena = ShmArena::create(region, layout).unwrap();
        arena.header().set_unshaped_pid(0);

        let err = ShmArena::attach(SharedRegion::open(&path).unwrap(), layout);
        assert!(matches!(err, Err(ShmError::UnshapedNotStarted)));
    }

    #[test]
    fn test_attach_to_blank_region_waits_for_creator() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ShmLayout::new(1, 256).unwrap();
        let path = region_path(dir.path(), "blank");
        // Sized by the creator, header not written yet
        let _region = SharedRegion::create(&path, layout.total_size()).unwrap();

        let err = ShmArena::attach(SharedRegion::open(&path).unwrap(), layout);
        assert!(matches!(err, Err(ShmError::UnshapedNotStarted)));
    }

    #[test]
    fn test_attach_to_missing_region_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ShmArena::attach_named(dir.path(), "absent", ShmLayout::new(1, 256).unwrap());
        assert!(matches!(err, Err(ShmError::Io { .. })));
    }
}
