//! Memory mappings backing the shared region.
//!
//! The unshaped process creates a file-backed mapping named after the
//! application; the shaped process attaches to it and then unlinks the
//! name, so the region disappears once both processes exit. Tests and
//! single-process setups use an anonymous mapping instead.

use crate::error::ShmError;
use memmap2::MmapMut;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::debug;

/// A mapped memory region shared by the two middlebox processes.
pub struct SharedRegion {
    map: MmapMut,
    base: NonNull<u8>,
    path: Option<PathBuf>,
}

// SAFETY: the region is plain bytes. Every structure placed inside it is
// either atomic or follows the single-producer/single-consumer discipline
// documented on `RingBuffer`, so sharing the mapping across threads is sound.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map `len` zeroed bytes that are not visible to other processes
    pub fn anonymous(len: usize) -> Result<Self, ShmError> {
        let map = MmapMut::map_anon(len).map_err(|source| ShmError::Io {
            path: "<anonymous>".to_string(),
            source,
        })?;
        Ok(Self::from_map(map, None))
    }

    /// Create (or truncate) the named region and map it
    pub fn create(path: &Path, len: usize) -> Result<Self, ShmError> {
        let io_err = |source| ShmError::Io {
            path: path.display().to_string(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(io_err)?;
        // A freshly extended file reads back as zeroes
        file.set_len(len as u64).map_err(io_err)?;
        // SAFETY: the file was just sized to `len`; only dpmux processes map it.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(io_err)?;
        debug!(path = %path.display(), len, "created shared region");
        Ok(Self::from_map(map, Some(path.to_path_buf())))
    }

    /// Map an existing named region
    pub fn open(path: &Path) -> Result<Self, ShmError> {
        let io_err = |source| ShmError::Io {
            path: path.display().to_string(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err)?;
        // SAFETY: the creator sized the file before publishing its header.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(io_err)?;
        debug!(path = %path.display(), len = map.len(), "attached shared region");
        Ok(Self::from_map(map, Some(path.to_path_buf())))
    }

    fn from_map(mut map: MmapMut, path: Option<PathBuf>) -> Self {
        // The mapping address is stable for the lifetime of `map`
        let base = NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self { map, base, path }
    }

    /// Remove the region's name; existing mappings stay valid until unmapped
    pub fn unlink(&self) -> Result<(), ShmError> {
        if let Some(path) = &self.path {
            fs::remove_file(path).map_err(|source| ShmError::Io {
                path: path.display().to_string(),
                source,
            })?;
            debug!(path = %path.display(), "unlinked shared region");
        }
        Ok(())
    }

    /// Size of the mapping in bytes
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Backing file, if the region is named
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Pointer `offset` bytes into the region.
    ///
    /// Panics if `offset + len` exceeds the mapping.
    pub(crate) fn ptr_at(&self, offset: usize, len: usize) -> NonNull<u8> {
        let end = offset.checked_add(len).unwrap_or(usize::MAX);
        assert!(end <= self.map.len(), "region access {}..{} out of bounds ({})", offset, end, self.map.len());
        // SAFETY: bounds checked above; base points at a live mapping.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }
}

/// Directory used for named regions when none is configured
pub fn default_shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Deterministic region path for an application name
pub fn region_path(dir: &Path, app_name: &str) -> PathBuf {
    let digest = Sha256::digest(app_name.as_bytes());
    let mut key = String::with_capacity(16);
    for byte in &digest[..8] {
        let _ = write!(key, "{:02x}", byte);
    }
    dir.join(format!("dpmux-{}.shm", key))
}
