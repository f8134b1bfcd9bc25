//! Shared-memory plumbing between the unshaped and shaped processes
//!
//! - `region`: the raw mapping (named file or anonymous)
//! - `layout`: checked offset table both processes compute identically
//! - `ring`: lock-free SPSC byte ring placed inside the region
//! - `signal`: lifecycle records and the `SignalInfo` header
//! - `arena`: typed view tying the pieces together

pub mod arena;
pub mod layout;
pub mod region;
pub mod ring;
pub mod signal;

pub use arena::ShmArena;
pub use layout::ShmLayout;
pub use region::{default_shm_dir, region_path, SharedRegion};
pub use ring::RingBuffer;
pub use signal::{Direction, SignalChannel, SignalRecord};
