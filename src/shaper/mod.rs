// Traffic shaping for the shaped transport
//
// Decides how many bytes leave per interval (noise + credit) and paces them
// out as real data followed by padding.

pub mod credit;
pub mod noise;
pub mod scheduler;

pub use credit::Credit;
pub use noise::{NoiseGenerator, NoiseParams};
pub use scheduler::{
    BufferKind, Fairness, PacingStrategy, PreparedBuffer, Scheduler, SchedulerStats, ShaperTiming, ShapingSource,
    TickReport,
};
