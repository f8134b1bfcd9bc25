//! dpmux traffic-shaping middlebox library
//!
//! A middlebox is two cooperating processes sharing one memory region. The
//! unshaped process terminates ordinary TCP flows; the shaped process
//! multiplexes them over a single QUIC connection to the peer middlebox and
//! paces every byte it sends with differentially private decisions, padding
//! with dummy traffic so the observable rate depends only on the noise.

pub mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod flow;
pub mod logging;
pub mod protocol;
pub mod shaper;
pub mod shm;
pub mod stats;
pub mod transport;
