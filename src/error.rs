//! Error types shared across the shaping core.
//!
//! `Full` and `Empty` are ordinary results of the lock-free rings, not
//! failures; everything else describes a condition the caller must log
//! or reject.

use thiserror::Error;

/// Outcome of a ring operation that could not complete right now.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Not enough free space for the whole write.
    #[error("ring buffer is full")]
    Full,
    /// Not enough resident bytes for the whole read.
    #[error("ring buffer is empty")]
    Empty,
}

/// Errors computing or validating the shared-memory layout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("max_flows must be greater than 0")]
    NoFlows,
    #[error("queue capacity {0} is too small (minimum {1})")]
    CapacityTooSmall(usize, usize),
    #[error("shared region size overflows usize")]
    Overflow,
    #[error("region has bad magic bytes")]
    BadMagic,
    #[error("region layout version {found} does not match {expected}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("region was created for {found_flows} flows x {found_capacity} bytes, expected {expected_flows} x {expected_capacity}")]
    ShapeMismatch {
        expected_flows: usize,
        expected_capacity: usize,
        found_flows: usize,
        found_capacity: usize,
    },
    #[error("region is {actual} bytes, layout needs {required}")]
    RegionTooSmall { required: usize, actual: usize },
}

/// Errors creating or attaching the shared region.
#[derive(Error, Debug)]
pub enum ShmError {
    #[error("IO error on shared region {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("unshaped process has not initialised the shared region yet")]
    UnshapedNotStarted,
}

/// Errors from the queue-pair registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No idle queue pair left; the new flow must be rejected.
    #[error("flow pool exhausted")]
    Exhausted,
    /// A lifecycle rule was broken; the operation was refused.
    #[error("flow pool invariant violated: {0}")]
    InvariantViolation(String),
    #[error("unknown queue id {0}")]
    UnknownQueue(u64),
}

/// Errors decoding control-stream records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("control record needs {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("unknown stream type {0}")]
    InvalidStreamType(u8),
    #[error("unknown connection status {0}")]
    InvalidConnStatus(u8),
    #[error("address field is not valid UTF-8")]
    InvalidAddress,
}

/// Errors reported by a transport implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("unknown stream {0}")]
    UnknownStream(u64),
    #[error("unknown socket {0}")]
    UnknownSocket(u64),
    #[error("transport closed")]
    Closed,
    #[error("transport error: {0}")]
    Other(String),
}

/// Invalid shaper or process configuration; fatal at start-up.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("decision interval ({decision_us}us) must be a non-zero multiple of the sending interval ({sending_us}us)")]
    IntervalMismatch { decision_us: u64, sending_us: u64 },
    #[error("invalid noise parameter: {0}")]
    InvalidNoise(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors on the per-flow data path. None of these abort the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// The destination ring is full; retry the same bytes after a back-off.
    #[error("flow {0} is backpressured")]
    Backpressure(u64),
    #[error("no flow bound to handle {0}")]
    UnknownFlow(u64),
    #[error("flow rejected: {0}")]
    Rejected(#[from] PoolError),
    #[error("invalid flow address: {0}")]
    Address(#[from] ControlError),
}
