// Credit-based pacing of the shaped transport
//
// Two periodic tasks share one `Credit`. The accumulator turns the aggregate
// backlog into a noisy decision every decision interval and deposits it. The
// sender runs every sending interval and emits an exact per-tick budget:
// queued data first, the remainder as all-zero padding on the dummy stream.

use super::credit::Credit;
use super::noise::NoiseGenerator;
use crate::driver::{spawn_periodic, Shutdown};
use crate::error::ConfigError;
use crate::transport::StreamId;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How a decision is spread over the sending ticks of its interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PacingStrategy {
    /// Release the whole credit on the first tick
    Burst,
    /// Release equal slices on every tick of the interval
    Uniform,
}

/// How the data budget of a tick is split between flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Fairness {
    /// Lowest queue id first, each flow takes all it can
    #[default]
    InOrder,
    /// Like `InOrder`, but the starting flow rotates every tick
    RoundRobin,
    /// Equal slices per backlogged flow, leftovers handed out in order
    EqualShare,
}

/// Validated pair of scheduler intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaperTiming {
    decision_interval: Duration,
    sending_interval: Duration,
    strategy: PacingStrategy,
}

impl ShaperTiming {
    /// # Errors
    ///
    /// `IntervalMismatch` unless `decision_interval` is a non-zero multiple
    /// of a non-zero `sending_interval`.
    pub fn new(
        decision_interval: Duration,
        sending_interval: Duration,
        strategy: PacingStrategy,
    ) -> Result<Self, ConfigError> {
        let decision_us = decision_interval.as_micros() as u64;
        let sending_us = sending_interval.as_micros() as u64;
        if sending_us == 0 || decision_us == 0 || decision_us % sending_us != 0 {
            return Err(ConfigError::IntervalMismatch {
                decision_us,
                sending_us,
            });
        }
        Ok(Self {
            decision_interval,
            sending_interval,
            strategy,
        })
    }

    pub fn decision_interval(&self) -> Duration {
        self.decision_interval
    }

    pub fn sending_interval(&self) -> Duration {
        self.sending_interval
    }

    pub fn strategy(&self) -> PacingStrategy {
        self.strategy
    }

    /// Sending ticks per decision interval
    pub fn ticks_per_decision(&self) -> u64 {
        (self.decision_interval.as_micros() / self.sending_interval.as_micros()) as u64
    }

    /// Number of ticks a latched credit is spread over
    pub fn divisor(&self) -> u64 {
        match self.strategy {
            PacingStrategy::Burst => 1,
            PacingStrategy::Uniform => self.ticks_per_decision(),
        }
    }
}

/// What a prepared buffer carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Flow bytes; counts against the tick budget
    Data,
    /// Padding; counts against the tick budget
    Dummy,
    /// Control record; outside the budget
    Control,
}

/// Bytes ready to be written on one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBuffer {
    pub stream: StreamId,
    pub kind: BufferKind,
    pub bytes: Vec<u8>,
}

impl PreparedBuffer {
    pub fn data(stream: StreamId, bytes: Vec<u8>) -> Self {
        Self {
            stream,
            kind: BufferKind::Data,
            bytes,
        }
    }

    pub fn dummy(stream: StreamId, len: usize) -> Self {
        Self {
            stream,
            kind: BufferKind::Dummy,
            bytes: vec![0u8; len],
        }
    }

    pub fn control(stream: StreamId, bytes: Vec<u8>) -> Self {
        Self {
            stream,
            kind: BufferKind::Control,
            bytes,
        }
    }
}

/// Where the scheduler takes bytes from and hands them to
pub trait ShapingSource: Send + Sync + 'static {
    /// Bytes queued across every outbound flow ring
    fn aggregate_backlog(&self) -> usize;

    /// Pop at most `max_bytes` of flow data, plus any control records that
    /// became due (those do not count against `max_bytes`)
    fn prepare_data(&self, max_bytes: usize) -> Vec<PreparedBuffer>;

    /// Padding of exactly `len` bytes, or `None` if no dummy stream exists
    /// yet or it cannot take `len` more bytes
    fn prepare_dummy(&self, len: usize) -> Option<PreparedBuffer>;

    /// Write a buffer to the transport; `false` if it could not be sent
    fn dispatch(&self, buffer: PreparedBuffer) -> bool;
}

/// Result of one sending tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Bytes the tick was entitled to emit
    pub budget: usize,
    /// Flow bytes emitted
    pub data: usize,
    /// Padding bytes emitted
    pub dummy: usize,
}

#[derive(Debug, Default)]
struct SendWindow {
    per_tick: usize,
    ticks_left: u64,
}

/// Counters kept by the scheduler
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub decisions: AtomicU64,
    pub credited_bytes: AtomicU64,
    pub data_bytes: AtomicU64,
    pub dummy_bytes: AtomicU64,
    pub dropped_dummy_bytes: AtomicU64,
}

/// Credit accumulator plus sender over one `ShapingSource`
pub struct Scheduler<S: ShapingSource> {
    source: Arc<S>,
    noise: NoiseGenerator,
    timing: ShaperTiming,
    credit: Credit,
    window: Mutex<SendWindow>,
    stats: SchedulerStats,
}

impl<S: ShapingSource> Scheduler<S> {
    pub fn new(source: Arc<S>, noise: NoiseGenerator, timing: ShaperTiming) -> Self {
        Self {
            source,
            noise,
            timing,
            credit: Credit::new(),
            window: Mutex::new(SendWindow::default()),
            stats: SchedulerStats::default(),
        }
    }

    pub fn credit(&self) -> &Credit {
        &self.credit
    }

    pub fn timing(&self) -> &ShaperTiming {
        &self.timing
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// One accumulator tick: decide on the current backlog and deposit it
    pub fn accumulate(&self) -> usize {
        let backlog = self.source.aggregate_backlog();
        let decision = self.noise.decide(backlog);
        self.credit.deposit(decision);
        self.stats.decisions.fetch_add(1, Ordering::Relaxed);
        self.stats.credited_bytes.fetch_add(decision as u64, Ordering::Relaxed);
        trace!(backlog, decision, "credit decision");
        decision
    }

    /// One sending tick
    pub fn send_tick(&self) -> TickReport {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.ticks_left == 0 {
            let divisor = self.timing.divisor();
            let per_tick = self.credit.available() / divisor as usize;
            if per_tick == 0 {
                drop(window);
                self.flush_control();
                return TickReport::default();
            }
            *window = SendWindow {
                per_tick,
                ticks_left: divisor,
            };
        }
        let budget = window.per_tick;
        window.ticks_left -= 1;
        drop(window);

        let mut data = 0;
        for buffer in self.source.prepare_data(budget) {
            let kind = buffer.kind;
            let len = buffer.bytes.len();
            let stream = buffer.stream;
            // Popped flow bytes are gone from the ring whether or not the write succeeds
            if kind == BufferKind::Data {
                data += len;
            }
            if !self.source.dispatch(buffer) {
                warn!(stream_id = stream, ?kind, len, "failed to dispatch buffer");
            }
        }
        if data > budget {
            warn!(data, budget, "flow data exceeded tick budget");
        }

        let dummy = budget.saturating_sub(data);
        if dummy > 0 {
            match self.source.prepare_dummy(dummy) {
                Some(buffer) => {
                    if !self.source.dispatch(buffer) {
                        warn!(len = dummy, "failed to dispatch padding");
                    }
                }
                None => {
                    // Still charged so the emitted volume stays decision-driven
                    self.stats.dropped_dummy_bytes.fetch_add(dummy as u64, Ordering::Relaxed);
                }
            }
        }

        self.credit.spend(budget);
        self.stats.data_bytes.fetch_add(data as u64, Ordering::Relaxed);
        self.stats.dummy_bytes.fetch_add(dummy as u64, Ordering::Relaxed);
        TickReport {
            budget,
            data: data.min(budget),
            dummy,
        }
    }

    /// Tick without credit: control records still leave, flow bytes do not
    fn flush_control(&self) {
        for buffer in self.source.prepare_data(0) {
            if buffer.kind == BufferKind::Data {
                warn!(stream_id = buffer.stream, len = buffer.bytes.len(), "flow data prepared without budget");
            }
            let (stream, kind) = (buffer.stream, buffer.kind);
            if !self.source.dispatch(buffer) {
                warn!(stream_id = stream, ?kind, "failed to dispatch buffer");
            }
        }
    }

    /// Start the accumulator and sender threads
    pub fn spawn(self: Arc<Self>, shutdown: &Shutdown) -> io::Result<Vec<JoinHandle<()>>> {
        debug!(
            decision_us = self.timing.decision_interval().as_micros() as u64,
            sending_us = self.timing.sending_interval().as_micros() as u64,
            strategy = ?self.timing.strategy(),
            "starting scheduler"
        );
        let accumulator = {
            let scheduler = self.clone();
            spawn_periodic("dpmux-credit", self.timing.decision_interval(), shutdown.clone(), move || {
                scheduler.accumulate();
            })?
        };
        let sender = {
            let scheduler = self.clone();
            spawn_periodic("dpmux-sender", self.timing.sending_interval(), shutdown.clone(), move || {
                scheduler.send_tick();
            })?
        };
        Ok(vec![accumulator, sender])
    }
}
