//! Process drivers and the periodic loops that run them
//!
//! Each middlebox process runs exactly one driver, chosen at start-up:
//! [`ShapedSide`] in the shaped process, [`UnshapedSide`] in the unshaped
//! process. The core loops are plain OS threads ticking on fixed deadlines;
//! transport I/O stays on the tokio runtime.

pub mod shaped;
pub mod unshaped;

pub use shaped::{ShapedOptions, ShapedSide};
pub use unshaped::{UnshapedOptions, UnshapedSide};

use crate::flow::EndpointKey;
use crate::shm::{Direction, SignalChannel, SignalRecord};
use crate::stats::FlowStats;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Longest single sleep of a periodic loop, bounding shutdown latency
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Which process this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Terminates ordinary TCP flows
    Unshaped,
    /// Talks to the peer middlebox over the shaped transport
    Shaped,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Unshaped => write!(f, "unshaped"),
            Role::Shaped => write!(f, "shaped"),
        }
    }
}

/// Which end of the middlebox pair this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeerRole {
    /// Flows originate here: the unshaped process listens and the shaped
    /// process dials the peer and opens streams
    Initiator,
    /// Flows arrive as streams: the shaped process accepts the peer and the
    /// unshaped process connects to each flow's server
    Responder,
}

/// One side of the middlebox, as driven by the periodic loops
pub trait Driver: Send + Sync + 'static {
    fn role(&self) -> Role;

    /// Handle lifecycle records sent by the other process; returns how many
    fn poll_signals(&self) -> usize;

    /// Per-tick flow housekeeping
    fn service(&self);

    fn stats(&self) -> &FlowStats;
}

/// Cooperative stop flag shared by every loop
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Signals that could not be pushed yet, in order.
///
/// Once one record is held back every later record queues behind it, so
/// the other process always sees a flow's SYN before its FIN.
pub(crate) struct SignalOutbox {
    direction: Direction,
    backlog: Mutex<VecDeque<SignalRecord>>,
}

impl SignalOutbox {
    pub(crate) fn new(direction: Direction) -> Self {
        Self {
            direction,
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn send(&self, channel: &SignalChannel, record: SignalRecord) {
        let mut backlog = lock(&self.backlog);
        if backlog.is_empty() && channel.send(self.direction, record).is_ok() {
            return;
        }
        warn!(queue_id = record.queue_id, status = ?record.status, held = backlog.len() + 1, "signal ring full, holding record");
        backlog.push_back(record);
    }

    /// Retry held records; returns how many went out
    pub(crate) fn flush(&self, channel: &SignalChannel) -> usize {
        let mut backlog = lock(&self.backlog);
        let mut sent = 0;
        while let Some(&record) = backlog.front() {
            if channel.send(self.direction, record).is_err() {
                break;
            }
            backlog.pop_front();
            sent += 1;
        }
        sent
    }

    pub(crate) fn held(&self) -> usize {
        lock(&self.backlog).len()
    }
}

/// Endpoint keys for flows whose stream or socket never came up, counting
/// down from the top of the key space
#[derive(Debug, Default)]
pub(crate) struct SyntheticKeys(AtomicU64);

impl SyntheticKeys {
    pub(crate) fn next(&self) -> EndpointKey {
        u64::MAX - self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Run `tick` every `interval` on a named thread until shutdown.
///
/// Deadlines advance by `interval`; a tick that overruns does not cause a
/// burst of catch-up ticks.
pub fn spawn_periodic<F>(name: &str, interval: Duration, shutdown: Shutdown, mut tick: F) -> io::Result<JoinHandle<()>>
where
    F: FnMut() + Send + 'static,
{
    let thread_name = name.to_string();
    thread::Builder::new().name(thread_name.clone()).spawn(move || {
        debug!(thread = %thread_name, interval_us = interval.as_micros() as u64, "periodic loop started");
        let mut deadline = Instant::now();
        while !shutdown.is_triggered() {
            tick();
            deadline += interval;
            let now = Instant::now();
            if deadline <= now {
                deadline = now;
                continue;
            }
            while !shutdown.is_triggered() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::sleep((deadline - now).min(MAX_SLEEP_SLICE));
            }
        }
        debug!(thread = %thread_name, "periodic loop stopped");
    })
}

/// Intervals of a driver's two loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverIntervals {
    pub signal_poll: Duration,
    pub service: Duration,
}

/// Start the signal poller and the service loop for `driver`
pub fn spawn_driver<D: Driver>(
    driver: Arc<D>,
    intervals: DriverIntervals,
    shutdown: &Shutdown,
) -> io::Result<Vec<JoinHandle<()>>> {
    let role = driver.role();
    let poller = {
        let driver = driver.clone();
        spawn_periodic(&format!("dpmux-{}-signals", role), intervals.signal_poll, shutdown.clone(), move || {
            driver.poll_signals();
        })?
    };
    let service = spawn_periodic(&format!("dpmux-{}-service", role), intervals.service, shutdown.clone(), move || {
        driver.service();
    })?;
    Ok(vec![poller, service])
}

/// Wait for every loop thread, logging any that panicked
pub fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
        if handle.join().is_err() {
            error!(thread = %name, "loop thread panicked");
        }
    }
}
