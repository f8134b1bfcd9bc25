// Shared send credit between the accumulator and the sender
//
// The accumulator deposits one noisy decision per decision interval; the
// sender spends what it emits. Nothing else touches the balance.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Non-negative byte budget
#[derive(Debug, Default)]
pub struct Credit(AtomicUsize);

impl Credit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current balance
    pub fn available(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn deposit(&self, bytes: usize) {
        self.0.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Remove up to `bytes`; returns what was actually removed
    pub fn spend(&self, bytes: usize) -> usize {
        match self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |balance| {
                Some(balance.saturating_sub(bytes))
            }) {
            Ok(previous) | Err(previous) => previous.min(bytes),
        }
    }
}
