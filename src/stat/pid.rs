//! Smoothed per-backend write-pain score.
//!
//! The score approximates expected microseconds per written byte. Each
//! completed upload feeds one observation per replica; failed writes feed
//! a large constant instead. Updates are lock-free.

use std::sync::atomic::{AtomicU64, Ordering};

/// Proportional smoothing gain
const KP: f64 = 0.5;

/// Atomic f64 pain score, never negative.
#[derive(Debug)]
pub struct PidPain {
    bits: AtomicU64,
}

impl Default for PidPain {
    fn default() -> Self {
        Self::new()
    }
}

impl PidPain {
    pub fn new() -> Self {
        Self { bits: AtomicU64::new(0f64.to_bits()) }
    }

    /// Current pain score.
    pub fn pain(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Overwrite the score; used to carry pain across stat refreshes
    /// when the same backend reappears.
    pub fn store(&self, pain: f64) {
        self.bits.store(pain.max(0.0).to_bits(), Ordering::Relaxed);
    }

    /// Apply one observation: `pain <- max(0, pain + Kp * (obs - pain))`.
    ///
    /// Sustained high observations drive the score up, sustained low ones
    /// decay it toward the observation; it never goes below zero.
    pub fn update(&self, observation: f64) {
        let _ = self.bits.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            let pain = f64::from_bits(bits);
            let next = (pain + KP * (observation - pain)).max(0.0);
            Some(next.to_bits())
        });
    }
}
