//! Cachemesh Stats -- sliding-window event counters.
//!
//! The timeline is cut into `measure_period / resolution` slots. Each slot
//! holds a count and the wall-clock bucket it currently represents; a slot
//! whose bucket is older than the current one is reset on reuse. Reads
//! average over *all* slots, so quiet time counts as zero.

use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Upper bound on slots per counter.
pub const MAX_SLOTS: u64 = 10_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("resolution must be at least 1ms")]
    ZeroResolution,
    #[error("resolution {resolution_ms}ms exceeds measure period {period_ms}ms")]
    ResolutionExceedsPeriod { resolution_ms: u64, period_ms: u64 },
    #[error("{slots} slots exceeds the maximum of {MAX_SLOTS}")]
    TooManySlots { slots: u64 },
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    count: u64,
    base_ms: u64,
}

/// Average occurrences per resolution slot over the trailing measure period.
#[derive(Debug)]
pub struct SlidingWindowCounter {
    period_ms: u64,
    resolution_ms: u64,
    slots: Mutex<Vec<Slot>>,
}

impl SlidingWindowCounter {
    pub fn new(measure_period: Duration, resolution: Duration) -> Result<Self, WindowError> {
        let period_ms = measure_period.as_millis() as u64;
        let resolution_ms = resolution.as_millis() as u64;
        if resolution_ms == 0 {
            return Err(WindowError::ZeroResolution);
        }
        if resolution_ms > period_ms {
            return Err(WindowError::ResolutionExceedsPeriod {
                resolution_ms,
                period_ms,
            });
        }
        let slots = period_ms / resolution_ms;
        if slots > MAX_SLOTS {
            return Err(WindowError::TooManySlots { slots });
        }
        Ok(Self {
            // Trim the period to a whole number of slots
            period_ms: slots * resolution_ms,
            resolution_ms,
            slots: Mutex::new(vec![Slot::default(); slots as usize]),
        })
    }

    /// Per-second rate over one minute, as used by diagnostic history.
    pub fn per_second_over_minute() -> Self {
        Self {
            period_ms: 60_000,
            resolution_ms: 1_000,
            slots: Mutex::new(vec![Slot::default(); 60]),
        }
    }

    pub fn measure_period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn resolution(&self) -> Duration {
        Duration::from_millis(self.resolution_ms)
    }

    pub fn slot_count(&self) -> usize {
        (self.period_ms / self.resolution_ms) as usize
    }

    /// Mark one occurrence now.
    pub fn record(&self) {
        self.record_at(now_ms());
    }

    pub fn record_at(&self, now_ms: u64) {
        let index = ((now_ms % self.period_ms) / self.resolution_ms) as usize;
        let base_ms = now_ms - now_ms % self.resolution_ms;

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = &mut slots[index];
        if slot.base_ms != base_ms {
            slot.base_ms = base_ms;
            slot.count = 0;
        }
        slot.count += 1;
    }

    /// Average count per slot, truncated.
    pub fn get(&self) -> u64 {
        self.get_as_double() as u64
    }

    pub fn get_as_double(&self) -> f64 {
        self.get_at(now_ms())
    }

    pub fn get_at(&self, now_ms: u64) -> f64 {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let total: u64 = slots
            .iter()
            .filter(|s| s.count > 0 && now_ms.saturating_sub(s.base_ms) < self.period_ms)
            .map(|s| s.count)
            .sum();
        total as f64 / slots.len() as f64
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            measure_period_ms: self.period_ms,
            resolution_ms: self.resolution_ms,
            rate: self.get_as_double(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct WindowSnapshot {
    pub measure_period_ms: u64,
    pub resolution_ms: u64,
    pub rate: f64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
