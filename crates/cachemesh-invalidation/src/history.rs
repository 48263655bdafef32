//! Bounded diagnostic history of outbound invalidations.
//!
//! Reports are keyed by event kind plus, when stack capture is on, the call
//! stack that produced the event. Each report counts invocations and keeps
//! a per-second rate over the last minute. At capacity the report touched
//! least recently is evicted. Capacity 0 turns recording into a no-op.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use cachemesh_stats::SlidingWindowCounter;
use chrono::{DateTime, Utc};
use serde::Serialize;

const NO_STACK: &str = "<stack capture disabled>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Clear,
    Remove,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Clear => "clear",
            EventKind::Remove => "remove",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReportKey {
    pub kind: EventKind,
    pub stack: Arc<str>,
}

impl ReportKey {
    pub fn new(kind: EventKind, capture_stack: bool) -> Self {
        let stack: Arc<str> = if capture_stack {
            Backtrace::force_capture().to_string().into()
        } else {
            NO_STACK.into()
        };
        Self { kind, stack }
    }

    pub fn has_stack(&self) -> bool {
        &*self.stack != NO_STACK
    }
}

struct Report {
    count: u64,
    rate: SlidingWindowCounter,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    touched: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSnapshot {
    pub kind: EventKind,
    pub stack: Option<String>,
    pub count: u64,
    /// Invocations per second, averaged over the last minute.
    pub rate: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    reports: HashMap<ReportKey, Report>,
    clock: u64,
}

pub struct ReportHistory {
    capacity: usize,
    capture_stack: bool,
    inner: Mutex<Inner>,
}

impl ReportHistory {
    pub fn new(capacity: usize, capture_stack: bool) -> Self {
        Self {
            capacity,
            capture_stack,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, kind: EventKind) {
        if !self.is_enabled() {
            return;
        }
        let key = ReportKey::new(kind, self.capture_stack);
        let now = Utc::now();

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.clock += 1;
        let touched = inner.clock;

        if !inner.reports.contains_key(&key) && inner.reports.len() >= self.capacity {
            let oldest = inner
                .reports
                .iter()
                .min_by_key(|(_, r)| r.touched)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                inner.reports.remove(&oldest);
                tracing::trace!(kind = %oldest.kind, "history: evicted report");
            }
        }

        let report = inner.reports.entry(key).or_insert_with(|| Report {
            count: 0,
            rate: SlidingWindowCounter::per_second_over_minute(),
            first_seen: now,
            last_seen: now,
            touched,
        });
        report.count += 1;
        report.rate.record();
        report.last_seen = now;
        report.touched = touched;
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reports
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reports
            .clear();
    }

    /// Sorted by rate, then count, highest first.
    pub fn snapshot(&self) -> Vec<ReportSnapshot> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<ReportSnapshot> = inner
            .reports
            .iter()
            .map(|(key, report)| ReportSnapshot {
                kind: key.kind,
                stack: key.has_stack().then(|| key.stack.to_string()),
                count: report.count,
                rate: report.rate.get_as_double(),
                first_seen: report.first_seen,
                last_seen: report.last_seen,
            })
            .collect();
        drop(inner);
        out.sort_by(|a, b| {
            b.rate
                .total_cmp(&a.rate)
                .then_with(|| b.count.cmp(&a.count))
        });
        out
    }
}

impl fmt::Debug for ReportHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportHistory")
            .field("capacity", &self.capacity)
            .field("capture_stack", &self.capture_stack)
            .field("len", &self.len())
            .finish()
    }
}
