//! Process counters exposed on `/metrics`.
//!
//! Deliberately small: the full metrics stack (scopes, histograms,
//! exporters) lives with the deployment, not in the scanner core. These
//! counters cover the questions an operator asks first.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

pub static EVENTS_CONSUMED: Counter = Counter::new(
    "eagleeye_events_consumed_total",
    "Bucket notification events turned into scan requests",
);

pub static HTTP_REQUESTS: Counter = Counter::new(
    "eagleeye_http_requests_total",
    "HTTP API requests received",
);

pub static SCANS_COMPLETED: Counter = Counter::new(
    "eagleeye_scans_completed_total",
    "Scan requests that reached the end of the scan stage",
);

/// Prometheus text exposition of all counters.
pub fn render() -> String {
    let mut out = String::new();
    for counter in [&EVENTS_CONSUMED, &HTTP_REQUESTS, &SCANS_COMPLETED] {
        out.push_str(&format!("# HELP {} {}\n", counter.name, counter.help));
        out.push_str(&format!("# TYPE {} counter\n", counter.name));
        out.push_str(&format!("{} {}\n", counter.name, counter.get()));
    }
    out
}
