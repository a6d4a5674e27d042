//! Measurement cells: counters, gauges, histograms and timers.
//!
//! Every instrument is safe for concurrent use from any thread. The hot path
//! is allocation-free: counters and gauges are single atomics, histograms and
//! timers take a short per-cell mutex around the digest. No instrument shares
//! a lock with another instrument or with registry snapshotting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::metrics::digest::{Digest, Distribution};
use crate::metrics::registry::MetricSettings;

/// A measurement cell held by a [`Metric`](crate::metrics::Metric), one per
/// tag set.
pub trait Instrument: Send + Sync + 'static {
    /// The value produced when this instrument is snapshotted.
    type Snapshot;

    /// Lowercase kind name used in registration errors and logs.
    const KIND: &'static str;

    /// Whether the registry should schedule periodic [`Instrument::refresh`]
    /// calls for cells of this instrument at their auto-update interval.
    const SELF_REFRESHING: bool = false;

    /// Builds a cell from the metric's frozen settings.
    fn create(settings: &MetricSettings) -> Self;

    /// Reads the current value, optionally resetting accumulated state.
    fn snapshot(&self, reset: bool) -> Self::Snapshot;

    /// Periodic self-refresh, only meaningful when [`Self::SELF_REFRESHING`].
    fn refresh(&self) {}
}

/// Monotonically increasing count of non-negative amounts.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increments by one.
    pub fn increment(&self) {
        self.increment_by(1);
    }

    /// Increments by `times`.
    pub fn increment_by(&self, times: u64) {
        self.value.fetch_add(times, Ordering::Relaxed);
    }

    /// Current accumulated count since the last reset.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Instrument for Counter {
    type Snapshot = u64;
    const KIND: &'static str = "counter";

    fn create(_settings: &MetricSettings) -> Self {
        Counter::default()
    }

    fn snapshot(&self, reset: bool) -> u64 {
        if reset {
            self.value.swap(0, Ordering::Relaxed)
        } else {
            self.value.load(Ordering::Relaxed)
        }
    }
}

/// A floating-point value that can move in both directions. Snapshots read
/// the instantaneous value and never reset it.
#[derive(Debug, Default)]
pub struct Gauge {
    // f64 bits; plain f64 has no atomics so operations CAS on the bit pattern.
    bits: AtomicU64,
}

impl Gauge {
    /// Overwrites the current value.
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Adds `delta` to the current value.
    pub fn increment(&self, delta: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self.bits.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(seen) => current = seen,
            }
        }
    }

    /// Subtracts `delta` from the current value.
    pub fn decrement(&self, delta: f64) {
        self.increment(-delta);
    }

    /// The instantaneous value.
    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

impl Instrument for Gauge {
    type Snapshot = f64;
    const KIND: &'static str = "gauge";

    fn create(_settings: &MetricSettings) -> Self {
        Gauge::default()
    }

    fn snapshot(&self, _reset: bool) -> f64 {
        self.value()
    }
}

/// Records non-negative values into a high-dynamic-range digest.
#[derive(Debug)]
pub struct Histogram {
    digest: Mutex<Digest>,
}

impl Histogram {
    /// Records one value.
    pub fn record(&self, value: u64) {
        self.record_times(value, 1);
    }

    /// Records `value` as if it had been seen `times` times.
    pub fn record_times(&self, value: u64, times: u64) {
        self.digest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_times(value, times);
    }
}

impl Instrument for Histogram {
    type Snapshot = Distribution;
    const KIND: &'static str = "histogram";

    fn create(settings: &MetricSettings) -> Self {
        Histogram {
            digest: Mutex::new(Digest::new(settings.dynamic_range)),
        }
    }

    fn snapshot(&self, reset: bool) -> Distribution {
        self.digest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot(reset)
    }
}

/// A [`Histogram`] of elapsed times, in nanoseconds.
#[derive(Debug)]
pub struct Timer {
    histogram: Histogram,
}

impl Timer {
    /// Records an elapsed duration.
    pub fn record(&self, elapsed: Duration) {
        self.record_nanos(elapsed.as_nanos().min(u64::MAX as u128) as u64);
    }

    /// Records an elapsed time in nanoseconds.
    pub fn record_nanos(&self, nanos: u64) {
        self.histogram.record(nanos);
    }

    /// Starts measuring; the returned handle records on
    /// [`StartedTimer::stop`].
    pub fn start(&self) -> StartedTimer<'_> {
        StartedTimer {
            timer: self,
            started: Instant::now(),
        }
    }
}

impl Instrument for Timer {
    type Snapshot = Distribution;
    const KIND: &'static str = "timer";

    fn create(settings: &MetricSettings) -> Self {
        Timer {
            histogram: Histogram::create(settings),
        }
    }

    fn snapshot(&self, reset: bool) -> Distribution {
        self.histogram.snapshot(reset)
    }
}

/// An in-flight timer measurement.
#[derive(Debug)]
pub struct StartedTimer<'a> {
    timer: &'a Timer,
    started: Instant,
}

impl StartedTimer<'_> {
    /// Stops the measurement and records the elapsed time.
    pub fn stop(self) {
        self.timer.record(self.started.elapsed());
    }
}
