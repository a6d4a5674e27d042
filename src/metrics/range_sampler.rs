//! Range sampler: tracks how many "tokens" are concurrently held and
//! periodically samples the current level into a distribution.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::metrics::digest::{Digest, Distribution};
use crate::metrics::instruments::Instrument;
use crate::metrics::registry::MetricSettings;

/// Snapshot of a [`RangeSampler`]: the distribution of sampled levels plus
/// the last level observed by the refresh schedule.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSnapshot {
    /// Distribution of the sampled concurrency levels.
    pub distribution: Distribution,
    /// The level seen by the most recent sample.
    pub last: u64,
}

/// Counts concurrently held tokens: increment on acquire, decrement on
/// release. A refresh schedule calls [`RangeSampler::sample`] at the metric's
/// auto-update interval, folding the current level into an internal digest.
#[derive(Debug)]
pub struct RangeSampler {
    current: AtomicI64,
    last: AtomicU64,
    digest: Mutex<Digest>,
}

impl RangeSampler {
    /// Acquires one token.
    pub fn increment(&self) {
        self.increment_by(1);
    }

    /// Acquires `tokens` tokens.
    pub fn increment_by(&self, tokens: u64) {
        self.current
            .fetch_add(tokens.min(i64::MAX as u64) as i64, Ordering::Relaxed);
    }

    /// Releases one token.
    pub fn decrement(&self) {
        self.decrement_by(1);
    }

    /// Releases `tokens` tokens.
    pub fn decrement_by(&self, tokens: u64) {
        self.current
            .fetch_sub(tokens.min(i64::MAX as u64) as i64, Ordering::Relaxed);
    }

    /// The current token count. Unbalanced releases read as zero.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed).max(0) as u64
    }

    /// Records the current level into the distribution. Called by the
    /// refresh schedule; may also be called directly.
    pub fn sample(&self) {
        let level = self.current();
        self.digest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(level);
        self.last.store(level, Ordering::Relaxed);
    }
}

impl Instrument for RangeSampler {
    type Snapshot = RangeSnapshot;
    const KIND: &'static str = "range-sampler";
    const SELF_REFRESHING: bool = true;

    fn create(settings: &MetricSettings) -> Self {
        RangeSampler {
            current: AtomicI64::new(0),
            last: AtomicU64::new(0),
            digest: Mutex::new(Digest::new(settings.dynamic_range)),
        }
    }

    fn snapshot(&self, reset: bool) -> RangeSnapshot {
        RangeSnapshot {
            distribution: self
                .digest
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .snapshot(reset),
            last: self.last.load(Ordering::Relaxed),
        }
    }

    fn refresh(&self) {
        self.sample();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::DynamicRange;

    fn sampler() -> RangeSampler {
        RangeSampler::create(&MetricSettings {
            dynamic_range: DynamicRange::new(1, 1_000_000, 2),
            ..MetricSettings::default()
        })
    }

    #[test]
    fn tracks_acquires_and_releases() {
        let sampler = sampler();
        sampler.increment_by(3);
        sampler.decrement();
        assert_eq!(sampler.current(), 2);
        sampler.sample();

        let snapshot = sampler.snapshot(false);
        assert_eq!(snapshot.last, 2);
        assert_eq!(snapshot.distribution.count, 1);
        assert_eq!(snapshot.distribution.max, 2);
    }

    #[test]
    fn unbalanced_releases_sample_as_zero() {
        let sampler = sampler();
        sampler.decrement_by(5);
        sampler.sample();
        let snapshot = sampler.snapshot(false);
        assert_eq!(snapshot.last, 0);
        assert_eq!(snapshot.distribution.min, 0);
    }

    #[test]
    fn reset_clears_the_distribution_but_not_the_level() {
        let sampler = sampler();
        sampler.increment();
        sampler.sample();
        sampler.snapshot(true);

        let snapshot = sampler.snapshot(false);
        assert!(snapshot.distribution.is_empty());
        assert_eq!(sampler.current(), 1);
        assert_eq!(snapshot.last, 1);
    }
}
