//! Compact high-dynamic-range value digest.
//!
//! Values are binned into log-linear buckets sized so that any recorded value
//! is off by at most one unit in its configured number of significant decimal
//! digits. Recording is O(1) into a dense count array; snapshots walk the
//! non-empty buckets into a [`Distribution`] from which any percentile can be
//! computed at the configured precision.

use std::time::Duration;

/// The value range and precision a digest (histogram, timer, range sampler)
/// is able to track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DynamicRange {
    /// Lowest discernible non-zero value. Values in `1..lowest` are counted
    /// at `lowest`; zero is always representable.
    pub lowest: u64,
    /// Highest trackable value. Larger recordings are clamped here and
    /// counted as overflow.
    pub highest: u64,
    /// Number of significant decimal digits preserved across the range.
    pub significant_digits: u8,
}

impl DynamicRange {
    /// One nanosecond up to one hour, two significant digits.
    pub fn default_for_timers() -> DynamicRange {
        DynamicRange {
            lowest: 1,
            highest: Duration::from_secs(3_600).as_nanos() as u64,
            significant_digits: 2,
        }
    }

    /// Creates a range, normalizing out-of-bounds arguments.
    pub fn new(lowest: u64, highest: u64, significant_digits: u8) -> DynamicRange {
        let lowest = lowest.max(1);
        DynamicRange {
            lowest,
            highest: highest.max(lowest.saturating_mul(2)),
            significant_digits: significant_digits.clamp(1, 4),
        }
    }
}

impl Default for DynamicRange {
    fn default() -> Self {
        DynamicRange::default_for_timers()
    }
}

/// A single non-empty bucket of a [`Distribution`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DistributionBucket {
    /// Highest value considered equivalent to every recording in the bucket.
    pub value: u64,
    /// Number of recordings that landed in the bucket.
    pub count: u64,
}

/// Immutable summary of the values recorded into a digest over a period.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Distribution {
    /// Total number of recordings.
    pub count: u64,
    /// Smallest recorded value (after clamping), zero when empty.
    pub min: u64,
    /// Largest recorded value (after clamping), zero when empty.
    pub max: u64,
    /// Sum of all recorded values (after clamping).
    pub sum: u64,
    /// Number of recordings clamped down to the range's highest value.
    pub clamped: u64,
    /// Non-empty buckets in ascending value order.
    pub buckets: Vec<DistributionBucket>,
}

impl Distribution {
    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Arithmetic mean of the recorded values, zero when empty.
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    /// The value at the given percentile (`0.0..=100.0`), accurate to the
    /// digest's configured significant digits.
    pub fn percentile(&self, percentile: f64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let fraction = (percentile / 100.0).clamp(0.0, 1.0);
        let target = ((fraction * self.count as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for bucket in &self.buckets {
            seen += bucket.count;
            if seen >= target {
                return bucket.value;
            }
        }
        self.max
    }
}

/// Mutable digest cell. Callers guard it with a short-lived mutex; all
/// operations finish in constant or output-sized time.
#[derive(Debug)]
pub(crate) struct Digest {
    range: DynamicRange,
    unit_magnitude: u32,
    sub_bucket_count: u64,
    sub_bucket_half_count: u64,
    sub_bucket_mask: u64,
    sub_bucket_count_magnitude: u32,
    counts: Vec<u64>,
    count: u64,
    sum: u64,
    min: u64,
    max: u64,
    clamped: u64,
}

impl Digest {
    pub(crate) fn new(range: DynamicRange) -> Digest {
        let unit_magnitude = 63 - range.lowest.leading_zeros();
        let largest_single_unit_resolution = 2 * 10u64.pow(range.significant_digits as u32);
        let sub_bucket_count = largest_single_unit_resolution.next_power_of_two();
        let sub_bucket_count_magnitude = sub_bucket_count.trailing_zeros();
        let sub_bucket_half_count = sub_bucket_count / 2;
        let sub_bucket_mask = (sub_bucket_count - 1) << unit_magnitude;

        // u128 so extreme lowest/highest combinations cannot overflow the
        // shift while sizing the bucket array.
        let mut smallest_untrackable = (sub_bucket_count as u128) << unit_magnitude;
        let mut bucket_count = 1usize;
        while smallest_untrackable <= range.highest as u128 {
            smallest_untrackable <<= 1;
            bucket_count += 1;
        }

        Digest {
            range,
            unit_magnitude,
            sub_bucket_count,
            sub_bucket_half_count,
            sub_bucket_mask,
            sub_bucket_count_magnitude,
            counts: vec![0; (bucket_count + 1) * sub_bucket_half_count as usize],
            count: 0,
            sum: 0,
            min: u64::MAX,
            max: 0,
            clamped: 0,
        }
    }

    pub(crate) fn record(&mut self, value: u64) {
        self.record_times(value, 1);
    }

    pub(crate) fn record_times(&mut self, value: u64, times: u64) {
        if times == 0 {
            return;
        }
        let mut value = value;
        if value > self.range.highest {
            self.clamped += times;
            value = self.range.highest;
        } else if value != 0 && value < self.range.lowest {
            value = self.range.lowest;
        }

        let index = self.counts_index(value);
        self.counts[index] += times;
        self.count += times;
        self.sum += value * times;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    pub(crate) fn snapshot(&mut self, reset: bool) -> Distribution {
        let mut buckets = Vec::new();
        for (index, &count) in self.counts.iter().enumerate() {
            if count != 0 {
                buckets.push(DistributionBucket {
                    value: self.value_at(index).min(self.range.highest),
                    count,
                });
            }
        }
        let distribution = Distribution {
            count: self.count,
            min: if self.count == 0 { 0 } else { self.min },
            max: self.max,
            sum: self.sum,
            clamped: self.clamped,
            buckets,
        };
        if reset {
            self.counts.iter_mut().for_each(|c| *c = 0);
            self.count = 0;
            self.sum = 0;
            self.min = u64::MAX;
            self.max = 0;
            self.clamped = 0;
        }
        distribution
    }

    fn counts_index(&self, value: u64) -> usize {
        let bucket_index = (64 - (value | self.sub_bucket_mask).leading_zeros())
            - (self.unit_magnitude + self.sub_bucket_count_magnitude);
        let sub_bucket_index = value >> (bucket_index + self.unit_magnitude);
        ((bucket_index as u64 + 1) * self.sub_bucket_half_count + sub_bucket_index
            - self.sub_bucket_half_count) as usize
    }

    /// Highest value equivalent to every recording counted at `index`.
    fn value_at(&self, index: usize) -> u64 {
        let index = index as u64;
        let (bucket_index, sub_bucket_index) = if index < self.sub_bucket_count {
            (0, index)
        } else {
            (
                index / self.sub_bucket_half_count - 1,
                index % self.sub_bucket_half_count + self.sub_bucket_half_count,
            )
        };
        let shift = bucket_index as u32 + self.unit_magnitude;
        let lowest_equivalent = sub_bucket_index << shift;
        lowest_equivalent + ((1u64 << shift) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> DynamicRange {
        DynamicRange::new(1, 1_000_000_000, 2)
    }

    #[test]
    fn exact_values_at_low_magnitudes() {
        let mut digest = Digest::new(range());
        for value in [0u64, 1, 2, 17, 100, 199] {
            digest.record(value);
        }
        let distribution = digest.snapshot(false);
        assert_eq!(distribution.count, 6);
        assert_eq!(distribution.min, 0);
        assert_eq!(distribution.max, 199);
        assert_eq!(distribution.sum, 319);
        // Below sub_bucket_count every value maps to its own bucket.
        let values: Vec<u64> = distribution.buckets.iter().map(|b| b.value).collect();
        assert_eq!(values, vec![0, 1, 2, 17, 100, 199]);
    }

    #[test]
    fn precision_holds_across_magnitudes() {
        let mut digest = Digest::new(range());
        for value in [1_000u64, 10_000, 100_000, 1_000_000, 99_000_000] {
            digest.record(value);
            let distribution = digest.snapshot(true);
            let seen = distribution.buckets[0].value;
            let error = seen.abs_diff(value) as f64 / value as f64;
            assert!(error < 0.01, "value {value} landed at {seen}");
        }
    }

    #[test]
    fn values_above_highest_are_clamped_and_counted() {
        let mut digest = Digest::new(DynamicRange::new(1, 1_000, 2));
        digest.record(5_000_000);
        digest.record(10);
        let distribution = digest.snapshot(false);
        assert_eq!(distribution.clamped, 1);
        assert_eq!(distribution.max, 1_000);
        assert_eq!(distribution.count, 2);
    }

    #[test]
    fn values_below_lowest_are_raised_and_zero_stays_zero() {
        let mut digest = Digest::new(DynamicRange::new(100, 1_000_000, 2));
        digest.record(3);
        digest.record(0);
        let distribution = digest.snapshot(false);
        assert_eq!(distribution.min, 0);
        assert_eq!(distribution.buckets.len(), 2);
        // The zero recording stays in a bucket below the discernible range.
        assert!(distribution.buckets[0].value < 100);
        assert!(distribution.buckets[1].value >= 100);
    }

    #[test]
    fn snapshot_with_reset_clears_the_digest() {
        let mut digest = Digest::new(range());
        digest.record_times(42, 10);
        assert_eq!(digest.snapshot(true).count, 10);
        assert!(digest.snapshot(false).is_empty());
    }

    #[test]
    fn percentiles_are_accurate_to_the_configured_digits() {
        let mut digest = Digest::new(range());
        for value in 1..=10_000u64 {
            digest.record(value);
        }
        let distribution = digest.snapshot(false);
        for (percentile, expected) in [(50.0, 5_000u64), (90.0, 9_000), (99.0, 9_900), (100.0, 10_000)] {
            let seen = distribution.percentile(percentile);
            let error = seen.abs_diff(expected) as f64 / expected as f64;
            assert!(error < 0.01, "p{percentile} was {seen}, expected ~{expected}");
        }
    }

    #[test]
    fn empty_distribution_percentile_is_zero() {
        let mut digest = Digest::new(range());
        assert_eq!(digest.snapshot(false).percentile(99.0), 0);
    }
}
