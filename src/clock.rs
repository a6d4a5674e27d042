//! Monotonic + wall-clock pair used for all span and snapshot timestamps.
//!
//! Wall-clock readings derive from a monotonic elapsed measurement against an
//! anchor taken at construction, so intervals computed between two readings
//! from the same [`Clock`] never run backwards. A skew adjustment re-bases the
//! derived reading whenever it drifts too far from the operating system's own
//! wall clock (NTP steps, suspend/resume).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Maximum tolerated distance between the derived and the direct wall reading
/// before the skew adjustment is re-based.
const MAX_DRIFT: Duration = Duration::from_millis(100);

/// A shareable clock producing skew-corrected wall-clock instants.
///
/// Cloning is cheap; all clones share the same anchor and adjustment.
#[derive(Clone, Debug)]
pub struct Clock {
    inner: Arc<ClockInner>,
}

#[derive(Debug)]
struct ClockInner {
    base_instant: Instant,
    base_wall: SystemTime,
    skew_nanos: AtomicI64,
}

impl Clock {
    /// Creates a clock anchored at the current instant.
    pub fn new() -> Clock {
        Clock {
            inner: Arc::new(ClockInner {
                base_instant: Instant::now(),
                base_wall: SystemTime::now(),
                skew_nanos: AtomicI64::new(0),
            }),
        }
    }

    /// Returns a raw monotonic reading, for elapsed-time measurements.
    pub fn instant(&self) -> Instant {
        Instant::now()
    }

    /// Returns the current wall-clock time derived from the monotonic source.
    ///
    /// Successive calls on the same clock are non-decreasing up to the skew
    /// adjustment, which only moves when the derived reading has drifted more
    /// than 100ms away from the operating system clock.
    pub fn now(&self) -> SystemTime {
        let elapsed = self.inner.base_instant.elapsed();
        let skew = self.inner.skew_nanos.load(Ordering::Relaxed);
        let derived = shift(self.inner.base_wall + elapsed, skew);

        let direct = SystemTime::now();
        let drift = signed_distance_nanos(direct, derived);
        if drift.unsigned_abs() > MAX_DRIFT.as_nanos() as u64 {
            self.inner
                .skew_nanos
                .store(skew.saturating_add(drift), Ordering::Relaxed);
            return direct;
        }
        derived
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

fn shift(time: SystemTime, nanos: i64) -> SystemTime {
    if nanos >= 0 {
        time + Duration::from_nanos(nanos as u64)
    } else {
        time - Duration::from_nanos(nanos.unsigned_abs())
    }
}

/// Nanoseconds from `b` to `a`, saturating at the i64 range.
fn signed_distance_nanos(a: SystemTime, b: SystemTime) -> i64 {
    match a.duration_since(b) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => i64::try_from(e.duration().as_nanos())
            .map(|n| -n)
            .unwrap_or(i64::MIN),
    }
}
