//! Metric registry: name-indexed registration, periodic snapshots and
//! auto-update scheduling.
//!
//! Registration is idempotent and keyed by name: the first call publishes the
//! metric and freezes its settings, later calls get the same metric back.
//! Requesting an existing name with a different instrument kind is a fatal
//! configuration error; differing optional settings are ignored with a
//! warning.
//!
//! A single mutex serializes registration and snapshotting. Measurement hot
//! paths never touch it: instruments are handed out as `Arc`s and record
//! through their own cells.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::digest::{Distribution, DynamicRange};
use crate::metrics::instruments::{Counter, Gauge, Histogram, Instrument, Timer};
use crate::metrics::range_sampler::{RangeSampler, RangeSnapshot};
use crate::scheduler::{ScheduleHandle, Scheduler};
use crate::tag::TagSet;
use crate::vantage_warn;

/// The frozen settings of a published metric.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSettings {
    /// Human-readable description.
    pub description: String,
    /// Measurement unit, e.g. `"ns"` or `"bytes"`.
    pub unit: Option<String>,
    /// Interval at which auto-updated instruments are refreshed or sampled.
    pub auto_update_interval: Option<Duration>,
    /// Trackable range for digest-backed instruments.
    pub dynamic_range: DynamicRange,
}

impl Default for MetricSettings {
    fn default() -> Self {
        MetricSettings {
            description: String::new(),
            unit: None,
            auto_update_interval: None,
            dynamic_range: DynamicRange::default(),
        }
    }
}

/// Optional settings passed at registration time. Only provided fields
/// participate in the effective-settings resolution; for an already-published
/// metric they are compared against the frozen settings and ignored with a
/// warning when they differ.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricOverrides {
    /// Overrides the description.
    pub description: Option<String>,
    /// Overrides the unit.
    pub unit: Option<String>,
    /// Overrides the auto-update interval.
    pub auto_update_interval: Option<Duration>,
    /// Overrides the dynamic range.
    pub dynamic_range: Option<DynamicRange>,
}

impl MetricOverrides {
    /// Sets the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the unit.
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Sets the auto-update interval.
    pub fn auto_update_interval(mut self, interval: Duration) -> Self {
        self.auto_update_interval = Some(interval);
        self
    }

    /// Sets the dynamic range.
    pub fn dynamic_range(mut self, range: DynamicRange) -> Self {
        self.dynamic_range = Some(range);
        self
    }

    fn is_empty(&self) -> bool {
        *self == MetricOverrides::default()
    }

    fn conflicts_with(&self, frozen: &MetricSettings) -> bool {
        self.description
            .as_ref()
            .map(|d| *d != frozen.description)
            .unwrap_or(false)
            || self.unit.as_ref().map(|u| frozen.unit.as_ref() != Some(u)).unwrap_or(false)
            || self
                .auto_update_interval
                .map(|i| frozen.auto_update_interval != Some(i))
                .unwrap_or(false)
            || self
                .dynamic_range
                .map(|r| frozen.dynamic_range != r)
                .unwrap_or(false)
    }

    fn apply(&self, settings: &mut MetricSettings) {
        if let Some(description) = &self.description {
            settings.description = description.clone();
        }
        if let Some(unit) = &self.unit {
            settings.unit = Some(unit.clone());
        }
        if let Some(interval) = self.auto_update_interval {
            settings.auto_update_interval = Some(interval);
        }
        if let Some(range) = self.dynamic_range {
            settings.dynamic_range = range;
        }
    }
}

/// Per-kind defaults from `metric.factory.default-settings`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KindDefaults {
    /// Default auto-update interval for instruments of the kind.
    pub auto_update_interval: Option<Duration>,
    /// Default dynamic range for instruments of the kind.
    pub dynamic_range: Option<DynamicRange>,
}

/// Settings feeding the effective-settings resolution for new metrics.
/// Precedence, highest first: per-name custom settings, programmatic
/// arguments, per-kind defaults.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FactorySettings {
    /// Defaults for counters.
    pub counter: KindDefaults,
    /// Defaults for gauges.
    pub gauge: KindDefaults,
    /// Defaults for histograms.
    pub histogram: KindDefaults,
    /// Defaults for timers.
    pub timer: KindDefaults,
    /// Defaults for range samplers.
    pub range_sampler: KindDefaults,
    /// Per-metric-name overrides, applied above everything else.
    pub custom: HashMap<String, MetricOverrides>,
}

impl FactorySettings {
    /// Reads `metric.factory.*` from a root-scoped configuration tree.
    pub fn from_config(config: &Config) -> FactorySettings {
        let defaults = config.section("metric.factory.default-settings");
        let mut custom = HashMap::new();
        for name in config.keys("metric.factory.custom-settings") {
            let section = config.section(&format!(
                "metric.factory.custom-settings.\"{name}\""
            ));
            custom.insert(name, overrides_from(&section));
        }
        FactorySettings {
            counter: kind_defaults_from(&defaults.section("counter")),
            gauge: kind_defaults_from(&defaults.section("gauge")),
            histogram: kind_defaults_from(&defaults.section("histogram")),
            timer: kind_defaults_from(&defaults.section("timer")),
            range_sampler: kind_defaults_from(&defaults.section("range-sampler")),
            custom,
        }
    }

    fn defaults_for(&self, kind: &str) -> &KindDefaults {
        match kind {
            "counter" => &self.counter,
            "gauge" => &self.gauge,
            "timer" => &self.timer,
            "range-sampler" => &self.range_sampler,
            _ => &self.histogram,
        }
    }
}

fn kind_defaults_from(section: &Config) -> KindDefaults {
    KindDefaults {
        auto_update_interval: section.duration("auto-update-interval"),
        dynamic_range: range_from(section, DynamicRange::default()),
    }
}

fn overrides_from(section: &Config) -> MetricOverrides {
    MetricOverrides {
        description: section.string("description"),
        unit: section.string("unit"),
        auto_update_interval: section.duration("auto-update-interval"),
        dynamic_range: range_from(section, DynamicRange::default()),
    }
}

fn range_from(section: &Config, base: DynamicRange) -> Option<DynamicRange> {
    let lowest = section.i64("lowest-discernible-value");
    let highest = section.i64("highest-trackable-value");
    let digits = section.i64("significant-value-digits");
    if lowest.is_none() && highest.is_none() && digits.is_none() {
        return None;
    }
    Some(DynamicRange::new(
        lowest.map(|v| v.max(1) as u64).unwrap_or(base.lowest),
        highest.map(|v| v.max(1) as u64).unwrap_or(base.highest),
        digits.map(|v| v as u8).unwrap_or(base.significant_digits),
    ))
}

/// Registry-level settings, read by external reporters to pace their pulls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Suggested period between reporter snapshots.
    pub tick_interval: Duration,
    /// Whether reporter ticks should align to round wall-clock multiples of
    /// the tick interval.
    pub optimistic_tick_alignment: bool,
    /// Worker threads for the instrument refresh scheduler.
    pub refresh_scheduler_pool_size: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        RegistrySettings {
            tick_interval: Duration::from_secs(60),
            optimistic_tick_alignment: false,
            refresh_scheduler_pool_size: 2,
        }
    }
}

impl RegistrySettings {
    /// Reads `metric.*` from a root-scoped configuration tree.
    pub fn from_config(config: &Config) -> RegistrySettings {
        let defaults = RegistrySettings::default();
        RegistrySettings {
            tick_interval: config
                .duration("metric.tick-interval")
                .unwrap_or(defaults.tick_interval),
            optimistic_tick_alignment: config
                .bool("metric.optimistic-tick-alignment")
                .unwrap_or(defaults.optimistic_tick_alignment),
            refresh_scheduler_pool_size: config
                .i64("metric.refresh-scheduler-pool-size")
                .map(|v| v.max(1) as usize)
                .unwrap_or(defaults.refresh_scheduler_pool_size),
        }
    }

    /// Delay until the next tick. With alignment enabled the returned delay
    /// lands ticks on round wall-clock multiples of the interval.
    pub fn initial_delay(&self, now: SystemTime) -> Duration {
        if !self.optimistic_tick_alignment {
            return self.tick_interval;
        }
        let interval_millis = self.tick_interval.as_millis().max(1);
        let epoch_millis = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let into_period = epoch_millis % interval_millis;
        Duration::from_millis((interval_millis - into_period) as u64)
    }
}

/// One instrument's value within a metric snapshot.
#[derive(Clone, Debug)]
pub struct InstrumentSnapshot<T> {
    /// The tag set the instrument was created with.
    pub tags: TagSet,
    /// The instrument's value for the period.
    pub value: T,
}

/// One metric's instruments, snapshotted.
#[derive(Clone, Debug)]
pub struct MetricSnapshot<T> {
    /// Metric name.
    pub name: String,
    /// Metric description.
    pub description: String,
    /// Measurement unit.
    pub unit: Option<String>,
    /// Per-tag-set values.
    pub instruments: Vec<InstrumentSnapshot<T>>,
}

/// A registry-wide dump of all metric values for one period. The `from` of
/// each snapshot equals the `to` of the previous one; the first period starts
/// at the registry's creation instant.
#[derive(Clone, Debug)]
pub struct PeriodSnapshot {
    /// Period start.
    pub from: SystemTime,
    /// Period end.
    pub to: SystemTime,
    /// Counter values.
    pub counters: Vec<MetricSnapshot<u64>>,
    /// Gauge values.
    pub gauges: Vec<MetricSnapshot<f64>>,
    /// Histogram distributions.
    pub histograms: Vec<MetricSnapshot<Distribution>>,
    /// Timer distributions.
    pub timers: Vec<MetricSnapshot<Distribution>>,
    /// Range-sampler snapshots.
    pub range_samplers: Vec<MetricSnapshot<RangeSnapshot>>,
}

/// A named metric holding one instrument per tag set.
pub struct Metric<I: Instrument> {
    core: Arc<MetricCore<I>>,
}

impl<I: Instrument> Clone for Metric<I> {
    fn clone(&self) -> Self {
        Metric {
            core: self.core.clone(),
        }
    }
}

struct MetricCore<I: Instrument> {
    name: String,
    settings: MetricSettings,
    instruments: RwLock<HashMap<TagSet, Arc<I>>>,
    scheduler: Arc<dyn Scheduler>,
    tasks: Mutex<Vec<ScheduleHandle>>,
}

impl<I: Instrument> Metric<I> {
    fn new(name: String, settings: MetricSettings, scheduler: Arc<dyn Scheduler>) -> Metric<I> {
        Metric {
            core: Arc::new(MetricCore {
                name,
                settings,
                instruments: RwLock::new(HashMap::new()),
                scheduler,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The metric name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The frozen settings.
    pub fn settings(&self) -> &MetricSettings {
        &self.core.settings
    }

    /// Returns the instrument for the given tag set, creating it on first
    /// use. Repeated calls with an equal tag set return the same instrument.
    pub fn with_tags(&self, tags: TagSet) -> Arc<I> {
        if let Ok(instruments) = self.core.instruments.read() {
            if let Some(instrument) = instruments.get(&tags) {
                return instrument.clone();
            }
        }

        let mut instruments = self
            .core
            .instruments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(instrument) = instruments.get(&tags) {
            return instrument.clone();
        }
        let instrument = Arc::new(I::create(&self.core.settings));
        instruments.insert(tags, instrument.clone());
        drop(instruments);

        if I::SELF_REFRESHING {
            if let Some(interval) = self.core.settings.auto_update_interval {
                let target = instrument.clone();
                let handle = self
                    .core
                    .scheduler
                    .schedule(interval, Box::new(move || target.refresh()));
                self.lock_tasks().push(handle);
            }
        }
        instrument
    }

    /// The instrument with no tags.
    pub fn without_tags(&self) -> Arc<I> {
        self.with_tags(TagSet::empty())
    }

    /// Schedules `update` to run against the untagged instrument at the
    /// metric's auto-update interval.
    pub fn auto_update(
        &self,
        update: impl Fn(&I) + Send + Sync + 'static,
    ) -> ScheduleHandle {
        let Some(interval) = self.core.settings.auto_update_interval else {
            vantage_warn!(
                name: "Metric.AutoUpdateWithoutInterval",
                metric = self.core.name.as_str()
            );
            return ScheduleHandle::dead();
        };
        let instrument = self.without_tags();
        let handle = self
            .core
            .scheduler
            .schedule(interval, Box::new(move || update(&instrument)));
        self.lock_tasks().push(handle.clone());
        handle
    }

    fn snapshot_instruments(&self, reset: bool) -> MetricSnapshot<I::Snapshot> {
        let instruments = self
            .core
            .instruments
            .read()
            .map(|cells| {
                cells
                    .iter()
                    .map(|(tags, instrument)| InstrumentSnapshot {
                        tags: tags.clone(),
                        value: instrument.snapshot(reset),
                    })
                    .collect()
            })
            .unwrap_or_default();
        MetricSnapshot {
            name: self.core.name.clone(),
            description: self.core.settings.description.clone(),
            unit: self.core.settings.unit.clone(),
            instruments,
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<ScheduleHandle>> {
        self.core.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<I: Instrument> Drop for MetricCore<I> {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            task.cancel();
        }
    }
}

impl<I: Instrument> std::fmt::Debug for Metric<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metric")
            .field("name", &self.core.name)
            .field("kind", &I::KIND)
            .finish_non_exhaustive()
    }
}

enum MetricEntry {
    Counter(Metric<Counter>),
    Gauge(Metric<Gauge>),
    Histogram(Metric<Histogram>),
    Timer(Metric<Timer>),
    RangeSampler(Metric<RangeSampler>),
}

impl MetricEntry {
    fn kind(&self) -> &'static str {
        match self {
            MetricEntry::Counter(_) => Counter::KIND,
            MetricEntry::Gauge(_) => Gauge::KIND,
            MetricEntry::Histogram(_) => Histogram::KIND,
            MetricEntry::Timer(_) => Timer::KIND,
            MetricEntry::RangeSampler(_) => RangeSampler::KIND,
        }
    }
}

struct RegistryState {
    metrics: HashMap<String, MetricEntry>,
    factory: FactorySettings,
    settings: RegistrySettings,
    since: SystemTime,
}

/// Name-indexed metric registration and snapshotting.
pub struct MetricRegistry {
    clock: Clock,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<RegistryState>,
}

impl MetricRegistry {
    /// Creates a registry. `scheduler` runs instrument refreshes and
    /// user-registered auto-update callbacks.
    pub fn new(
        clock: Clock,
        scheduler: Arc<dyn Scheduler>,
        factory: FactorySettings,
        settings: RegistrySettings,
    ) -> MetricRegistry {
        let since = clock.now();
        MetricRegistry {
            clock,
            scheduler,
            state: Mutex::new(RegistryState {
                metrics: HashMap::new(),
                factory,
                settings,
                since,
            }),
        }
    }

    /// Looks up or registers a counter.
    pub fn counter(&self, name: &str) -> Result<Metric<Counter>> {
        self.counter_with(name, MetricOverrides::default())
    }

    /// Looks up or registers a counter with explicit settings.
    pub fn counter_with(&self, name: &str, overrides: MetricOverrides) -> Result<Metric<Counter>> {
        self.register(name, overrides, MetricEntry::Counter, |entry| match entry {
            MetricEntry::Counter(metric) => Some(metric.clone()),
            _ => None,
        })
    }

    /// Looks up or registers a gauge.
    pub fn gauge(&self, name: &str) -> Result<Metric<Gauge>> {
        self.gauge_with(name, MetricOverrides::default())
    }

    /// Looks up or registers a gauge with explicit settings.
    pub fn gauge_with(&self, name: &str, overrides: MetricOverrides) -> Result<Metric<Gauge>> {
        self.register(name, overrides, MetricEntry::Gauge, |entry| match entry {
            MetricEntry::Gauge(metric) => Some(metric.clone()),
            _ => None,
        })
    }

    /// Looks up or registers a histogram.
    pub fn histogram(&self, name: &str) -> Result<Metric<Histogram>> {
        self.histogram_with(name, MetricOverrides::default())
    }

    /// Looks up or registers a histogram with explicit settings.
    pub fn histogram_with(
        &self,
        name: &str,
        overrides: MetricOverrides,
    ) -> Result<Metric<Histogram>> {
        self.register(name, overrides, MetricEntry::Histogram, |entry| match entry {
            MetricEntry::Histogram(metric) => Some(metric.clone()),
            _ => None,
        })
    }

    /// Looks up or registers a timer. Timers measure in nanoseconds.
    pub fn timer(&self, name: &str) -> Result<Metric<Timer>> {
        self.timer_with(name, MetricOverrides::default())
    }

    /// Looks up or registers a timer with explicit settings.
    pub fn timer_with(&self, name: &str, overrides: MetricOverrides) -> Result<Metric<Timer>> {
        self.register(name, overrides, MetricEntry::Timer, |entry| match entry {
            MetricEntry::Timer(metric) => Some(metric.clone()),
            _ => None,
        })
    }

    /// Looks up or registers a range sampler.
    pub fn range_sampler(&self, name: &str) -> Result<Metric<RangeSampler>> {
        self.range_sampler_with(name, MetricOverrides::default())
    }

    /// Looks up or registers a range sampler with explicit settings.
    pub fn range_sampler_with(
        &self,
        name: &str,
        overrides: MetricOverrides,
    ) -> Result<Metric<RangeSampler>> {
        self.register(name, overrides, MetricEntry::RangeSampler, |entry| {
            match entry {
                MetricEntry::RangeSampler(metric) => Some(metric.clone()),
                _ => None,
            }
        })
    }

    fn register<I: Instrument>(
        &self,
        name: &str,
        overrides: MetricOverrides,
        wrap: fn(Metric<I>) -> MetricEntry,
        unwrap: fn(&MetricEntry) -> Option<Metric<I>>,
    ) -> Result<Metric<I>> {
        let mut state = self.lock_state();

        if let Some(entry) = state.metrics.get(name) {
            return match unwrap(entry) {
                Some(metric) => {
                    if !overrides.is_empty() && overrides.conflicts_with(metric.settings()) {
                        vantage_warn!(
                            name: "MetricRegistry.SettingsConflict",
                            metric = name,
                            message = "metric is already registered, the new settings are ignored"
                        );
                    }
                    Ok(metric)
                }
                None => Err(Error::MetricKindMismatch {
                    name: name.to_owned(),
                    existing: entry.kind(),
                    requested: I::KIND,
                }),
            };
        }

        let mut settings = MetricSettings {
            auto_update_interval: state.factory.defaults_for(I::KIND).auto_update_interval,
            dynamic_range: state
                .factory
                .defaults_for(I::KIND)
                .dynamic_range
                .unwrap_or_default(),
            ..MetricSettings::default()
        };
        overrides.apply(&mut settings);
        if let Some(custom) = state.factory.custom.get(name) {
            custom.apply(&mut settings);
        }
        if I::KIND == Timer::KIND && settings.unit.is_none() {
            settings.unit = Some("ns".to_owned());
        }

        let metric = Metric::new(name.to_owned(), settings, self.scheduler.clone());
        state.metrics.insert(name.to_owned(), wrap(metric.clone()));
        Ok(metric)
    }

    /// Takes a registry-wide snapshot. Passing `reset = true` closes the
    /// current period: accumulating instruments restart from zero and the
    /// next snapshot's `from` equals this one's `to`. Passing `false` peeks
    /// without advancing the period.
    pub fn snapshot(&self, reset: bool) -> PeriodSnapshot {
        let mut state = self.lock_state();
        let to = self.clock.now().max(state.since);
        let from = state.since;
        if reset {
            state.since = to;
        }

        let mut snapshot = PeriodSnapshot {
            from,
            to,
            counters: Vec::new(),
            gauges: Vec::new(),
            histograms: Vec::new(),
            timers: Vec::new(),
            range_samplers: Vec::new(),
        };
        for entry in state.metrics.values() {
            match entry {
                MetricEntry::Counter(metric) => {
                    snapshot.counters.push(metric.snapshot_instruments(reset))
                }
                MetricEntry::Gauge(metric) => {
                    snapshot.gauges.push(metric.snapshot_instruments(reset))
                }
                MetricEntry::Histogram(metric) => {
                    snapshot.histograms.push(metric.snapshot_instruments(reset))
                }
                MetricEntry::Timer(metric) => {
                    snapshot.timers.push(metric.snapshot_instruments(reset))
                }
                MetricEntry::RangeSampler(metric) => snapshot
                    .range_samplers
                    .push(metric.snapshot_instruments(reset)),
            }
        }
        snapshot.counters.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot.gauges.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot.histograms.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot.timers.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot.range_samplers.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }

    /// Registry-level settings for reporter pacing.
    pub fn settings(&self) -> RegistrySettings {
        self.lock_state().settings.clone()
    }

    /// Applies new factory and registry settings. Settings of already
    /// published metrics stay frozen.
    pub fn reconfigure(&self, factory: FactorySettings, settings: RegistrySettings) {
        let mut state = self.lock_state();
        state.factory = factory;
        state.settings = settings;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ThreadPoolScheduler;

    fn registry() -> MetricRegistry {
        MetricRegistry::new(
            Clock::new(),
            Arc::new(ThreadPoolScheduler::new(1)),
            FactorySettings::default(),
            RegistrySettings::default(),
        )
    }

    #[test]
    fn registration_is_idempotent_per_name() {
        let registry = registry();
        let first = registry.counter("requests").unwrap();
        let second = registry.counter("requests").unwrap();
        first.without_tags().increment_by(3);
        assert_eq!(second.without_tags().snapshot(false), 3);
    }

    #[test]
    fn later_settings_are_ignored_with_the_originals_retained() {
        let registry = registry();
        let original = registry
            .histogram_with(
                "lat",
                MetricOverrides::default()
                    .dynamic_range(DynamicRange::new(1, 1_000_000_000, 2)),
            )
            .unwrap();
        let again = registry
            .histogram_with(
                "lat",
                MetricOverrides::default().dynamic_range(DynamicRange::new(1, 1_000_000, 3)),
            )
            .unwrap();
        assert_eq!(
            again.settings().dynamic_range,
            DynamicRange::new(1, 1_000_000_000, 2)
        );
        assert_eq!(original.settings(), again.settings());
    }

    #[test]
    fn a_kind_conflict_is_fatal() {
        let registry = registry();
        registry
            .histogram_with(
                "lat",
                MetricOverrides::default()
                    .dynamic_range(DynamicRange::new(1, 1_000_000_000, 2)),
            )
            .unwrap();
        let err = registry.counter("lat").unwrap_err();
        match err {
            Error::MetricKindMismatch {
                name,
                existing,
                requested,
            } => {
                assert_eq!(name, "lat");
                assert_eq!(existing, "histogram");
                assert_eq!(requested, "counter");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn instruments_are_shared_per_tag_set() {
        let registry = registry();
        let metric = registry.counter("requests").unwrap();
        let tagged = metric.with_tags(TagSet::of("endpoint", "/users"));
        let same = metric.with_tags(TagSet::of("endpoint", "/users"));
        let other = metric.with_tags(TagSet::of("endpoint", "/orders"));

        tagged.increment();
        same.increment();
        other.increment();

        let snapshot = metric.snapshot_instruments(false);
        let mut values: Vec<u64> = snapshot.instruments.iter().map(|i| i.value).collect();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn periods_tile_exactly() {
        let registry = registry();
        registry.counter("requests").unwrap();

        let first = registry.snapshot(true);
        let second = registry.snapshot(true);
        let third = registry.snapshot(true);
        assert_eq!(second.from, first.to);
        assert_eq!(third.from, second.to);
        assert!(first.to >= first.from);
        assert!(second.to >= second.from);
    }

    #[test]
    fn snapshot_without_reset_does_not_advance_the_period() {
        let registry = registry();
        let counter = registry.counter("requests").unwrap();
        counter.without_tags().increment_by(10);

        let peek = registry.snapshot(false);
        assert_eq!(peek.counters[0].instruments[0].value, 10);
        let real = registry.snapshot(true);
        assert_eq!(real.from, peek.from);
        assert_eq!(real.counters[0].instruments[0].value, 10);
        assert_eq!(registry.snapshot(true).counters[0].instruments[0].value, 0);
    }

    #[test]
    fn timers_default_to_nanoseconds() {
        let registry = registry();
        let timer = registry.timer("span.processing-time").unwrap();
        assert_eq!(timer.settings().unit.as_deref(), Some("ns"));
    }

    #[test]
    fn custom_settings_win_over_programmatic_arguments() {
        let config = crate::config::Config::from_yaml(
            r#"
metric:
  factory:
    custom-settings:
      "queue.depth":
        unit: items
"#,
        )
        .unwrap();
        let registry = MetricRegistry::new(
            Clock::new(),
            Arc::new(ThreadPoolScheduler::new(1)),
            FactorySettings::from_config(&config),
            RegistrySettings::default(),
        );
        let metric = registry
            .gauge_with("queue.depth", MetricOverrides::default().unit("entries"))
            .unwrap();
        assert_eq!(metric.settings().unit.as_deref(), Some("items"));
    }

    #[test]
    fn tick_alignment_lands_on_round_multiples() {
        let settings = RegistrySettings {
            tick_interval: Duration::from_secs(60),
            optimistic_tick_alignment: true,
            refresh_scheduler_pool_size: 1,
        };
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(90);
        assert_eq!(settings.initial_delay(now), Duration::from_secs(30));

        let unaligned = RegistrySettings {
            optimistic_tick_alignment: false,
            ..settings
        };
        assert_eq!(unaligned.initial_delay(now), Duration::from_secs(60));
    }
}
