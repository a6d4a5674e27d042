//! # Metrics
//!
//! Applications record measurements through instruments (counters, gauges,
//! histograms, timers and range samplers) obtained from a
//! [`MetricRegistry`]. Metrics are identified by name; instruments within a
//! metric are identified by [`TagSet`](crate::tag::TagSet). Reporters pull
//! registry-wide [`PeriodSnapshot`]s on their own cadence.

mod digest;
mod instruments;
mod range_sampler;
mod registry;

pub use digest::{Distribution, DistributionBucket, DynamicRange};
pub use instruments::{Counter, Gauge, Histogram, Instrument, StartedTimer, Timer};
pub use range_sampler::{RangeSampler, RangeSnapshot};
pub use registry::{
    FactorySettings, InstrumentSnapshot, KindDefaults, Metric, MetricOverrides, MetricRegistry,
    MetricSettings, MetricSnapshot, PeriodSnapshot, RegistrySettings,
};
