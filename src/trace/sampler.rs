//! Sampling strategies.
//!
//! A [`Sampler`] decides the fate of new trace roots at span-build time.
//! Non-root spans inherit their parent's decision; an `Unknown` decision
//! propagated from a remote parent triggers local re-sampling.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use rand::{rngs, Rng, SeedableRng};
use regex::Regex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::trace::tracer::SpanBuilder;
use crate::trace::SamplingDecision;
use crate::vantage_error;

thread_local! {
    static DECISION_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

/// Decides whether a new trace root should be sampled.
///
/// `decide` runs on the span-build hot path and must not block on locks held
/// by reconfiguration or snapshotting. It is called exactly once per new
/// trace root; implementations return only [`SamplingDecision::Sample`] or
/// [`SamplingDecision::DoNotSample`].
pub trait Sampler: Send + Sync {
    /// Decides for the span being built.
    fn decide(&self, builder: &SpanBuilder) -> SamplingDecision;
}

/// Shared handle to a sampler.
pub type SamplerRef = Arc<dyn Sampler>;

/// Calls `decide` with a panic guard: a sampler failure must never take the
/// span-build path down, so unexpected panics degrade to `DoNotSample`.
pub(crate) fn safe_decide(sampler: &dyn Sampler, builder: &SpanBuilder) -> SamplingDecision {
    match catch_unwind(AssertUnwindSafe(|| sampler.decide(builder))) {
        Ok(decision) => decision,
        Err(_) => {
            vantage_error!(
                name: "Sampler.DecidePanicked",
                operation = builder.operation_name()
            );
            SamplingDecision::DoNotSample
        }
    }
}

/// Samples everything or nothing.
#[derive(Clone, Copy, Debug)]
pub struct ConstantSampler {
    sample: bool,
}

impl ConstantSampler {
    /// Samples every trace.
    pub fn always() -> ConstantSampler {
        ConstantSampler { sample: true }
    }

    /// Samples no trace.
    pub fn never() -> ConstantSampler {
        ConstantSampler { sample: false }
    }
}

impl Sampler for ConstantSampler {
    fn decide(&self, _builder: &SpanBuilder) -> SamplingDecision {
        if self.sample {
            SamplingDecision::Sample
        } else {
            SamplingDecision::DoNotSample
        }
    }
}

/// Samples a configured fraction of traces using a uniform draw from a
/// thread-local random source.
#[derive(Clone, Copy, Debug)]
pub struct RandomSampler {
    probability: f64,
}

impl RandomSampler {
    /// Creates a sampler with the given probability, clamped to `[0, 1]`.
    pub fn new(probability: f64) -> RandomSampler {
        RandomSampler {
            probability: probability.clamp(0.0, 1.0),
        }
    }

    /// The configured probability.
    pub fn probability(&self) -> f64 {
        self.probability
    }
}

impl Sampler for RandomSampler {
    fn decide(&self, _builder: &SpanBuilder) -> SamplingDecision {
        bernoulli(self.probability)
    }
}

/// A Bernoulli draw with strict boundary behavior: probabilities at the
/// bounds short-circuit so 0 never samples and 1 always does.
fn bernoulli(probability: f64) -> SamplingDecision {
    if probability >= 1.0 {
        return SamplingDecision::Sample;
    }
    if probability <= 0.0 {
        return SamplingDecision::DoNotSample;
    }
    let upper_bound = (probability * (1u64 << 63) as f64) as u64;
    let draw = DECISION_RNG.with(|rng| rng.borrow_mut().gen::<u64>()) >> 1;
    if draw < upper_bound {
        SamplingDecision::Sample
    } else {
        SamplingDecision::DoNotSample
    }
}

/// A group of operations with a shared sampling rule, matched by regular
/// expressions on the operation name.
#[derive(Clone, Debug)]
pub struct SamplerGroup {
    /// Group name, for diagnostics.
    pub name: String,
    /// Regular expressions matched against operation names. Patterns are
    /// anchored: the whole name must match.
    pub operations: Vec<String>,
    /// Definitive decision: `Some(true)` always samples matched operations,
    /// `Some(false)` never does. `None` leaves them to the balancer.
    pub sample: Option<bool>,
    /// Minimum sampled throughput (traces per second) the balancer grants
    /// matched operations before distributing the remaining budget.
    pub min_throughput: f64,
    /// Maximum sampled throughput granted to matched operations.
    pub max_throughput: f64,
}

impl Default for SamplerGroup {
    fn default() -> Self {
        SamplerGroup {
            name: String::new(),
            operations: Vec::new(),
            sample: None,
            min_throughput: 0.0,
            max_throughput: f64::INFINITY,
        }
    }
}

struct CompiledGroup {
    sample: Option<bool>,
    min_throughput: f64,
    max_throughput: f64,
    matchers: Vec<Regex>,
}

impl CompiledGroup {
    fn matches(&self, operation: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(operation))
    }
}

struct OperationSampler {
    // f64 bits of the current sampling probability; decisions read this
    // snapshot, the adapt tick writes it.
    probability_bits: AtomicU64,
    fixed: Option<bool>,
    min_throughput: f64,
    max_throughput: f64,
    calls: AtomicU64,
    sampled: AtomicU64,
}

impl OperationSampler {
    fn probability(&self) -> f64 {
        f64::from_bits(self.probability_bits.load(Ordering::Relaxed))
    }

    fn set_probability(&self, probability: f64) {
        self.probability_bits
            .store(probability.to_bits(), Ordering::Relaxed);
    }
}

/// Distributes a global per-second throughput budget across the operation
/// names it observes.
///
/// Decisions are Bernoulli draws against a per-operation probability
/// snapshot, recomputed by [`AdaptiveSampler::adapt`] once per second:
/// definitive group rules win outright, matched operations then receive at
/// least their group minimum and at most their group maximum, and whatever
/// budget remains is split proportionally to unmet demand. The adapt pass
/// takes no lock that `decide` waits on.
#[derive(Clone)]
pub struct AdaptiveSampler {
    inner: Arc<AdaptiveInner>,
}

struct AdaptiveInner {
    throughput: f64,
    groups: Vec<CompiledGroup>,
    operations: RwLock<HashMap<String, Arc<OperationSampler>>>,
}

impl AdaptiveSampler {
    /// Creates a sampler with no groups, distributing `throughput` traces
    /// per second across all observed operations.
    pub fn with_throughput(throughput: f64) -> AdaptiveSampler {
        AdaptiveSampler {
            inner: Arc::new(AdaptiveInner {
                throughput: throughput.max(0.0),
                groups: Vec::new(),
                operations: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Creates a sampler distributing `throughput` traces per second.
    pub fn new(throughput: f64, groups: Vec<SamplerGroup>) -> Result<AdaptiveSampler> {
        let mut compiled = Vec::with_capacity(groups.len());
        for group in groups {
            let mut matchers = Vec::with_capacity(group.operations.len());
            for pattern in &group.operations {
                let matcher = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
                    Error::configuration(
                        format!("trace.adaptive-sampler.groups.{}", group.name),
                        e.to_string(),
                    )
                })?;
                matchers.push(matcher);
            }
            compiled.push(CompiledGroup {
                sample: group.sample,
                min_throughput: group.min_throughput.max(0.0),
                max_throughput: group.max_throughput.max(0.0),
                matchers,
            });
        }
        Ok(AdaptiveSampler {
            inner: Arc::new(AdaptiveInner {
                throughput: throughput.max(0.0),
                groups: compiled,
                operations: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Reads `trace.adaptive-sampler.*` from a root-scoped configuration.
    pub fn from_config(config: &Config) -> Result<AdaptiveSampler> {
        let throughput = config
            .f64("trace.adaptive-sampler.throughput")
            .unwrap_or(600.0);
        let mut groups = Vec::new();
        for name in config.keys("trace.adaptive-sampler.groups") {
            let section = config.section(&format!("trace.adaptive-sampler.groups.\"{name}\""));
            let sample = match section.string("sample").as_deref() {
                Some("always") => Some(true),
                Some("never") => Some(false),
                Some(other) => {
                    return Err(Error::configuration(
                        format!("trace.adaptive-sampler.groups.{name}.sample"),
                        format!("expected \"always\" or \"never\", found {other:?}"),
                    ))
                }
                None => None,
            };
            groups.push(SamplerGroup {
                name,
                operations: section.string_list("operations"),
                sample,
                min_throughput: section.f64("min-throughput").unwrap_or(0.0),
                max_throughput: section.f64("max-throughput").unwrap_or(f64::INFINITY),
            });
        }
        AdaptiveSampler::new(throughput, groups)
    }

    /// Recomputes per-operation probabilities from the calls observed since
    /// the previous pass. Scheduled to run once per second.
    pub fn adapt(&self) {
        let operations: Vec<Arc<OperationSampler>> = match self.inner.operations.read() {
            Ok(operations) => operations.values().cloned().collect(),
            Err(_) => return,
        };

        let mut balanced: Vec<(Arc<OperationSampler>, f64, f64)> = Vec::new();
        for operation in operations {
            let rate = operation.calls.swap(0, Ordering::Relaxed) as f64;
            operation.sampled.swap(0, Ordering::Relaxed);
            if operation.fixed.is_none() {
                balanced.push((operation, rate, 0.0));
            }
        }

        // Grant each operation its group minimum first, bounded by what it
        // actually asked for.
        let mut remaining = self.inner.throughput;
        for (operation, rate, allocation) in balanced.iter_mut() {
            *allocation = rate.min(operation.min_throughput).min(operation.max_throughput);
            remaining -= *allocation;
        }
        remaining = remaining.max(0.0);

        // Split what is left proportionally to unmet demand, capped by each
        // operation's group maximum.
        let total_unmet: f64 = balanced
            .iter()
            .map(|(operation, rate, allocation)| {
                (rate.min(operation.max_throughput) - allocation).max(0.0)
            })
            .sum();
        if total_unmet > 0.0 {
            let factor = (remaining / total_unmet).min(1.0);
            for (operation, rate, allocation) in balanced.iter_mut() {
                let unmet = (rate.min(operation.max_throughput) - *allocation).max(0.0);
                *allocation += unmet * factor;
            }
        }

        for (operation, rate, allocation) in balanced {
            let probability = if rate <= 0.0 {
                1.0
            } else {
                (allocation / rate).clamp(0.0, 1.0)
            };
            operation.set_probability(probability);
        }
    }

    fn operation(&self, name: &str) -> Arc<OperationSampler> {
        if let Ok(operations) = self.inner.operations.read() {
            if let Some(operation) = operations.get(name) {
                return operation.clone();
            }
        }

        let mut operations = self
            .inner
            .operations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(operation) = operations.get(name) {
            return operation.clone();
        }

        let group = self.inner.groups.iter().find(|g| g.matches(name));
        let operation = Arc::new(OperationSampler {
            probability_bits: AtomicU64::new(1.0f64.to_bits()),
            fixed: group.and_then(|g| g.sample),
            min_throughput: group.map(|g| g.min_throughput).unwrap_or(0.0),
            max_throughput: group.map(|g| g.max_throughput).unwrap_or(f64::INFINITY),
            calls: AtomicU64::new(0),
            sampled: AtomicU64::new(0),
        });
        operations.insert(name.to_owned(), operation.clone());
        operation
    }
}

impl Sampler for AdaptiveSampler {
    fn decide(&self, builder: &SpanBuilder) -> SamplingDecision {
        let operation = self.operation(builder.operation_name());
        operation.calls.fetch_add(1, Ordering::Relaxed);

        let decision = match operation.fixed {
            Some(true) => SamplingDecision::Sample,
            Some(false) => SamplingDecision::DoNotSample,
            None => bernoulli(operation.probability()),
        };
        if decision == SamplingDecision::Sample {
            operation.sampled.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }
}

impl std::fmt::Debug for AdaptiveSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveSampler")
            .field("throughput", &self.inner.throughput)
            .field("groups", &self.inner.groups.len())
            .finish()
    }
}

/// Resolves the sampler named in `trace.sampler`. Built-in names are
/// `always`, `never`, `random` and `adaptive`; anything else is looked up in
/// the extension registry. An extension that cannot be instantiated degrades
/// to random sampling at 10% with an error log.
pub(crate) fn sampler_from_config(
    config: &Config,
    extensions: &crate::extension::ExtensionRegistry,
) -> Result<(SamplerRef, Option<AdaptiveSampler>)> {
    let name = config
        .string("trace.sampler")
        .unwrap_or_else(|| "adaptive".to_owned());
    match name.as_str() {
        "always" => Ok((Arc::new(ConstantSampler::always()), None)),
        "never" => Ok((Arc::new(ConstantSampler::never()), None)),
        "random" => {
            let probability = config
                .f64("trace.random-sampler.probability")
                .unwrap_or(0.1);
            Ok((Arc::new(RandomSampler::new(probability)), None))
        }
        "adaptive" => {
            let adaptive = AdaptiveSampler::from_config(config)?;
            Ok((Arc::new(adaptive.clone()), Some(adaptive)))
        }
        other => match extensions.sampler(other, config) {
            Ok(sampler) => Ok((sampler, None)),
            Err(error) => {
                vantage_error!(
                    name: "Tracer.SamplerInstantiationFailed",
                    sampler = other,
                    error = error.to_string(),
                    fallback = "random sampler at 10%"
                );
                Ok((Arc::new(RandomSampler::new(0.1)), None))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::tracer::SpanBuilder;

    fn builder(operation: &str) -> SpanBuilder {
        SpanBuilder::from_name(operation)
    }

    #[test]
    fn constant_samplers_are_constant() {
        let b = builder("op");
        assert_eq!(
            ConstantSampler::always().decide(&b),
            SamplingDecision::Sample
        );
        assert_eq!(
            ConstantSampler::never().decide(&b),
            SamplingDecision::DoNotSample
        );
    }

    #[test]
    fn random_sampler_boundaries_are_strict() {
        let b = builder("op");
        let never = RandomSampler::new(0.0);
        let always = RandomSampler::new(1.0);
        for _ in 0..1_000 {
            assert_eq!(never.decide(&b), SamplingDecision::DoNotSample);
            assert_eq!(always.decide(&b), SamplingDecision::Sample);
        }
    }

    #[test]
    fn random_sampler_tracks_its_probability() {
        let total = 10_000;
        let b = builder("op");
        for probability in [0.25, 0.5, 0.75] {
            let sampler = RandomSampler::new(probability);
            let sampled = (0..total)
                .filter(|_| sampler.decide(&b) == SamplingDecision::Sample)
                .count();
            let got = sampled as f64 / total as f64;
            // See https://en.wikipedia.org/wiki/Binomial_proportion_confidence_interval
            let z = 4.75342; // This should succeed 99.9999% of the time
            let tolerance = z * (got * (1.0 - got) / total as f64).sqrt();
            assert!(
                (got - probability).abs() <= tolerance,
                "probability {probability}, sampled fraction {got}"
            );
        }
    }

    #[test]
    fn adaptive_converges_to_the_global_throughput() {
        let sampler = AdaptiveSampler::new(100.0, Vec::new()).unwrap();
        let b = builder("steady-op");

        let seconds = 60;
        let offered_per_second = 200;
        let mut sampled = 0u64;
        for _ in 0..seconds {
            for _ in 0..offered_per_second {
                if sampler.decide(&b) == SamplingDecision::Sample {
                    sampled += 1;
                }
            }
            sampler.adapt();
        }

        // The first interval samples at full probability while the balancer
        // has no observations yet, so allow for it on top of the 20% band.
        let target = 100.0 * seconds as f64;
        assert!(
            (sampled as f64) > target * 0.8,
            "sampled {sampled}, expected at least {}",
            target * 0.8
        );
        assert!(
            (sampled as f64) < target * 1.2 + offered_per_second as f64,
            "sampled {sampled}, expected at most {}",
            target * 1.2 + offered_per_second as f64
        );
    }

    #[test]
    fn never_groups_sample_exactly_zero() {
        let groups = vec![SamplerGroup {
            name: "noise".to_owned(),
            operations: vec!["health.*".to_owned()],
            sample: Some(false),
            ..SamplerGroup::default()
        }];
        let sampler = AdaptiveSampler::new(100.0, groups).unwrap();

        let health = builder("health-check");
        let other = builder("checkout");
        let mut health_sampled = 0;
        let mut other_sampled = 0;
        for _ in 0..5_000 {
            if sampler.decide(&health) == SamplingDecision::Sample {
                health_sampled += 1;
            }
            if sampler.decide(&other) == SamplingDecision::Sample {
                other_sampled += 1;
            }
        }
        assert_eq!(health_sampled, 0);
        assert!(other_sampled > 0);
    }

    #[test]
    fn group_minimums_are_respected_under_budget_pressure() {
        let groups = vec![SamplerGroup {
            name: "important".to_owned(),
            operations: vec!["checkout".to_owned()],
            min_throughput: 50.0,
            ..SamplerGroup::default()
        }];
        let sampler = AdaptiveSampler::new(10.0, groups).unwrap();
        let checkout = builder("checkout");
        let noise = builder("noise");

        // Warm-up interval to register demand, then adapt.
        for _ in 0..1_000 {
            sampler.decide(&checkout);
            sampler.decide(&noise);
        }
        sampler.adapt();

        let checkout_op = sampler.operation("checkout");
        let noise_op = sampler.operation("noise");
        // The group minimum beats the global budget for matched operations.
        assert!(checkout_op.probability() >= 50.0 / 1_000.0);
        assert!(noise_op.probability() <= checkout_op.probability());
    }

    #[test]
    fn group_patterns_are_anchored() {
        let groups = vec![SamplerGroup {
            name: "exact".to_owned(),
            operations: vec!["ping".to_owned()],
            sample: Some(false),
            ..SamplerGroup::default()
        }];
        let sampler = AdaptiveSampler::new(100.0, groups).unwrap();
        assert_eq!(sampler.operation("ping").fixed, Some(false));
        assert_eq!(sampler.operation("ping-pong").fixed, None);
    }

    #[test]
    fn panicking_samplers_degrade_to_not_sampling() {
        struct Exploding;
        impl Sampler for Exploding {
            fn decide(&self, _builder: &SpanBuilder) -> SamplingDecision {
                panic!("sampler exploded")
            }
        }
        let decision = safe_decide(&Exploding, &builder("op"));
        assert_eq!(decision, SamplingDecision::DoNotSample);
    }

    #[test]
    fn invalid_group_patterns_fail_configuration() {
        let groups = vec![SamplerGroup {
            name: "broken".to_owned(),
            operations: vec!["(unclosed".to_owned()],
            ..SamplerGroup::default()
        }];
        assert!(AdaptiveSampler::new(100.0, groups).is_err());
    }
}
