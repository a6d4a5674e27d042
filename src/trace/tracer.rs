//! Span building and the tracer.
//!
//! A [`SpanBuilder`] accumulates everything known about an operation before
//! it starts; [`SpanBuilder::start`] resolves parents, identifiers, position
//! and the sampling decision against a [`Tracer`] and produces a live
//! [`Span`]. Finished spans land in a bounded lock-free ring drained by
//! reporters through [`Tracer::spans`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;

use crate::clock::Clock;
use crate::config::Config;
use crate::context::Context;
use crate::error::Result;
use crate::extension::ExtensionRegistry;
use crate::metrics::MetricRegistry;
use crate::scheduler::{ScheduleHandle, Scheduler};
use crate::tag::{TagSetBuilder, TagValue};
use crate::trace::ring::SpanRing;
use crate::trace::sampler::{
    safe_decide, sampler_from_config, AdaptiveSampler, Sampler, SamplerRef,
};
use crate::trace::span::SpanState;
use crate::trace::{
    Failure, FinishedSpan, Identifier, IdentifierScheme, Mark, PreFinishHook, SamplingDecision,
    Span, SpanKind, SpanMetrics, SpanPosition, Trace,
};
use crate::{vantage_error, vantage_warn};

/// Period of the adaptive sampler's rebalancing tick.
const ADAPTATION_INTERVAL: Duration = Duration::from_secs(1);

/// Runs on every [`SpanBuilder`] right before the span is assembled.
/// Panics are caught, logged and swallowed.
pub trait PreStartHook: Send + Sync {
    /// Inspect or amend the builder.
    fn before_start(&self, builder: &mut SpanBuilder);
}

/// The tracing-side settings snapshot. Reconfiguration swaps the whole
/// snapshot atomically; span-build paths load it once per call.
#[derive(Clone)]
pub struct TraceSettings {
    /// The sampler consulted for new trace roots.
    pub sampler: SamplerRef,
    pub(crate) adaptive: Option<AdaptiveSampler>,
    /// Identifier widths for new trace and span identifiers.
    pub identifier_scheme: IdentifierScheme,
    /// Server spans continuing a remote parent reuse the parent's span id.
    pub join_remote_parents_with_same_span_id: bool,
    /// Attach the failure cause chain as an `error.stacktrace` span tag.
    pub include_error_stacktrace: bool,
    /// Copy the context's `initiator.name` tag into span metric tags.
    pub tag_with_initiator_service: bool,
    /// Tag span metrics with the local parent's operation name.
    pub tag_with_parent_operation: bool,
    /// Capacity of the finished-span ring.
    pub reporter_queue_size: usize,
    /// Suggested reporter poll interval; the tracer itself does not push.
    pub tick_interval: Duration,
    /// Hooks applied to every builder before `start`.
    pub pre_start_hooks: Arc<[Arc<dyn PreStartHook>]>,
    /// Hooks applied to every local span before it finishes.
    pub pre_finish_hooks: Arc<[Arc<dyn PreFinishHook>]>,
}

impl Default for TraceSettings {
    fn default() -> Self {
        let adaptive = AdaptiveSampler::with_throughput(600.0);
        TraceSettings {
            sampler: Arc::new(adaptive.clone()),
            adaptive: Some(adaptive),
            identifier_scheme: IdentifierScheme::single(),
            join_remote_parents_with_same_span_id: false,
            include_error_stacktrace: true,
            tag_with_initiator_service: true,
            tag_with_parent_operation: true,
            reporter_queue_size: 4096,
            tick_interval: Duration::from_secs(10),
            pre_start_hooks: Arc::from(Vec::new()),
            pre_finish_hooks: Arc::from(Vec::new()),
        }
    }
}

impl TraceSettings {
    /// Replaces the sampler with a fixed (non-adaptive) implementation.
    pub fn with_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Arc::new(sampler);
        self.adaptive = None;
        self
    }

    /// Replaces the sampler with an adaptive one; the tracer schedules its
    /// rebalancing tick.
    pub fn with_adaptive_sampler(mut self, sampler: AdaptiveSampler) -> Self {
        self.sampler = Arc::new(sampler.clone());
        self.adaptive = Some(sampler);
        self
    }

    /// Sets the identifier scheme.
    pub fn with_identifier_scheme(mut self, scheme: IdentifierScheme) -> Self {
        self.identifier_scheme = scheme;
        self
    }

    /// Sets the finished-span ring capacity.
    pub fn with_reporter_queue_size(mut self, size: usize) -> Self {
        self.reporter_queue_size = size.max(1);
        self
    }

    /// Enables or disables the same-span-id join for server spans continuing
    /// remote parents.
    pub fn with_join_remote_parents_with_same_span_id(mut self, join: bool) -> Self {
        self.join_remote_parents_with_same_span_id = join;
        self
    }

    /// Appends a pre-start hook.
    pub fn with_pre_start_hook(mut self, hook: Arc<dyn PreStartHook>) -> Self {
        let mut hooks = self.pre_start_hooks.to_vec();
        hooks.push(hook);
        self.pre_start_hooks = Arc::from(hooks);
        self
    }

    /// Appends a pre-finish hook.
    pub fn with_pre_finish_hook(mut self, hook: Arc<dyn PreFinishHook>) -> Self {
        let mut hooks = self.pre_finish_hooks.to_vec();
        hooks.push(hook);
        self.pre_finish_hooks = Arc::from(hooks);
        self
    }

    /// Reads `trace.*` from a root-scoped configuration tree. Configuration
    /// errors (malformed group patterns, invalid values) surface here;
    /// unknown extension names degrade to their documented fallbacks with an
    /// error log.
    pub fn from_config(config: &Config, extensions: &ExtensionRegistry) -> Result<TraceSettings> {
        let defaults = TraceSettings::default();
        let (sampler, adaptive) = sampler_from_config(config, extensions)?;

        let identifier_scheme = match config
            .string("trace.identifier-scheme")
            .as_deref()
            .unwrap_or("single")
        {
            "single" => IdentifierScheme::single(),
            "double" => IdentifierScheme::double(),
            name => match extensions.identifier_scheme(name) {
                Ok(scheme) => scheme,
                Err(error) => {
                    vantage_error!(
                        name: "Tracer.IdentifierSchemeInstantiationFailed",
                        scheme = name,
                        error = error.to_string(),
                        fallback = "single"
                    );
                    IdentifierScheme::single()
                }
            },
        };

        let mut pre_start_hooks = Vec::new();
        for name in config.string_list("trace.hooks.pre-start") {
            match extensions.pre_start_hook(&name) {
                Ok(hook) => pre_start_hooks.push(hook),
                Err(error) => {
                    vantage_error!(
                        name: "Tracer.PreStartHookInstantiationFailed",
                        hook = name.as_str(),
                        error = error.to_string()
                    );
                }
            }
        }
        let mut pre_finish_hooks = Vec::new();
        for name in config.string_list("trace.hooks.pre-finish") {
            match extensions.pre_finish_hook(&name) {
                Ok(hook) => pre_finish_hooks.push(hook),
                Err(error) => {
                    vantage_error!(
                        name: "Tracer.PreFinishHookInstantiationFailed",
                        hook = name.as_str(),
                        error = error.to_string()
                    );
                }
            }
        }

        Ok(TraceSettings {
            sampler,
            adaptive,
            identifier_scheme,
            join_remote_parents_with_same_span_id: config
                .bool("trace.join-remote-parents-with-same-span-id")
                .unwrap_or(defaults.join_remote_parents_with_same_span_id),
            include_error_stacktrace: config
                .bool("trace.include-error-stacktrace")
                .unwrap_or(defaults.include_error_stacktrace),
            tag_with_initiator_service: config
                .bool("trace.span-metric-tags.initiator-service")
                .unwrap_or(defaults.tag_with_initiator_service),
            tag_with_parent_operation: config
                .bool("trace.span-metric-tags.parent-operation")
                .unwrap_or(defaults.tag_with_parent_operation),
            reporter_queue_size: config
                .i64("trace.reporter-queue-size")
                .map(|size| size.max(1) as usize)
                .unwrap_or(defaults.reporter_queue_size),
            tick_interval: config
                .duration("trace.tick-interval")
                .unwrap_or(defaults.tick_interval),
            pre_start_hooks: Arc::from(pre_start_hooks),
            pre_finish_hooks: Arc::from(pre_finish_hooks),
        })
    }
}

/// Buffer and drop statistics exposed for reporters and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TracerStatus {
    /// Finished spans currently awaiting a drain.
    pub buffered: usize,
    /// Capacity of the finished-span ring.
    pub capacity: usize,
    /// Spans dropped because the ring was full, since tracer creation.
    pub dropped: u64,
}

/// Builds spans, owns the sampling decision for new trace roots and buffers
/// finished spans until a reporter drains them.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

struct TracerInner {
    clock: Clock,
    scheduler: Arc<dyn Scheduler>,
    settings: ArcSwap<TraceSettings>,
    ring: ArcSwap<SpanRing>,
    dropped: AtomicU64,
    span_metrics: SpanMetrics,
    on_finish: OnceLock<Arc<dyn Fn(FinishedSpan) + Send + Sync>>,
    reconfigure_lock: Mutex<()>,
    adaptation_task: Mutex<Option<ScheduleHandle>>,
}

impl Tracer {
    /// Creates a tracer. The registry hosts the span-processing-time metric;
    /// the scheduler runs the adaptive sampler's rebalancing tick.
    pub fn new(
        clock: Clock,
        scheduler: Arc<dyn Scheduler>,
        registry: &MetricRegistry,
        settings: TraceSettings,
    ) -> Tracer {
        let tracer = Tracer {
            inner: Arc::new(TracerInner {
                clock,
                scheduler,
                ring: ArcSwap::from_pointee(SpanRing::new(settings.reporter_queue_size)),
                settings: ArcSwap::from_pointee(settings.clone()),
                dropped: AtomicU64::new(0),
                span_metrics: SpanMetrics::new(registry),
                on_finish: OnceLock::new(),
                reconfigure_lock: Mutex::new(()),
                adaptation_task: Mutex::new(None),
            }),
        };
        let callback_inner = tracer.inner.clone();
        let _ = tracer.inner.on_finish.set(Arc::new(move |span: FinishedSpan| {
            if !span.sampled() {
                return;
            }
            if span.track_metrics {
                callback_inner.span_metrics.record(&span);
            }
            let ring = callback_inner.ring.load();
            if !ring.offer(span) {
                callback_inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }));
        tracer.schedule_adaptation(&settings);
        tracer
    }

    /// Starts assembling a span with the given operation name.
    pub fn span_builder(&self, operation_name: impl Into<String>) -> SpanBuilder {
        SpanBuilder::from_name(operation_name)
    }

    /// Drains every finished span currently buffered. Reporters poll this on
    /// their own cadence; the tracer never pushes.
    pub fn spans(&self) -> Vec<FinishedSpan> {
        self.inner.ring.load().drain()
    }

    /// Buffer and drop statistics.
    pub fn status(&self) -> TracerStatus {
        let ring = self.inner.ring.load();
        TracerStatus {
            buffered: ring.len(),
            capacity: ring.capacity(),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    /// The active settings snapshot.
    pub fn settings(&self) -> Arc<TraceSettings> {
        self.inner.settings.load_full()
    }

    /// Applies a new settings snapshot. Span-build and finish paths keep
    /// running against the previous snapshot until the swap completes. When
    /// the queue size changes the buffer is replaced outright; spans still
    /// buffered in the old ring are counted as dropped.
    pub fn reconfigure(&self, settings: TraceSettings) {
        let _guard = self
            .inner
            .reconfigure_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let previous = self.inner.settings.load();
        if previous.reporter_queue_size != settings.reporter_queue_size {
            let replaced = self
                .inner
                .ring
                .swap(Arc::new(SpanRing::new(settings.reporter_queue_size)));
            let lost = replaced.drain().len() as u64;
            if lost > 0 {
                self.inner.dropped.fetch_add(lost, Ordering::Relaxed);
                vantage_warn!(
                    name: "Tracer.BufferReplaced",
                    lost_spans = lost
                );
            }
        }
        self.schedule_adaptation(&settings);
        self.inner.settings.store(Arc::new(settings));
    }

    fn schedule_adaptation(&self, settings: &TraceSettings) {
        let mut task = self
            .inner
            .adaptation_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = task.take() {
            previous.cancel();
        }
        if let Some(adaptive) = settings.adaptive.clone() {
            *task = Some(self.inner.scheduler.schedule(
                ADAPTATION_INTERVAL,
                Box::new(move || adaptive.adapt()),
            ));
        }
    }

    fn start_span(&self, mut builder: SpanBuilder, at: Option<SystemTime>) -> Span {
        let settings = self.inner.settings.load_full();

        for hook in settings.pre_start_hooks.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| hook.before_start(&mut builder)));
            if outcome.is_err() {
                vantage_warn!(
                    name: "Tracer.PreStartHookFailed",
                    operation = builder.operation_name()
                );
            }
        }

        let context = match builder.context.take() {
            Some(context) => context,
            None => Context::current(),
        };

        if settings.tag_with_initiator_service {
            if let Some(initiator) = context.tags().get("initiator.name") {
                builder.metric_tags.put("initiator.name", initiator.clone());
            }
        }

        let parent = match builder.parent.take() {
            Some(parent) => parent,
            None if !builder.ignore_parent_from_context => context.span().clone(),
            None => Span::empty(),
        };

        let local_parent = (!parent.is_empty() && !parent.is_remote()).then(|| parent.clone());

        let join = parent.is_remote()
            && builder.kind == SpanKind::Server
            && settings.join_remote_parents_with_same_span_id;
        let (id, parent_id) = if join {
            (parent.id().clone(), parent.parent_id().clone())
        } else {
            (
                settings.identifier_scheme.span_ids.generate(),
                parent.id().clone(),
            )
        };

        let trace_id = if !parent.trace().id.is_empty() {
            parent.trace().id.clone()
        } else if !builder.suggested_trace_id.is_empty() {
            builder.suggested_trace_id.clone()
        } else {
            settings.identifier_scheme.trace_ids.generate()
        };

        let position = if parent.is_empty() {
            SpanPosition::Root
        } else if parent.is_remote() {
            SpanPosition::LocalRoot
        } else {
            SpanPosition::Unknown
        };

        let decision = if position == SpanPosition::Root
            || parent.trace().decision == SamplingDecision::Unknown
        {
            safe_decide(settings.sampler.as_ref(), &builder)
        } else {
            parent.trace().decision
        };

        let start = at.unwrap_or_else(|| self.inner.clock.now());
        let marks = builder
            .marks
            .drain(..)
            .map(|(instant, key)| Mark {
                instant: instant.unwrap_or(start),
                key,
            })
            .collect();
        let state = SpanState {
            operation_name: std::mem::take(&mut builder.operation_name),
            start,
            span_tags: std::mem::take(&mut builder.span_tags),
            metric_tags: std::mem::take(&mut builder.metric_tags),
            marks,
            failure: builder.failure.take(),
            track_metrics: builder.track_metrics,
            include_error_stacktrace: settings.include_error_stacktrace,
            tag_with_parent_operation: settings.tag_with_parent_operation,
        };

        let on_finish = self
            .inner
            .on_finish
            .get()
            .expect("set at construction")
            .clone();
        Span::local(
            id,
            parent_id,
            Trace::new(trace_id, decision),
            builder.kind,
            position,
            state,
            on_finish,
            settings.pre_finish_hooks.clone(),
            local_parent.as_ref(),
            self.inner.clock.clone(),
        )
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Accumulates span properties before [`start`](SpanBuilder::start).
///
/// The builder is consumed by `start`; it cannot be reused.
pub struct SpanBuilder {
    operation_name: String,
    kind: SpanKind,
    span_tags: TagSetBuilder,
    metric_tags: TagSetBuilder,
    marks: Vec<(Option<SystemTime>, String)>,
    failure: Option<Failure>,
    context: Option<Context>,
    parent: Option<Span>,
    ignore_parent_from_context: bool,
    suggested_trace_id: Identifier,
    track_metrics: bool,
}

impl SpanBuilder {
    /// Creates a builder with the given operation name.
    pub fn from_name(operation_name: impl Into<String>) -> SpanBuilder {
        SpanBuilder {
            operation_name: operation_name.into(),
            kind: SpanKind::Unknown,
            span_tags: TagSetBuilder::default(),
            metric_tags: TagSetBuilder::default(),
            marks: Vec::new(),
            failure: None,
            context: None,
            parent: None,
            ignore_parent_from_context: false,
            suggested_trace_id: Identifier::empty(),
            track_metrics: true,
        }
    }

    /// The operation name accumulated so far.
    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// Renames the operation. Mainly for [`PreStartHook`]s.
    pub fn set_operation_name(&mut self, name: impl Into<String>) {
        self.operation_name = name.into();
    }

    /// Sets the span kind.
    pub fn kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    /// Adds a span tag.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.span_tags.put(key, value);
        self
    }

    /// Adds a metric tag.
    pub fn metric_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.metric_tags.put(key, value);
        self
    }

    /// Records a mark stamped with the span's start instant.
    pub fn mark(mut self, key: impl Into<String>) -> Self {
        self.marks.push((None, key.into()));
        self
    }

    /// Records a mark at an explicit instant.
    pub fn mark_at(mut self, key: impl Into<String>, instant: SystemTime) -> Self {
        self.marks.push((Some(instant), key.into()));
        self
    }

    /// Starts the span in failed state.
    pub fn fail(mut self, message: impl Into<String>) -> Self {
        let failure = self.failure.get_or_insert_with(Failure::default);
        failure.message = Some(message.into());
        self
    }

    /// Overrides the context the span resolves its parent from.
    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets an explicit parent, overriding the context's span.
    pub fn parent(mut self, parent: Span) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Ignores the context's span when resolving the parent.
    pub fn ignore_parent_from_context(mut self) -> Self {
        self.ignore_parent_from_context = true;
        self
    }

    /// Suggests a trace id, used only when no parent trace id exists.
    pub fn suggested_trace_id(mut self, trace_id: Identifier) -> Self {
        self.suggested_trace_id = trace_id;
        self
    }

    /// Enables or disables contribution to the span-processing-time metric.
    pub fn track_metrics(mut self, enabled: bool) -> Self {
        self.track_metrics = enabled;
        self
    }

    /// Starts the span at the current instant.
    pub fn start(self, tracer: &Tracer) -> Span {
        tracer.start_span(self, None)
    }

    /// Starts the span at the given instant.
    pub fn start_at(self, tracer: &Tracer, at: SystemTime) -> Span {
        tracer.start_span(self, Some(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{FactorySettings, RegistrySettings};
    use crate::scheduler::ThreadPoolScheduler;

    fn test_tracer_with(settings: TraceSettings) -> (Tracer, Arc<MetricRegistry>) {
        let clock = Clock::new();
        let scheduler: Arc<dyn Scheduler> = Arc::new(ThreadPoolScheduler::new(1));
        let registry = Arc::new(MetricRegistry::new(
            clock.clone(),
            scheduler.clone(),
            FactorySettings::default(),
            RegistrySettings::default(),
        ));
        let tracer = Tracer::new(clock, scheduler, &registry, settings);
        (tracer, registry)
    }

    fn always_sampling() -> TraceSettings {
        TraceSettings {
            sampler: Arc::new(crate::trace::ConstantSampler::always()),
            adaptive: None,
            ..TraceSettings::default()
        }
    }

    #[test]
    fn root_spans_get_fresh_identifiers() {
        let (tracer, _registry) = test_tracer_with(always_sampling());
        let span = tracer.span_builder("root-op").start(&tracer);

        assert!(!span.id().is_empty());
        assert!(span.parent_id().is_empty());
        assert!(!span.trace().id.is_empty());
        assert_eq!(span.position(), SpanPosition::Root);
        assert_eq!(span.trace().decision, SamplingDecision::Sample);
    }

    #[test]
    fn children_inherit_trace_id_and_decision() {
        let (tracer, _registry) = test_tracer_with(always_sampling());
        let root = tracer.span_builder("root-op").start(&tracer);
        let child = tracer
            .span_builder("child-op")
            .parent(root.clone())
            .start(&tracer);

        assert_eq!(child.trace().id, root.trace().id);
        assert_eq!(child.parent_id(), root.id());
        assert_ne!(child.id(), root.id());
        assert_eq!(child.position(), SpanPosition::Unknown);
        assert_eq!(child.trace().decision, root.trace().decision);
    }

    #[test]
    fn the_context_span_is_the_default_parent() {
        let (tracer, _registry) = test_tracer_with(always_sampling());
        let root = tracer.span_builder("root-op").start(&tracer);
        let _guard = Context::current().with_span(root.clone()).attach();

        let child = tracer.span_builder("child-op").start(&tracer);
        assert_eq!(child.parent_id(), root.id());

        let orphan = tracer
            .span_builder("orphan-op")
            .ignore_parent_from_context()
            .start(&tracer);
        assert!(orphan.parent_id().is_empty());
        assert_eq!(orphan.position(), SpanPosition::Root);
    }

    #[test]
    fn remote_parents_make_local_roots() {
        let (tracer, _registry) = test_tracer_with(always_sampling());
        let remote = Span::remote(
            Identifier::from_hex("00f067aa0ba902b7").unwrap(),
            Identifier::empty(),
            Trace::new(
                Identifier::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
                SamplingDecision::Sample,
            ),
        );
        let span = tracer
            .span_builder("server-op")
            .kind(SpanKind::Server)
            .parent(remote.clone())
            .start(&tracer);

        assert_eq!(span.position(), SpanPosition::LocalRoot);
        assert_eq!(span.trace().id, remote.trace().id);
        assert_eq!(span.parent_id(), remote.id());
    }

    #[test]
    fn same_span_id_join_applies_only_when_all_conditions_hold() {
        let settings = TraceSettings {
            join_remote_parents_with_same_span_id: true,
            ..always_sampling()
        };
        let (tracer, _registry) = test_tracer_with(settings);
        let remote = Span::remote(
            Identifier::from_hex("00f067aa0ba902b7").unwrap(),
            Identifier::from_hex("0102030405060708").unwrap(),
            Trace::new(
                Identifier::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
                SamplingDecision::Sample,
            ),
        );

        let joined = tracer
            .span_builder("server-op")
            .kind(SpanKind::Server)
            .parent(remote.clone())
            .start(&tracer);
        assert_eq!(joined.id(), remote.id());
        assert_eq!(joined.parent_id(), remote.parent_id());

        let not_joined = tracer
            .span_builder("consumer-op")
            .kind(SpanKind::Consumer)
            .parent(remote.clone())
            .start(&tracer);
        assert_ne!(not_joined.id(), remote.id());
        assert_eq!(not_joined.parent_id(), remote.id());
    }

    #[test]
    fn unknown_remote_decisions_are_resampled_locally() {
        let settings = TraceSettings {
            sampler: Arc::new(crate::trace::ConstantSampler::never()),
            adaptive: None,
            ..TraceSettings::default()
        };
        let (tracer, _registry) = test_tracer_with(settings);
        let remote = Span::remote(
            Identifier::from_hex("00f067aa0ba902b7").unwrap(),
            Identifier::empty(),
            Trace::new(
                Identifier::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
                SamplingDecision::Unknown,
            ),
        );
        let span = tracer
            .span_builder("server-op")
            .kind(SpanKind::Server)
            .parent(remote)
            .start(&tracer);
        assert_eq!(span.trace().decision, SamplingDecision::DoNotSample);
    }

    #[test]
    fn suggested_trace_ids_yield_to_inherited_ones() {
        let (tracer, _registry) = test_tracer_with(always_sampling());
        let suggested = Identifier::from_hex("0102030405060708").unwrap();

        let root = tracer
            .span_builder("root-op")
            .suggested_trace_id(suggested.clone())
            .start(&tracer);
        assert_eq!(root.trace().id, suggested);

        let parent = tracer.span_builder("parent-op").start(&tracer);
        let child = tracer
            .span_builder("child-op")
            .parent(parent.clone())
            .suggested_trace_id(suggested)
            .start(&tracer);
        assert_eq!(child.trace().id, parent.trace().id);
    }

    #[test]
    fn finished_sampled_spans_are_drained_in_offer_order() {
        let (tracer, _registry) = test_tracer_with(always_sampling());
        for idx in 0..5 {
            tracer
                .span_builder(format!("op-{idx}"))
                .start(&tracer)
                .finish();
        }
        let names: Vec<String> = tracer
            .spans()
            .into_iter()
            .map(|span| span.operation_name)
            .collect();
        assert_eq!(names, vec!["op-0", "op-1", "op-2", "op-3", "op-4"]);
        assert!(tracer.spans().is_empty());
    }

    #[test]
    fn unsampled_spans_never_reach_the_ring() {
        let settings = TraceSettings {
            sampler: Arc::new(crate::trace::ConstantSampler::never()),
            adaptive: None,
            ..TraceSettings::default()
        };
        let (tracer, _registry) = test_tracer_with(settings);
        tracer.span_builder("unsampled-op").start(&tracer).finish();
        assert!(tracer.spans().is_empty());
        assert_eq!(tracer.status().dropped, 0);
    }

    #[test]
    fn a_full_ring_drops_and_counts() {
        let settings = TraceSettings {
            reporter_queue_size: 16,
            ..always_sampling()
        };
        let (tracer, _registry) = test_tracer_with(settings);
        for _ in 0..1_000 {
            tracer.span_builder("flood-op").start(&tracer).finish();
        }
        let status = tracer.status();
        assert_eq!(status.buffered, 16);
        assert!(status.dropped >= 984);
        assert_eq!(tracer.spans().len(), 16);
    }

    #[test]
    fn reconfigure_replaces_the_buffer_and_counts_lost_spans() {
        let (tracer, _registry) = test_tracer_with(always_sampling());
        for _ in 0..3 {
            tracer.span_builder("buffered-op").start(&tracer).finish();
        }
        let mut settings = always_sampling();
        settings.reporter_queue_size = 8;
        tracer.reconfigure(settings);

        let status = tracer.status();
        assert_eq!(status.capacity, 8);
        assert_eq!(status.buffered, 0);
        assert_eq!(status.dropped, 3);
    }

    #[test]
    fn pre_start_hooks_can_rename_operations() {
        struct Renamer;
        impl PreStartHook for Renamer {
            fn before_start(&self, builder: &mut SpanBuilder) {
                if builder.operation_name() == "http.request" {
                    builder.set_operation_name("GET /users");
                }
            }
        }
        let settings = TraceSettings {
            pre_start_hooks: Arc::from(vec![
                Arc::new(Renamer) as Arc<dyn PreStartHook>
            ]),
            ..always_sampling()
        };
        let (tracer, _registry) = test_tracer_with(settings);
        let span = tracer.span_builder("http.request").start(&tracer);
        assert_eq!(span.operation_name(), "GET /users");
    }
}
