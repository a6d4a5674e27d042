//! Span state machine.
//!
//! A [`Span`] is a cheap-to-clone handle. Three forms exist: the empty span
//! (carried by contexts with no active operation), remote spans rebuilt from
//! propagated carriers, and local spans produced by a
//! [`Tracer`](crate::trace::Tracer). Only local spans are mutable, and only
//! until they are finished: a span transitions Open → Finished exactly once,
//! and mutations after the transition are ignored with a logged warning.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::SystemTime;

use once_cell::sync::Lazy;

use crate::clock::Clock;
use crate::tag::{TagSet, TagSetBuilder, TagValue};
use crate::trace::{Identifier, SamplingDecision, SpanKind, SpanPosition, Trace};
use crate::vantage_warn;

static EMPTY_SPAN: Lazy<Span> = Lazy::new(|| Span {
    inner: Arc::new(SpanInner {
        id: Identifier::empty(),
        parent_id: Identifier::empty(),
        trace: Trace::empty(),
        kind: SpanKind::Unknown,
        position: SpanPosition::Unknown,
        remote: false,
        local: None,
    }),
});

/// A timed operation record.
#[derive(Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

pub(crate) struct SpanInner {
    id: Identifier,
    parent_id: Identifier,
    trace: Trace,
    kind: SpanKind,
    position: SpanPosition,
    remote: bool,
    local: Option<LocalState>,
}

struct LocalState {
    finished: AtomicBool,
    state: Mutex<SpanState>,
    on_finish: Arc<dyn Fn(FinishedSpan) + Send + Sync>,
    pre_finish: Arc<[Arc<dyn PreFinishHook>]>,
    local_parent: Option<Weak<SpanInner>>,
    clock: Clock,
}

pub(crate) struct SpanState {
    pub(crate) operation_name: String,
    pub(crate) start: SystemTime,
    pub(crate) span_tags: TagSetBuilder,
    pub(crate) metric_tags: TagSetBuilder,
    pub(crate) marks: Vec<Mark>,
    pub(crate) failure: Option<Failure>,
    pub(crate) track_metrics: bool,
    pub(crate) include_error_stacktrace: bool,
    pub(crate) tag_with_parent_operation: bool,
}

/// A point-in-time annotation on a span.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mark {
    /// When the mark was recorded.
    pub instant: SystemTime,
    /// What the mark denotes.
    pub key: String,
}

/// Failure information attached to a span.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Failure {
    /// Human-readable failure message.
    pub message: Option<String>,
    /// The underlying cause chain, if captured.
    pub cause: Option<String>,
}

/// Runs right before a local span builds its immutable finished record.
/// Panics are caught, logged and swallowed.
pub trait PreFinishHook: Send + Sync {
    /// Inspect or amend the finishing span.
    fn before_finish(&self, span: &mut FinishingSpan<'_>);
}

/// Mutable view over a span handed to [`PreFinishHook`]s.
pub struct FinishingSpan<'a> {
    state: &'a mut SpanState,
    clock: &'a Clock,
}

impl FinishingSpan<'_> {
    /// The operation name the span will be reported under.
    pub fn operation_name(&self) -> &str {
        &self.state.operation_name
    }

    /// Renames the operation.
    pub fn set_operation_name(&mut self, name: impl Into<String>) {
        self.state.operation_name = name.into();
    }

    /// Adds a span tag.
    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<TagValue>) {
        self.state.span_tags.put(key, value);
    }

    /// Adds a metric tag.
    pub fn metric_tag(&mut self, key: impl Into<String>, value: impl Into<TagValue>) {
        self.state.metric_tags.put(key, value);
    }

    /// Records a mark at the current instant.
    pub fn mark(&mut self, key: impl Into<String>) {
        let instant = self.clock.now();
        self.state.marks.push(Mark {
            instant,
            key: key.into(),
        });
    }
}

impl Span {
    /// The empty span: carried by contexts with no active operation.
    pub fn empty() -> Span {
        EMPTY_SPAN.clone()
    }

    /// Rebuilds a span handle from remotely propagated identifiers. Remote
    /// spans serve as parents for local spans and are never mutable.
    pub fn remote(id: Identifier, parent_id: Identifier, trace: Trace) -> Span {
        Span {
            inner: Arc::new(SpanInner {
                id,
                parent_id,
                trace,
                kind: SpanKind::Unknown,
                position: SpanPosition::Unknown,
                remote: true,
                local: None,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn local(
        id: Identifier,
        parent_id: Identifier,
        trace: Trace,
        kind: SpanKind,
        position: SpanPosition,
        state: SpanState,
        on_finish: Arc<dyn Fn(FinishedSpan) + Send + Sync>,
        pre_finish: Arc<[Arc<dyn PreFinishHook>]>,
        local_parent: Option<&Span>,
        clock: Clock,
    ) -> Span {
        Span {
            inner: Arc::new(SpanInner {
                id,
                parent_id,
                trace,
                kind,
                position,
                remote: false,
                local: Some(LocalState {
                    finished: AtomicBool::new(false),
                    state: Mutex::new(state),
                    on_finish,
                    pre_finish,
                    local_parent: local_parent.map(|span| Arc::downgrade(&span.inner)),
                    clock,
                }),
            }),
        }
    }

    /// The span identifier.
    pub fn id(&self) -> &Identifier {
        &self.inner.id
    }

    /// The parent span identifier; empty for root spans.
    pub fn parent_id(&self) -> &Identifier {
        &self.inner.parent_id
    }

    /// The trace this span belongs to.
    pub fn trace(&self) -> &Trace {
        &self.inner.trace
    }

    /// The span kind.
    pub fn kind(&self) -> SpanKind {
        self.inner.kind
    }

    /// Position of this span within its trace.
    pub fn position(&self) -> SpanPosition {
        self.inner.position
    }

    /// Whether this handle was rebuilt from a propagated carrier.
    pub fn is_remote(&self) -> bool {
        self.inner.remote
    }

    /// Whether this is the empty span.
    pub fn is_empty(&self) -> bool {
        self.inner.id.is_empty()
    }

    /// Whether this span already finished. Remote and empty spans are never
    /// considered finished.
    pub fn is_finished(&self) -> bool {
        self.inner
            .local
            .as_ref()
            .map(|local| local.finished.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// The current operation name; empty for remote and empty spans.
    pub fn operation_name(&self) -> String {
        self.inner
            .local
            .as_ref()
            .map(|local| lock_state(&local.state).operation_name.clone())
            .unwrap_or_default()
    }

    /// Upgrades the local parent reference, when one exists.
    pub fn local_parent(&self) -> Option<Span> {
        self.inner
            .local
            .as_ref()
            .and_then(|local| local.local_parent.as_ref())
            .and_then(Weak::upgrade)
            .map(|inner| Span { inner })
    }

    /// Renames the operation. Ignored after finish.
    pub fn set_operation_name(&self, name: impl Into<String>) -> &Self {
        let name = name.into();
        self.with_state(|state| state.operation_name = name);
        self
    }

    /// Adds a span tag. Ignored after finish.
    pub fn tag(&self, key: impl Into<String>, value: impl Into<TagValue>) -> &Self {
        let (key, value) = (key.into(), value.into());
        self.with_state(|state| {
            state.span_tags.put(key, value);
        });
        self
    }

    /// Adds a metric tag. Ignored after finish.
    pub fn metric_tag(&self, key: impl Into<String>, value: impl Into<TagValue>) -> &Self {
        let (key, value) = (key.into(), value.into());
        self.with_state(|state| {
            state.metric_tags.put(key, value);
        });
        self
    }

    /// Records a mark at the current instant. Ignored after finish.
    pub fn mark(&self, key: impl Into<String>) -> &Self {
        let key = key.into();
        if let Some(local) = &self.inner.local {
            let instant = local.clock.now();
            self.with_state(|state| state.marks.push(Mark { instant, key }));
        }
        self
    }

    /// Records a mark at the given instant. Ignored after finish.
    pub fn mark_at(&self, key: impl Into<String>, instant: SystemTime) -> &Self {
        let key = key.into();
        self.with_state(|state| state.marks.push(Mark { instant, key }));
        self
    }

    /// Marks the span as failed. Ignored after finish.
    pub fn fail(&self, message: impl Into<String>) -> &Self {
        let message = message.into();
        self.with_state(|state| {
            let failure = state.failure.get_or_insert_with(Failure::default);
            failure.message = Some(message);
        });
        self
    }

    /// Marks the span as failed with the given error, capturing its source
    /// chain as the cause. Ignored after finish.
    pub fn fail_with_error(&self, error: &dyn std::error::Error) -> &Self {
        let message = error.to_string();
        let cause = render_cause(error);
        self.with_state(|state| {
            let failure = state.failure.get_or_insert_with(Failure::default);
            failure.message = Some(message);
            failure.cause = cause;
        });
        self
    }

    /// Enables or disables contribution to the span-processing-time metric.
    /// Ignored after finish.
    pub fn set_track_metrics(&self, enabled: bool) -> &Self {
        self.with_state(|state| state.track_metrics = enabled);
        self
    }

    /// Finishes the span at the current instant.
    pub fn finish(&self) {
        if let Some(local) = &self.inner.local {
            let at = local.clock.now();
            self.finish_at(at);
        }
    }

    /// Finishes the span at the given instant. A span finishes exactly once;
    /// further calls are ignored with a logged warning.
    pub fn finish_at(&self, at: SystemTime) {
        let Some(local) = &self.inner.local else {
            return;
        };
        if local.finished.swap(true, Ordering::AcqRel) {
            vantage_warn!(
                name: "Span.FinishAfterFinish",
                span_id = self.inner.id.hex()
            );
            return;
        }

        let mut state = lock_state(&local.state);
        for hook in local.pre_finish.iter() {
            let mut finishing = FinishingSpan {
                state: &mut state,
                clock: &local.clock,
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| hook.before_finish(&mut finishing)));
            if outcome.is_err() {
                vantage_warn!(
                    name: "Span.PreFinishHookFailed",
                    span_id = self.inner.id.hex()
                );
            }
        }

        if state.tag_with_parent_operation {
            if let Some(operation) = self.parent_operation_name(local) {
                state.metric_tags.put("parentOperation", operation);
            }
        }

        if let Some(failure) = state.failure.clone() {
            state.span_tags.put("error", true);
            if let Some(message) = failure.message {
                state.span_tags.put("error.message", message);
            }
            if state.include_error_stacktrace {
                if let Some(cause) = failure.cause {
                    state.span_tags.put("error.stacktrace", cause);
                }
            }
        }

        let finished = FinishedSpan {
            id: self.inner.id.clone(),
            parent_id: self.inner.parent_id.clone(),
            trace: self.inner.trace.clone(),
            position: self.inner.position,
            kind: self.inner.kind,
            operation_name: std::mem::take(&mut state.operation_name),
            start: state.start,
            finish: at.max(state.start),
            tags: std::mem::take(&mut state.span_tags).build(),
            metric_tags: std::mem::take(&mut state.metric_tags).build(),
            marks: std::mem::take(&mut state.marks),
            failure: state.failure.take(),
            track_metrics: state.track_metrics,
        };
        drop(state);

        (local.on_finish)(finished);
    }

    fn parent_operation_name(&self, local: &LocalState) -> Option<String> {
        let parent = local.local_parent.as_ref()?.upgrade()?;
        let parent_local = parent.local.as_ref()?;
        let name = lock_state(&parent_local.state).operation_name.clone();
        Some(name)
    }

    fn with_state(&self, f: impl FnOnce(&mut SpanState)) {
        let Some(local) = &self.inner.local else {
            return;
        };
        if local.finished.load(Ordering::Acquire) {
            vantage_warn!(
                name: "Span.MutateAfterFinish",
                span_id = self.inner.id.hex()
            );
            return;
        }
        f(&mut lock_state(&local.state));
    }
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Span")
            .field("id", &self.inner.id)
            .field("parent_id", &self.inner.parent_id)
            .field("trace", &self.inner.trace)
            .field("kind", &self.inner.kind)
            .field("position", &self.inner.position)
            .field("remote", &self.inner.remote)
            .finish()
    }
}

fn lock_state(state: &Mutex<SpanState>) -> std::sync::MutexGuard<'_, SpanState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn render_cause(error: &dyn std::error::Error) -> Option<String> {
    let mut source = error.source()?;
    let mut rendered = source.to_string();
    while let Some(next) = source.source() {
        rendered.push_str("\n  caused by: ");
        rendered.push_str(&next.to_string());
        source = next;
    }
    Some(rendered)
}

/// The immutable record of a finished span.
#[derive(Clone, Debug)]
pub struct FinishedSpan {
    /// Span identifier.
    pub id: Identifier,
    /// Parent span identifier; empty for roots.
    pub parent_id: Identifier,
    /// The trace this span belongs to.
    pub trace: Trace,
    /// Position within the trace.
    pub position: SpanPosition,
    /// Span kind.
    pub kind: SpanKind,
    /// Operation name at finish time.
    pub operation_name: String,
    /// Start instant.
    pub start: SystemTime,
    /// Finish instant; never precedes `start`.
    pub finish: SystemTime,
    /// Span tags.
    pub tags: TagSet,
    /// Metric tags.
    pub metric_tags: TagSet,
    /// Recorded marks, in recording order.
    pub marks: Vec<Mark>,
    /// Failure information, when the span failed.
    pub failure: Option<Failure>,
    /// Whether this span contributes to the span-processing-time metric.
    pub track_metrics: bool,
}

impl FinishedSpan {
    /// Elapsed time between start and finish.
    pub fn elapsed(&self) -> std::time::Duration {
        self.finish
            .duration_since(self.start)
            .unwrap_or_default()
    }

    /// Whether the span finished with failure information attached.
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub(crate) fn sampled(&self) -> bool {
        self.trace.decision == SamplingDecision::Sample
    }
}
