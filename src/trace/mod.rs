//! # Distributed tracing
//!
//! Spans represent timed operations stitched into traces through parent/child
//! relationships. A [`Tracer`] builds spans, decides sampling for new trace
//! roots, and buffers finished spans in a bounded lock-free ring until a
//! reporter drains them with [`Tracer::spans`].

mod identifier;
mod metrics;
mod ring;
mod sampler;
mod span;
mod tracer;

pub use identifier::{IdFactory, Identifier, IdentifierScheme};
pub use sampler::{
    AdaptiveSampler, ConstantSampler, RandomSampler, Sampler, SamplerGroup, SamplerRef,
};
pub use span::{Failure, FinishedSpan, FinishingSpan, Mark, PreFinishHook, Span};
pub use tracer::{PreStartHook, SpanBuilder, TraceSettings, Tracer, TracerStatus};

pub(crate) use metrics::SpanMetrics;

/// Name of the histogram metric fed by finished spans that track metrics.
pub const SPAN_PROCESSING_TIME_METRIC: &str = "span.processing-time";

/// The sampling fate of a trace.
///
/// The root span of a trace decides; descendants inherit the decision
/// verbatim. `Unknown` appears on traces read from remote peers that did not
/// propagate a decision, and triggers local re-sampling at the next span.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SamplingDecision {
    /// The trace should be captured and reported.
    Sample,
    /// The trace should not be reported.
    DoNotSample,
    /// No decision was made yet, or the remote peer did not share one.
    Unknown,
}

/// A trace: an identifier shared by all member spans, plus the sampling
/// decision inherited down the span tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trace {
    /// The trace identifier.
    pub id: Identifier,
    /// The sampling decision for every span in this trace.
    pub decision: SamplingDecision,
}

impl Trace {
    /// A trace with an empty identifier and no decision.
    pub fn empty() -> Trace {
        Trace {
            id: Identifier::empty(),
            decision: SamplingDecision::Unknown,
        }
    }

    /// Creates a trace from its parts.
    pub fn new(id: Identifier, decision: SamplingDecision) -> Trace {
        Trace { id, decision }
    }

    /// Whether the trace identifier is empty.
    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

/// Where a span sits relative to the rest of its trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanPosition {
    /// First span of the trace.
    Root,
    /// First span of this process for a trace started elsewhere.
    LocalRoot,
    /// Anything else.
    Unknown,
}

/// The role a span plays in an interaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpanKind {
    /// Handles a request from a remote client.
    Server,
    /// Issues a request to a remote server.
    Client,
    /// Publishes a message.
    Producer,
    /// Consumes a message.
    Consumer,
    /// Internal operation without remote interaction.
    Internal,
    /// Unspecified.
    Unknown,
}

impl SpanKind {
    /// Stable lowercase name, used for metric tags and propagation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Server => "server",
            SpanKind::Client => "client",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
            SpanKind::Internal => "internal",
            SpanKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
