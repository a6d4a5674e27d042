//! The span-processing-time metric.
//!
//! Every finished, sampled span with metric tracking enabled contributes its
//! elapsed time to a single `span.processing-time` timer, tagged with the
//! operation name, span kind and error flag, plus whatever metric tags the
//! span accumulated (`initiator.name` and `parentOperation` when enabled).

use crate::metrics::{Metric, MetricOverrides, MetricRegistry, Timer};
use crate::trace::{FinishedSpan, SPAN_PROCESSING_TIME_METRIC};
use crate::vantage_error;

pub(crate) struct SpanMetrics {
    processing_time: Option<Metric<Timer>>,
}

impl SpanMetrics {
    pub(crate) fn new(registry: &MetricRegistry) -> SpanMetrics {
        let processing_time = match registry.timer_with(
            SPAN_PROCESSING_TIME_METRIC,
            MetricOverrides::default().description("Elapsed time between span start and finish"),
        ) {
            Ok(metric) => Some(metric),
            Err(error) => {
                vantage_error!(
                    name: "Tracer.SpanMetricUnavailable",
                    error = error.to_string()
                );
                None
            }
        };
        SpanMetrics { processing_time }
    }

    pub(crate) fn record(&self, span: &FinishedSpan) {
        let Some(metric) = &self.processing_time else {
            return;
        };
        let mut tags = span.metric_tags.to_builder();
        tags.put("operation", span.operation_name.clone());
        tags.put("kind", span.kind.as_str());
        tags.put("error", span.is_failed());
        metric.with_tags(tags.build()).record(span.elapsed());
    }
}
