//! B3 trace/span propagation entries.
//!
//! Two renditions exist: [`B3Entry`] uses the classic multi-header layout
//! (`X-B3-TraceId`, `X-B3-SpanId`, `X-B3-ParentSpanId`, `X-B3-Sampled`) and
//! [`B3SingleEntry`] packs the same fields into the single `b3` header as
//! `{trace}-{span}[-{sampled}[-{parent}]]`. Both are registered as
//! propagation entries under the names `b3` and `b3-single`; channels accept
//! any entry by name and the core never hard-codes a header format.

use crate::context::Context;
use crate::propagation::http::{HeaderReader, HeaderWriter, HttpEntry};
use crate::trace::{Identifier, SamplingDecision, Span, Trace};

const TRACE_ID_HEADER: &str = "X-B3-TraceId";
const SPAN_ID_HEADER: &str = "X-B3-SpanId";
const PARENT_SPAN_ID_HEADER: &str = "X-B3-ParentSpanId";
const SAMPLED_HEADER: &str = "X-B3-Sampled";
const B3_SINGLE_HEADER: &str = "b3";

fn decision_from(flag: Option<&str>) -> SamplingDecision {
    match flag {
        Some("1") | Some("true") | Some("d") => SamplingDecision::Sample,
        Some("0") | Some("false") => SamplingDecision::DoNotSample,
        _ => SamplingDecision::Unknown,
    }
}

fn decision_flag(decision: SamplingDecision) -> Option<&'static str> {
    match decision {
        SamplingDecision::Sample => Some("1"),
        SamplingDecision::DoNotSample => Some("0"),
        SamplingDecision::Unknown => None,
    }
}

/// B3 multi-header reader/writer for the span context key.
#[derive(Debug, Default)]
pub struct B3Entry {
    _private: (),
}

impl HttpEntry for B3Entry {
    fn read(&self, reader: &dyn HeaderReader, context: Context) -> Context {
        let Some(trace_hex) = reader.read(TRACE_ID_HEADER) else {
            return context;
        };
        let Some(span_hex) = reader.read(SPAN_ID_HEADER) else {
            return context;
        };
        let (Ok(trace_id), Ok(span_id)) = (
            Identifier::from_hex(trace_hex.trim()),
            Identifier::from_hex(span_hex.trim()),
        ) else {
            return context;
        };

        let parent_id = reader
            .read(PARENT_SPAN_ID_HEADER)
            .and_then(|hex| Identifier::from_hex(hex.trim()).ok())
            .unwrap_or_else(Identifier::empty);
        let decision = decision_from(reader.read(SAMPLED_HEADER).as_deref());

        context.with_span(Span::remote(
            span_id,
            parent_id,
            Trace::new(trace_id, decision),
        ))
    }

    fn write(&self, context: &Context, writer: &mut dyn HeaderWriter) {
        let span = context.span();
        if span.is_empty() {
            return;
        }
        writer.write(TRACE_ID_HEADER, span.trace().id.hex().to_owned());
        writer.write(SPAN_ID_HEADER, span.id().hex().to_owned());
        if !span.parent_id().is_empty() {
            writer.write(PARENT_SPAN_ID_HEADER, span.parent_id().hex().to_owned());
        }
        if let Some(flag) = decision_flag(span.trace().decision) {
            writer.write(SAMPLED_HEADER, flag.to_owned());
        }
    }
}

/// B3 single-header reader/writer for the span context key.
#[derive(Debug, Default)]
pub struct B3SingleEntry {
    _private: (),
}

impl HttpEntry for B3SingleEntry {
    fn read(&self, reader: &dyn HeaderReader, context: Context) -> Context {
        let Some(header) = reader.read(B3_SINGLE_HEADER) else {
            return context;
        };
        let parts: Vec<&str> = header.trim().split('-').collect();
        if parts.len() < 2 {
            return context;
        }
        let (Ok(trace_id), Ok(span_id)) =
            (Identifier::from_hex(parts[0]), Identifier::from_hex(parts[1]))
        else {
            return context;
        };
        let decision = decision_from(parts.get(2).copied());
        let parent_id = parts
            .get(3)
            .and_then(|hex| Identifier::from_hex(hex).ok())
            .unwrap_or_else(Identifier::empty);

        context.with_span(Span::remote(
            span_id,
            parent_id,
            Trace::new(trace_id, decision),
        ))
    }

    fn write(&self, context: &Context, writer: &mut dyn HeaderWriter) {
        let span = context.span();
        if span.is_empty() {
            return;
        }
        let mut header = format!("{}-{}", span.trace().id.hex(), span.id().hex());
        if let Some(flag) = decision_flag(span.trace().decision) {
            header.push('-');
            header.push_str(flag);
            if !span.parent_id().is_empty() {
                header.push('-');
                header.push_str(span.parent_id().hex());
            }
        }
        writer.write(B3_SINGLE_HEADER, header);
    }
}
