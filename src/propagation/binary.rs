//! Context propagation over length-delimited binary carriers.
//!
//! A binary channel writes its entries as entry-id-tagged frames: one byte
//! of entry id, a big-endian `u16` payload length, then the payload. The
//! entry id is the entry's position in the channel's configured entry list,
//! so both peers must declare the channel the same way. The writer is
//! all-or-nothing: when the encoded frames exceed the channel's
//! `max-outgoing-size` nothing is written and a warning is logged; partial
//! contexts never travel.

use std::sync::Arc;

use crate::context::Context;
use crate::tag::{TagSet, TagValue};
use crate::trace::{Identifier, SamplingDecision, Span, Trace};
use crate::vantage_warn;

/// Default cap on the total encoded size of an outgoing context.
pub const DEFAULT_MAX_OUTGOING_SIZE: usize = 2048;

const FRAME_HEADER_SIZE: usize = 3;

/// Read side of a binary carrier.
pub trait ByteStreamReader {
    /// Reads up to `buf.len()` bytes, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Reads everything remaining.
    fn read_all(&mut self) -> Vec<u8>;
}

/// Write side of a binary carrier.
pub trait ByteStreamWriter {
    /// Appends `bytes` to the carrier.
    fn write(&mut self, bytes: &[u8]);
}

impl ByteStreamWriter for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// A growable in-memory carrier, usable on both sides of a hop.
#[derive(Clone, Debug, Default)]
pub struct ByteCarrier {
    buffer: Vec<u8>,
    position: usize,
}

impl ByteCarrier {
    /// An empty carrier.
    pub fn new() -> ByteCarrier {
        ByteCarrier::default()
    }

    /// A carrier holding received bytes.
    pub fn from_bytes(buffer: Vec<u8>) -> ByteCarrier {
        ByteCarrier {
            buffer,
            position: 0,
        }
    }

    /// The bytes written so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consumes the carrier into its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl ByteStreamReader for ByteCarrier {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let remaining = &self.buffer[self.position.min(self.buffer.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        n
    }

    fn read_all(&mut self) -> Vec<u8> {
        let remaining = self.buffer[self.position.min(self.buffer.len())..].to_vec();
        self.position = self.buffer.len();
        remaining
    }
}

impl ByteStreamWriter for ByteCarrier {
    fn write(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }
}

/// One logical dimension of a binary channel. Implementations are stateless
/// with respect to the channel.
pub trait BinaryEntry: Send + Sync {
    /// Applies a received payload onto `context`.
    fn read(&self, payload: &[u8], context: Context) -> Context;

    /// Encodes this entry's view of `context`, or `None` when there is
    /// nothing to write.
    fn write(&self, context: &Context) -> Option<Vec<u8>>;
}

/// An immutable, ordered composition of entries for one binary channel.
pub struct BinaryPropagator {
    max_outgoing_size: usize,
    incoming: Vec<(String, Arc<dyn BinaryEntry>)>,
    outgoing: Vec<(String, Arc<dyn BinaryEntry>)>,
}

impl BinaryPropagator {
    /// Creates a propagator from its parts. Entry order determines frame
    /// ids.
    pub fn new(
        max_outgoing_size: usize,
        incoming: Vec<(String, Arc<dyn BinaryEntry>)>,
        outgoing: Vec<(String, Arc<dyn BinaryEntry>)>,
    ) -> BinaryPropagator {
        BinaryPropagator {
            max_outgoing_size: max_outgoing_size.max(FRAME_HEADER_SIZE),
            incoming,
            outgoing,
        }
    }

    /// The configured outgoing size cap.
    pub fn max_outgoing_size(&self) -> usize {
        self.max_outgoing_size
    }

    /// Reads all frames from the carrier onto `context`, dispatching each to
    /// the incoming entry at the frame's id. Unknown ids are skipped; a
    /// truncated frame stops the walk.
    pub fn read(&self, reader: &mut dyn ByteStreamReader, context: Context) -> Context {
        let bytes = reader.read_all();
        let mut context = context;
        let mut at = 0usize;
        while at + FRAME_HEADER_SIZE <= bytes.len() {
            let id = bytes[at] as usize;
            let length = u16::from_be_bytes([bytes[at + 1], bytes[at + 2]]) as usize;
            let start = at + FRAME_HEADER_SIZE;
            let end = start + length;
            if end > bytes.len() {
                vantage_warn!(
                    name: "BinaryPropagation.TruncatedFrame",
                    entry_id = id,
                    declared_length = length
                );
                break;
            }
            if let Some((_, entry)) = self.incoming.get(id) {
                context = entry.read(&bytes[start..end], context);
            }
            at = end;
        }
        context
    }

    /// Encodes every outgoing entry and writes the frames, or nothing at all
    /// when the total exceeds the channel's size cap.
    pub fn write(&self, context: &Context, writer: &mut dyn ByteStreamWriter) {
        let mut frames: Vec<(u8, Vec<u8>)> = Vec::new();
        for (id, (name, entry)) in self.outgoing.iter().enumerate() {
            let Some(payload) = entry.write(context) else {
                continue;
            };
            if payload.len() > u16::MAX as usize {
                vantage_warn!(
                    name: "BinaryPropagation.EntryTooLarge",
                    entry = name.as_str(),
                    size = payload.len()
                );
                return;
            }
            frames.push((id as u8, payload));
        }
        if frames.is_empty() {
            return;
        }

        let total: usize = frames
            .iter()
            .map(|(_, payload)| FRAME_HEADER_SIZE + payload.len())
            .sum();
        if total > self.max_outgoing_size {
            vantage_warn!(
                name: "BinaryPropagation.ContextTooLarge",
                encoded_size = total,
                max_outgoing_size = self.max_outgoing_size
            );
            return;
        }

        for (id, payload) in frames {
            writer.write(&[id]);
            writer.write(&(payload.len() as u16).to_be_bytes());
            writer.write(&payload);
        }
    }
}

/// Binary rendition of the span context key: trace, span and parent
/// identifiers plus the sampling decision.
#[derive(Debug, Default)]
pub struct SpanBinaryEntry {
    _private: (),
}

impl BinaryEntry for SpanBinaryEntry {
    fn read(&self, payload: &[u8], context: Context) -> Context {
        let mut at = 0usize;
        let Some(trace_id) = take_identifier(payload, &mut at) else {
            return context;
        };
        let Some(span_id) = take_identifier(payload, &mut at) else {
            return context;
        };
        let Some(parent_id) = take_identifier(payload, &mut at) else {
            return context;
        };
        let decision = match payload.get(at) {
            Some(1) => SamplingDecision::Sample,
            Some(2) => SamplingDecision::DoNotSample,
            _ => SamplingDecision::Unknown,
        };
        if span_id.is_empty() || trace_id.is_empty() {
            return context;
        }
        context.with_span(Span::remote(
            span_id,
            parent_id,
            Trace::new(trace_id, decision),
        ))
    }

    fn write(&self, context: &Context) -> Option<Vec<u8>> {
        let span = context.span();
        if span.is_empty() {
            return None;
        }
        let mut payload = Vec::with_capacity(35);
        put_identifier(&mut payload, &span.trace().id);
        put_identifier(&mut payload, span.id());
        put_identifier(&mut payload, span.parent_id());
        payload.push(match span.trace().decision {
            SamplingDecision::Sample => 1,
            SamplingDecision::DoNotSample => 2,
            SamplingDecision::Unknown => 0,
        });
        Some(payload)
    }
}

fn put_identifier(payload: &mut Vec<u8>, id: &Identifier) {
    payload.push(id.len() as u8);
    payload.extend_from_slice(id.bytes());
}

fn take_identifier(payload: &[u8], at: &mut usize) -> Option<Identifier> {
    let length = *payload.get(*at)? as usize;
    *at += 1;
    if length == 0 {
        return Some(Identifier::empty());
    }
    let bytes = payload.get(*at..*at + length)?;
    *at += length;
    Identifier::from_bytes(bytes).ok()
}

/// Binary rendition of the context tags.
#[derive(Debug, Default)]
pub struct TagsBinaryEntry {
    _private: (),
}

const TAG_TYPE_STRING: u8 = 0;
const TAG_TYPE_LONG: u8 = 1;
const TAG_TYPE_BOOLEAN: u8 = 2;

impl BinaryEntry for TagsBinaryEntry {
    fn read(&self, payload: &[u8], context: Context) -> Context {
        let mut tags = TagSet::builder();
        let mut at = 0usize;
        while at < payload.len() {
            let Some(key) = take_string(payload, &mut at) else {
                break;
            };
            let Some(kind) = payload.get(at).copied() else {
                break;
            };
            at += 1;
            let value = match kind {
                TAG_TYPE_STRING => match take_string(payload, &mut at) {
                    Some(value) => TagValue::String(value),
                    None => break,
                },
                TAG_TYPE_LONG => match payload.get(at..at + 8) {
                    Some(bytes) => {
                        at += 8;
                        TagValue::Long(i64::from_be_bytes(
                            bytes.try_into().expect("slice is 8 bytes"),
                        ))
                    }
                    None => break,
                },
                TAG_TYPE_BOOLEAN => match payload.get(at).copied() {
                    Some(byte) => {
                        at += 1;
                        TagValue::Boolean(byte != 0)
                    }
                    None => break,
                },
                _ => break,
            };
            tags.put(key, value);
        }
        let tags = tags.build();
        if tags.is_empty() {
            context
        } else {
            context.with_tags(tags)
        }
    }

    fn write(&self, context: &Context) -> Option<Vec<u8>> {
        let tags = context.tags();
        if tags.is_empty() {
            return None;
        }
        let mut payload = Vec::new();
        for (key, value) in tags.iter() {
            put_string(&mut payload, key);
            match value {
                TagValue::String(value) => {
                    payload.push(TAG_TYPE_STRING);
                    put_string(&mut payload, value);
                }
                TagValue::Long(value) => {
                    payload.push(TAG_TYPE_LONG);
                    payload.extend_from_slice(&value.to_be_bytes());
                }
                TagValue::Boolean(value) => {
                    payload.push(TAG_TYPE_BOOLEAN);
                    payload.push(u8::from(*value));
                }
            }
        }
        Some(payload)
    }
}

fn put_string(payload: &mut Vec<u8>, value: &str) {
    let length = value.len().min(u16::MAX as usize) as u16;
    payload.extend_from_slice(&length.to_be_bytes());
    payload.extend_from_slice(&value.as_bytes()[..length as usize]);
}

fn take_string(payload: &[u8], at: &mut usize) -> Option<String> {
    let length_bytes = payload.get(*at..*at + 2)?;
    let length = u16::from_be_bytes(length_bytes.try_into().expect("slice is 2 bytes")) as usize;
    *at += 2;
    let bytes = payload.get(*at..*at + length)?;
    *at += length;
    String::from_utf8(bytes.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_propagator(max_outgoing_size: usize) -> BinaryPropagator {
        let entries: Vec<(String, Arc<dyn BinaryEntry>)> = vec![
            ("span".to_owned(), Arc::new(SpanBinaryEntry::default())),
            ("tags".to_owned(), Arc::new(TagsBinaryEntry::default())),
        ];
        BinaryPropagator::new(max_outgoing_size, entries.clone(), entries)
    }

    fn remote_context() -> Context {
        Context::new()
            .with_span(Span::remote(
                Identifier::from_hex("00f067aa0ba902b7").unwrap(),
                Identifier::empty(),
                Trace::new(
                    Identifier::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
                    SamplingDecision::Sample,
                ),
            ))
            .with_tag("env", "prod")
            .with_tag("retries", 7i64)
            .with_tag("cached", false)
    }

    #[test]
    fn frames_round_trip_span_and_tags() {
        let propagator = default_propagator(DEFAULT_MAX_OUTGOING_SIZE);
        let context = remote_context();

        let mut carrier = ByteCarrier::new();
        propagator.write(&context, &mut carrier);
        assert!(!carrier.bytes().is_empty());

        let restored = propagator.read(&mut carrier.clone(), Context::new());
        assert_eq!(restored.span().id(), context.span().id());
        assert_eq!(restored.span().trace(), context.span().trace());
        assert_eq!(restored.tags(), context.tags());
    }

    #[test]
    fn oversized_contexts_write_nothing() {
        let propagator = default_propagator(32);
        let mut context = remote_context();
        for idx in 0..50 {
            context = context.with_tag(format!("padding-{idx}"), "x".repeat(32));
        }

        let mut carrier = ByteCarrier::new();
        propagator.write(&context, &mut carrier);
        assert!(carrier.bytes().is_empty());
    }

    #[test]
    fn an_empty_context_writes_nothing() {
        let propagator = default_propagator(DEFAULT_MAX_OUTGOING_SIZE);
        let mut carrier = ByteCarrier::new();
        propagator.write(&Context::new(), &mut carrier);
        assert!(carrier.bytes().is_empty());
    }

    #[test]
    fn truncated_frames_stop_the_walk_without_panicking() {
        let propagator = default_propagator(DEFAULT_MAX_OUTGOING_SIZE);
        let mut carrier = ByteCarrier::new();
        propagator.write(&remote_context(), &mut carrier);

        let mut bytes = carrier.into_bytes();
        bytes.truncate(bytes.len() - 4);
        let mut truncated = ByteCarrier::from_bytes(bytes);
        // The span frame is intact, the tags frame is cut short.
        let restored = propagator.read(&mut truncated, Context::new());
        assert!(!restored.span().is_empty());
    }

    #[test]
    fn unknown_frame_ids_are_skipped() {
        let propagator = default_propagator(DEFAULT_MAX_OUTGOING_SIZE);
        let mut bytes = vec![9u8, 0, 2, 0xAA, 0xBB];
        let mut tags_frame = TagsBinaryEntry::default()
            .write(&Context::new().with_tag("env", "prod"))
            .unwrap();
        bytes.push(1);
        bytes.extend_from_slice(&(tags_frame.len() as u16).to_be_bytes());
        bytes.append(&mut tags_frame);

        let restored =
            propagator.read(&mut ByteCarrier::from_bytes(bytes), Context::new());
        assert_eq!(restored.tags().get_string("env"), Some("prod"));
    }

    #[test]
    fn reader_reads_in_chunks() {
        let mut carrier = ByteCarrier::from_bytes(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 2];
        assert_eq!(carrier.read(&mut buf), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(carrier.read_all(), vec![3, 4, 5]);
        assert_eq!(carrier.read(&mut buf), 0);
    }
}
