//! Context propagation over HTTP-style text headers.
//!
//! A channel's propagator writes context tags into a single combined header
//! (`context-tags: k1=v1;k2=v2` by default, values percent-escaped) and runs
//! its configured entries in order. A mappings table can route individual
//! tags into dedicated headers instead; mapped tags are omitted from the
//! combined header, carry their raw rendering, and override combined values
//! on the way in.

use std::collections::HashMap;
use std::sync::Arc;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::context::Context;
use crate::tag::{TagSet, TagValue};
use crate::vantage_warn;

/// Header carrying the combined context tags unless remapped.
pub const DEFAULT_TAGS_HEADER: &str = "context-tags";

// Reserved encoding characters of the combined header. '%' must round-trip
// through the escaping itself.
const TAG_VALUE_ESCAPES: &AsciiSet = &CONTROLS.add(b';').add(b'=').add(b'%');

/// Read side of a text carrier, typically an HTTP header map.
pub trait HeaderReader {
    /// Reads a single header.
    fn read(&self, name: &str) -> Option<String>;

    /// Reads all headers.
    fn read_all(&self) -> HashMap<String, String>;
}

/// Write side of a text carrier.
pub trait HeaderWriter {
    /// Writes a single header.
    fn write(&mut self, name: &str, value: String);
}

impl<S: std::hash::BuildHasher> HeaderReader for HashMap<String, String, S> {
    fn read(&self, name: &str) -> Option<String> {
        self.get(name)
            .or_else(|| self.get(&name.to_lowercase()))
            .cloned()
    }

    fn read_all(&self) -> HashMap<String, String> {
        self.iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

impl<S: std::hash::BuildHasher> HeaderWriter for HashMap<String, String, S> {
    fn write(&mut self, name: &str, value: String) {
        self.insert(name.to_owned(), value);
    }
}

/// One logical dimension of a channel (trace/span identifiers, baggage, …),
/// bound to a context key by configuration. Implementations must be
/// stateless with respect to the channel; per-invocation state lives in
/// locals only.
pub trait HttpEntry: Send + Sync {
    /// Applies whatever the carrier holds for this entry onto `context`.
    fn read(&self, reader: &dyn HeaderReader, context: Context) -> Context {
        let _ = reader;
        context
    }

    /// Writes this entry's view of `context` onto the carrier.
    fn write(&self, context: &Context, writer: &mut dyn HeaderWriter) {
        let _ = (context, writer);
    }
}

/// An immutable, ordered composition of entries plus the tag-header rules
/// for one HTTP channel.
pub struct HttpPropagator {
    tags_header: String,
    /// tag key → dedicated header name
    mappings: Vec<(String, String)>,
    incoming: Vec<(String, Arc<dyn HttpEntry>)>,
    outgoing: Vec<(String, Arc<dyn HttpEntry>)>,
}

impl HttpPropagator {
    /// Creates a propagator from its parts. Entry order is preserved.
    pub fn new(
        tags_header: impl Into<String>,
        mappings: Vec<(String, String)>,
        incoming: Vec<(String, Arc<dyn HttpEntry>)>,
        outgoing: Vec<(String, Arc<dyn HttpEntry>)>,
    ) -> HttpPropagator {
        HttpPropagator {
            tags_header: tags_header.into(),
            mappings,
            incoming,
            outgoing,
        }
    }

    /// Reads the carrier onto `context`: the combined tag header first, then
    /// mapped tag headers, then each entry reader in declared order as a
    /// left-fold.
    pub fn read(&self, reader: &dyn HeaderReader, context: Context) -> Context {
        let context = self.read_tags(reader, context);
        self.incoming
            .iter()
            .fold(context, |context, (_, entry)| entry.read(reader, context))
    }

    /// Writes `context` onto the carrier: tag headers first, then each entry
    /// writer in declared order.
    pub fn write(&self, context: &Context, writer: &mut dyn HeaderWriter) {
        self.write_tags(context, writer);
        for (_, entry) in &self.outgoing {
            entry.write(context, writer);
        }
    }

    fn read_tags(&self, reader: &dyn HeaderReader, context: Context) -> Context {
        let mut tags = TagSet::builder();

        if let Some(combined) = reader.read(&self.tags_header) {
            for pair in combined.split(';').filter(|p| !p.is_empty()) {
                let Some((key, value)) = pair.split_once('=') else {
                    vantage_warn!(
                        name: "HttpPropagation.MalformedTagPair",
                        header = self.tags_header.as_str(),
                        pair = pair
                    );
                    continue;
                };
                let (key, value) = (unescape(key), unescape(value));
                tags.put(key, parse_tag_value(&value));
            }
        }

        // Mapped headers carry raw values and win over the combined header.
        for (tag_key, header) in &self.mappings {
            if let Some(value) = reader.read(header) {
                tags.put(tag_key.clone(), parse_tag_value(&value));
            }
        }

        let tags = tags.build();
        if tags.is_empty() {
            context
        } else {
            context.with_tags(tags)
        }
    }

    fn write_tags(&self, context: &Context, writer: &mut dyn HeaderWriter) {
        let mut combined = String::new();
        for (key, value) in context.tags().iter() {
            if let Some((_, header)) = self.mappings.iter().find(|(tag, _)| tag.as_str() == key) {
                writer.write(header, value.to_string());
                continue;
            }
            if !combined.is_empty() {
                combined.push(';');
            }
            combined.push_str(&escape(key));
            combined.push('=');
            combined.push_str(&escape(&value.to_string()));
        }
        if !combined.is_empty() {
            writer.write(&self.tags_header, combined);
        }
    }
}

fn escape(raw: &str) -> String {
    utf8_percent_encode(raw, TAG_VALUE_ESCAPES).to_string()
}

fn unescape(escaped: &str) -> String {
    percent_decode_str(escaped)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| escaped.to_owned())
}

/// Recovers the tag type lost by the textual encoding: booleans and longs
/// parse back into their typed forms, everything else stays a string.
fn parse_tag_value(raw: &str) -> TagValue {
    match raw {
        "true" => TagValue::Boolean(true),
        "false" => TagValue::Boolean(false),
        _ => match raw.parse::<i64>() {
            Ok(value) => TagValue::Long(value),
            Err(_) => TagValue::String(raw.to_owned()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn propagator_with_mappings(mappings: Vec<(String, String)>) -> HttpPropagator {
        HttpPropagator::new(DEFAULT_TAGS_HEADER, mappings, Vec::new(), Vec::new())
    }

    #[test]
    fn tags_travel_in_the_combined_header() {
        let propagator = propagator_with_mappings(Vec::new());
        let context = Context::new()
            .with_tag("env", "prod")
            .with_tag("retries", 3i64)
            .with_tag("cached", true);

        let mut headers: HashMap<String, String> = HashMap::new();
        propagator.write(&context, &mut headers);
        let combined = headers.get(DEFAULT_TAGS_HEADER).unwrap();
        assert!(combined.contains("env=prod"));
        assert!(combined.contains("retries=3"));
        assert!(combined.contains("cached=true"));

        let restored = propagator.read(&headers, Context::new());
        assert_eq!(restored.tags(), context.tags());
    }

    #[test]
    fn mapped_tags_use_their_own_header_and_skip_the_combined_one() {
        let propagator =
            propagator_with_mappings(vec![("cid".to_owned(), "X-Request-Id".to_owned())]);
        let context = Context::new()
            .with_tag("env", "prod")
            .with_tag("cid", 42i64);

        let mut headers: HashMap<String, String> = HashMap::new();
        propagator.write(&context, &mut headers);

        assert_eq!(headers.get(DEFAULT_TAGS_HEADER).unwrap(), "env=prod");
        assert_eq!(headers.get("X-Request-Id").unwrap(), "42");

        let restored = propagator.read(&headers, Context::new());
        assert_eq!(restored.tags().get_long("cid"), Some(42));
        assert_eq!(restored.tags().get_string("env"), Some("prod"));
    }

    #[test]
    fn mapped_headers_override_combined_values_on_read() {
        let propagator =
            propagator_with_mappings(vec![("cid".to_owned(), "X-Request-Id".to_owned())]);
        let mut headers: HashMap<String, String> = HashMap::new();
        headers.insert(DEFAULT_TAGS_HEADER.to_owned(), "cid=1;env=prod".to_owned());
        headers.insert("X-Request-Id".to_owned(), "2".to_owned());

        let context = propagator.read(&headers, Context::new());
        assert_eq!(context.tags().get_long("cid"), Some(2));
    }

    #[test]
    fn reserved_characters_are_escaped() {
        let propagator = propagator_with_mappings(Vec::new());
        let context = Context::new().with_tag("note", "a=b;c%d");

        let mut headers: HashMap<String, String> = HashMap::new();
        propagator.write(&context, &mut headers);
        let combined = headers.get(DEFAULT_TAGS_HEADER).unwrap();
        assert_eq!(combined, "note=a%3Db%3Bc%25d");

        let restored = propagator.read(&headers, Context::new());
        assert_eq!(restored.tags().get_string("note"), Some("a=b;c%d"));
    }

    #[test]
    fn malformed_pairs_are_skipped() {
        let propagator = propagator_with_mappings(Vec::new());
        let mut headers: HashMap<String, String> = HashMap::new();
        headers.insert(
            DEFAULT_TAGS_HEADER.to_owned(),
            "env=prod;not-a-pair;k=v".to_owned(),
        );
        let context = propagator.read(&headers, Context::new());
        assert_eq!(context.tags().len(), 2);
        assert_eq!(context.tags().get_string("env"), Some("prod"));
        assert_eq!(context.tags().get_string("k"), Some("v"));
    }

    #[test]
    fn an_empty_context_writes_no_tag_headers() {
        let propagator = propagator_with_mappings(Vec::new());
        let mut headers: HashMap<String, String> = HashMap::new();
        propagator.write(&Context::new(), &mut headers);
        assert!(headers.is_empty());
    }
}
