//! # Context propagation
//!
//! Contexts cross process boundaries through named **channels**, one set per
//! transport medium: HTTP-style text headers and length-delimited binary
//! streams. Each channel owns an ordered list of entries (trace/span
//! identifiers, tags, whatever else is registered), resolved by name from
//! the [`ExtensionRegistry`](crate::extension::ExtensionRegistry). The
//! channel named `"default"` is mandatory for both media.
//!
//! Channels are immutable after construction; reconfiguration builds new
//! channel maps and swaps them atomically while in-flight reads and writes
//! finish against the old ones.

mod b3;
mod binary;
mod http;

pub use b3::{B3Entry, B3SingleEntry};
pub use binary::{
    BinaryEntry, BinaryPropagator, ByteCarrier, ByteStreamReader, ByteStreamWriter,
    SpanBinaryEntry, TagsBinaryEntry, DEFAULT_MAX_OUTGOING_SIZE,
};
pub use http::{
    HeaderReader, HeaderWriter, HttpEntry, HttpPropagator, DEFAULT_TAGS_HEADER,
};

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extension::ExtensionRegistry;
use crate::vantage_error;

/// The default channel name, required for every medium.
pub const DEFAULT_CHANNEL: &str = "default";

type HttpChannels = HashMap<String, Arc<HttpPropagator>>;
type BinaryChannels = HashMap<String, Arc<BinaryPropagator>>;

/// The named propagation channels of both media.
pub struct Propagation {
    http: ArcSwap<HttpChannels>,
    binary: ArcSwap<BinaryChannels>,
}

impl Propagation {
    /// Builds all channels from the `propagation.*` section of a root-scoped
    /// configuration tree. A medium with no configured channels gets a
    /// built-in default (B3 span entry over HTTP; span + tags entries over
    /// binary); a medium with configured channels must include `"default"`.
    pub fn from_config(config: &Config, extensions: &ExtensionRegistry) -> Result<Propagation> {
        Ok(Propagation {
            http: ArcSwap::from_pointee(build_http_channels(config, extensions)?),
            binary: ArcSwap::from_pointee(build_binary_channels(config, extensions)?),
        })
    }

    /// Rebuilds every channel from `config` and swaps the maps atomically.
    /// On error the previous channels stay in place.
    pub fn reconfigure(&self, config: &Config, extensions: &ExtensionRegistry) -> Result<()> {
        let http = build_http_channels(config, extensions)?;
        let binary = build_binary_channels(config, extensions)?;
        self.http.store(Arc::new(http));
        self.binary.store(Arc::new(binary));
        Ok(())
    }

    /// The named HTTP channel, if configured.
    pub fn http(&self, channel: &str) -> Option<Arc<HttpPropagator>> {
        self.http.load().get(channel).cloned()
    }

    /// The default HTTP channel.
    pub fn http_default(&self) -> Arc<HttpPropagator> {
        self.http(DEFAULT_CHANNEL)
            .expect("construction validates that the default channel exists")
    }

    /// The named binary channel, if configured.
    pub fn binary(&self, channel: &str) -> Option<Arc<BinaryPropagator>> {
        self.binary.load().get(channel).cloned()
    }

    /// The default binary channel.
    pub fn binary_default(&self) -> Arc<BinaryPropagator> {
        self.binary(DEFAULT_CHANNEL)
            .expect("construction validates that the default channel exists")
    }
}

impl std::fmt::Debug for Propagation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Propagation")
            .field("http_channels", &self.http.load().len())
            .field("binary_channels", &self.binary.load().len())
            .finish()
    }
}

fn build_http_channels(
    config: &Config,
    extensions: &ExtensionRegistry,
) -> Result<HttpChannels> {
    let channels = config.keys("propagation.http");
    let mut map = HttpChannels::new();

    if channels.is_empty() {
        map.insert(
            DEFAULT_CHANNEL.to_owned(),
            Arc::new(default_http_channel(extensions)),
        );
        return Ok(map);
    }

    for channel in channels {
        let section = config.section(&format!("propagation.http.\"{channel}\""));
        let tags_header = section
            .string("tags.header-name")
            .unwrap_or_else(|| DEFAULT_TAGS_HEADER.to_owned());
        let mappings = section
            .keys("tags.mappings")
            .into_iter()
            .filter_map(|tag| {
                section
                    .string(&format!("tags.mappings.\"{tag}\""))
                    .map(|header| (tag, header))
            })
            .collect();
        let incoming = resolve_http_entries(&section, "entries.incoming", extensions);
        let outgoing = resolve_http_entries(&section, "entries.outgoing", extensions);
        map.insert(
            channel,
            Arc::new(HttpPropagator::new(tags_header, mappings, incoming, outgoing)),
        );
    }

    if !map.contains_key(DEFAULT_CHANNEL) {
        return Err(Error::MissingDefaultChannel { medium: "http" });
    }
    Ok(map)
}

fn resolve_http_entries(
    section: &Config,
    path: &str,
    extensions: &ExtensionRegistry,
) -> Vec<(String, Arc<dyn HttpEntry>)> {
    let mut entries = Vec::new();
    for key in section.keys(path) {
        let Some(entry_name) = section.string(&format!("{path}.\"{key}\"")) else {
            continue;
        };
        match extensions.http_entry(&entry_name) {
            Ok(entry) => entries.push((key, entry)),
            Err(error) => {
                vantage_error!(
                    name: "Propagation.HttpEntryInstantiationFailed",
                    entry = entry_name.as_str(),
                    context_key = key.as_str(),
                    error = error.to_string()
                );
            }
        }
    }
    entries
}

fn default_http_channel(extensions: &ExtensionRegistry) -> HttpPropagator {
    let entries: Vec<(String, Arc<dyn HttpEntry>)> = match extensions.http_entry("b3") {
        Ok(entry) => vec![("span".to_owned(), entry)],
        Err(_) => Vec::new(),
    };
    HttpPropagator::new(
        DEFAULT_TAGS_HEADER,
        Vec::new(),
        entries.clone(),
        entries,
    )
}

fn build_binary_channels(
    config: &Config,
    extensions: &ExtensionRegistry,
) -> Result<BinaryChannels> {
    let channels = config.keys("propagation.binary");
    let mut map = BinaryChannels::new();

    if channels.is_empty() {
        map.insert(
            DEFAULT_CHANNEL.to_owned(),
            Arc::new(default_binary_channel(extensions)),
        );
        return Ok(map);
    }

    for channel in channels {
        let section = config.section(&format!("propagation.binary.\"{channel}\""));
        let max_outgoing_size = section
            .i64("max-outgoing-size")
            .map(|size| size.max(0) as usize)
            .unwrap_or(DEFAULT_MAX_OUTGOING_SIZE);
        let incoming = resolve_binary_entries(&section, "entries.incoming", extensions);
        let outgoing = resolve_binary_entries(&section, "entries.outgoing", extensions);
        map.insert(
            channel,
            Arc::new(BinaryPropagator::new(max_outgoing_size, incoming, outgoing)),
        );
    }

    if !map.contains_key(DEFAULT_CHANNEL) {
        return Err(Error::MissingDefaultChannel { medium: "binary" });
    }
    Ok(map)
}

fn resolve_binary_entries(
    section: &Config,
    path: &str,
    extensions: &ExtensionRegistry,
) -> Vec<(String, Arc<dyn BinaryEntry>)> {
    let mut entries = Vec::new();
    for key in section.keys(path) {
        let Some(entry_name) = section.string(&format!("{path}.\"{key}\"")) else {
            continue;
        };
        match extensions.binary_entry(&entry_name) {
            Ok(entry) => entries.push((key, entry)),
            Err(error) => {
                vantage_error!(
                    name: "Propagation.BinaryEntryInstantiationFailed",
                    entry = entry_name.as_str(),
                    context_key = key.as_str(),
                    error = error.to_string()
                );
            }
        }
    }
    entries
}

fn default_binary_channel(extensions: &ExtensionRegistry) -> BinaryPropagator {
    let mut entries: Vec<(String, Arc<dyn BinaryEntry>)> = Vec::new();
    if let Ok(entry) = extensions.binary_entry("trace-span") {
        entries.push(("span".to_owned(), entry));
    }
    if let Ok(entry) = extensions.binary_entry("tags") {
        entries.push(("tags".to_owned(), entry));
    }
    BinaryPropagator::new(DEFAULT_MAX_OUTGOING_SIZE, entries.clone(), entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn empty_configuration_yields_working_defaults() {
        let extensions = ExtensionRegistry::with_builtins();
        let propagation = Propagation::from_config(&Config::empty(), &extensions).unwrap();
        assert!(propagation.http(DEFAULT_CHANNEL).is_some());
        assert!(propagation.binary(DEFAULT_CHANNEL).is_some());
        assert!(propagation.http("custom").is_none());
    }

    #[test]
    fn configured_channels_without_a_default_are_rejected() {
        let config = Config::from_yaml(
            r#"
propagation:
  http:
    internal:
      entries:
        incoming:
          span: b3
"#,
        )
        .unwrap();
        let extensions = ExtensionRegistry::with_builtins();
        let error = Propagation::from_config(&config, &extensions)
            .err()
            .expect("missing default channel must fail");
        match error {
            Error::MissingDefaultChannel { medium } => assert_eq!(medium, "http"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn channels_are_built_from_configuration() {
        let config = Config::from_yaml(
            r#"
propagation:
  http:
    default:
      tags:
        header-name: x-ctx-tags
        mappings:
          cid: X-Request-Id
      entries:
        incoming:
          span: b3-single
        outgoing:
          span: b3-single
  binary:
    default:
      max-outgoing-size: 128
      entries:
        incoming:
          span: trace-span
        outgoing:
          span: trace-span
"#,
        )
        .unwrap();
        let extensions = ExtensionRegistry::with_builtins();
        let propagation = Propagation::from_config(&config, &extensions).unwrap();

        let http = propagation.http_default();
        let mut headers: std::collections::HashMap<String, String> =
            std::collections::HashMap::new();
        http.write(
            &Context::new().with_tag("env", "prod").with_tag("cid", 7i64),
            &mut headers,
        );
        assert_eq!(headers.get("x-ctx-tags").unwrap(), "env=prod");
        assert_eq!(headers.get("X-Request-Id").unwrap(), "7");

        assert_eq!(propagation.binary_default().max_outgoing_size(), 128);
    }

    #[test]
    fn unknown_entry_names_are_skipped_not_fatal() {
        let config = Config::from_yaml(
            r#"
propagation:
  http:
    default:
      entries:
        incoming:
          span: com.example.MissingEntry
"#,
        )
        .unwrap();
        let extensions = ExtensionRegistry::with_builtins();
        let propagation = Propagation::from_config(&config, &extensions).unwrap();
        // The channel exists; the unresolvable entry was dropped.
        let headers: std::collections::HashMap<String, String> = std::collections::HashMap::new();
        let context = propagation.http_default().read(&headers, Context::new());
        assert!(context.span().is_empty());
    }

    #[test]
    fn reconfigure_replaces_channel_maps_atomically() {
        let extensions = ExtensionRegistry::with_builtins();
        let propagation = Propagation::from_config(&Config::empty(), &extensions).unwrap();

        let config = Config::from_yaml(
            r#"
propagation:
  binary:
    default:
      max-outgoing-size: 64
"#,
        )
        .unwrap();
        propagation.reconfigure(&config, &extensions).unwrap();
        assert_eq!(propagation.binary_default().max_outgoing_size(), 64);

        let broken = Config::from_yaml(
            r#"
propagation:
  binary:
    other: {}
"#,
        )
        .unwrap();
        assert!(propagation.reconfigure(&broken, &extensions).is_err());
        // The previous channels survive a failed reconfigure.
        assert_eq!(propagation.binary_default().max_outgoing_size(), 64);
    }
}
