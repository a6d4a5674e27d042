//! Configuration tree and reconfiguration hub.
//!
//! A [`Config`] wraps a YAML document and exposes typed, dotted-path getters:
//! `config.string("trace.sampler")`, `config.duration("metric.tick-interval")`
//! and so on. Path segments containing dots can be double-quoted, as in
//! `metric.factory.custom-settings."span.processing-time".unit`.
//!
//! The [`ConfigHub`] holds the active tree behind an atomic pointer and fans
//! reconfigure events out to registered listeners; readers load a consistent
//! snapshot without taking locks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_yaml::Value;

use crate::error::{Error, Result};
use crate::vantage_warn;

/// An immutable configuration tree.
#[derive(Clone, Debug, Default)]
pub struct Config {
    root: Arc<Value>,
}

impl Config {
    /// The empty configuration.
    pub fn empty() -> Config {
        Config::default()
    }

    /// Parses a configuration tree from a YAML document.
    pub fn from_yaml(source: &str) -> Result<Config> {
        let root: Value = serde_yaml::from_str(source)
            .map_err(|e| Error::configuration("<root>", e.to_string()))?;
        match root {
            Value::Mapping(_) | Value::Null => Ok(Config {
                root: Arc::new(root),
            }),
            other => Err(Error::configuration(
                "<root>",
                format!("expected a mapping, found {}", type_name(&other)),
            )),
        }
    }

    /// Wraps an already-parsed YAML value.
    pub fn from_value(value: Value) -> Config {
        Config {
            root: Arc::new(value),
        }
    }

    /// Whether a value exists at `path`.
    pub fn has(&self, path: &str) -> bool {
        self.value(path).is_some()
    }

    /// Raw value lookup.
    pub fn value(&self, path: &str) -> Option<&Value> {
        let mut current: &Value = &self.root;
        for segment in split_path(path) {
            current = current.as_mapping()?.get(&Value::String(segment))?;
        }
        Some(current)
    }

    /// String value at `path`. Numbers and booleans are rendered.
    pub fn string(&self, path: &str) -> Option<String> {
        match self.value(path)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Integer value at `path`.
    pub fn i64(&self, path: &str) -> Option<i64> {
        match self.value(path)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Floating-point value at `path`.
    pub fn f64(&self, path: &str) -> Option<f64> {
        match self.value(path)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean value at `path`.
    pub fn bool(&self, path: &str) -> Option<bool> {
        match self.value(path)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim() {
                "true" | "yes" | "on" => Some(true),
                "false" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Duration value at `path`. Accepts `"300ms"`, `"10s"`, `"1m"`, `"2h"`
    /// and bare integers, which are read as milliseconds.
    pub fn duration(&self, path: &str) -> Option<Duration> {
        match self.value(path)? {
            Value::Number(n) => n.as_u64().map(Duration::from_millis),
            Value::String(s) => parse_duration(s),
            _ => None,
        }
    }

    /// List of strings at `path`. A scalar string reads as a one-element list.
    pub fn string_list(&self, path: &str) -> Vec<String> {
        match self.value(path) {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// Child key names of the mapping at `path`, in document order.
    pub fn keys(&self, path: &str) -> Vec<String> {
        match self.value(path) {
            Some(Value::Mapping(mapping)) => mapping
                .keys()
                .filter_map(|k| match k {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The subtree at `path` as its own [`Config`]; empty when absent.
    pub fn section(&self, path: &str) -> Config {
        match self.value(path) {
            Some(value) => Config {
                root: Arc::new(value.clone()),
            },
            None => Config::empty(),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Splits a dotted path into segments. Double-quoted segments may contain
/// dots: `custom-settings."span.processing-time".unit`.
fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in path.chars() {
        match ch {
            '"' => quoted = !quoted,
            '.' if !quoted => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    segments.push(current);
    segments.retain(|s| !s.is_empty());
    segments
}

/// Parses a human-readable duration: `"500us"`, `"300ms"`, `"10s"`, `"1m"`,
/// `"2h"`, or a bare integer read as milliseconds.
pub fn parse_duration(source: &str) -> Option<Duration> {
    let trimmed = source.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    match unit.trim() {
        "" | "ms" => Some(Duration::from_millis(amount)),
        "ns" => Some(Duration::from_nanos(amount)),
        "us" | "µs" => Some(Duration::from_micros(amount)),
        "s" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_secs(amount * 60)),
        "h" => Some(Duration::from_secs(amount * 3_600)),
        _ => None,
    }
}

struct Listener {
    id: u64,
    callback: Box<dyn Fn(&Config) + Send + Sync>,
}

/// Token returned by [`ConfigHub::on_reconfigure`]; pass it back to
/// [`ConfigHub::remove_listener`] to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

/// Holds the active configuration tree and fans out reconfigure events.
pub struct ConfigHub {
    current: ArcSwap<Config>,
    listeners: Mutex<Vec<Listener>>,
    next_id: AtomicU64,
}

impl ConfigHub {
    /// Creates a hub holding `initial` as the active tree.
    pub fn new(initial: Config) -> ConfigHub {
        ConfigHub {
            current: ArcSwap::from_pointee(initial),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The active configuration snapshot.
    pub fn current(&self) -> Arc<Config> {
        self.current.load_full()
    }

    /// Registers a listener invoked on every reconfigure, in registration
    /// order. A panicking listener is logged and skipped; the remaining
    /// listeners still run.
    pub fn on_reconfigure(
        &self,
        callback: impl Fn(&Config) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_listeners().push(Listener {
            id,
            callback: Box::new(callback),
        });
        ListenerHandle(id)
    }

    /// Removes a previously registered listener.
    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.lock_listeners().retain(|l| l.id != handle.0);
    }

    /// Swaps the active tree and notifies listeners.
    pub fn reconfigure(&self, config: Config) {
        self.current.store(Arc::new(config.clone()));
        let listeners = self.lock_listeners();
        for listener in listeners.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| (listener.callback)(&config)));
            if outcome.is_err() {
                vantage_warn!(name: "ConfigHub.ListenerPanicked", listener_id = listener.id);
            }
        }
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConfigHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHub").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const SAMPLE: &str = r#"
trace:
  sampler: adaptive
  reporter-queue-size: 1024
  adaptive-sampler:
    throughput: 600
metric:
  tick-interval: 60s
  factory:
    custom-settings:
      "span.processing-time":
        unit: ns
environment:
  tags:
    team: billing
"#;

    #[test]
    fn typed_lookups() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.string("trace.sampler").as_deref(), Some("adaptive"));
        assert_eq!(config.i64("trace.reporter-queue-size"), Some(1024));
        assert_eq!(config.f64("trace.adaptive-sampler.throughput"), Some(600.0));
        assert_eq!(
            config.duration("metric.tick-interval"),
            Some(Duration::from_secs(60))
        );
        assert_eq!(config.string("missing.path"), None);
    }

    #[test]
    fn quoted_segments_keep_their_dots() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(
            config
                .string("metric.factory.custom-settings.\"span.processing-time\".unit")
                .as_deref(),
            Some("ns")
        );
    }

    #[test]
    fn sections_scope_lookups() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let trace = config.section("trace");
        assert_eq!(trace.string("sampler").as_deref(), Some("adaptive"));
        assert_eq!(trace.keys("adaptive-sampler"), vec!["throughput"]);
    }

    #[rustfmt::skip]
    #[test]
    fn duration_formats() {
        for (input, expected) in [
            ("250ms", Duration::from_millis(250)),
            ("10s", Duration::from_secs(10)),
            ("1m", Duration::from_secs(60)),
            ("2h", Duration::from_secs(7200)),
            ("500us", Duration::from_micros(500)),
            ("42", Duration::from_millis(42)),
        ] {
            assert_eq!(parse_duration(input), Some(expected), "{input}");
        }
        assert_eq!(parse_duration("ten seconds"), None);
    }

    #[test]
    fn hub_notifies_listeners_in_order_even_when_one_panics() {
        let hub = ConfigHub::new(Config::empty());
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = calls.clone();
        hub.on_reconfigure(move |_| {
            seen.fetch_add(1, Ordering::Relaxed);
        });
        hub.on_reconfigure(|_| panic!("listener exploded"));
        let seen = calls.clone();
        hub.on_reconfigure(move |_| {
            seen.fetch_add(1, Ordering::Relaxed);
        });

        hub.reconfigure(Config::from_yaml("trace: {sampler: always}").unwrap());
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(
            hub.current().string("trace.sampler").as_deref(),
            Some("always")
        );
    }

    #[test]
    fn removed_listeners_stop_firing() {
        let hub = ConfigHub::new(Config::empty());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handle = hub.on_reconfigure(move |_| {
            seen.fetch_add(1, Ordering::Relaxed);
        });

        hub.reconfigure(Config::empty());
        hub.remove_listener(handle);
        hub.reconfigure(Config::empty());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
