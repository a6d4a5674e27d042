//! # vantage
//!
//! An in-process observability runtime: applications link this library to
//! emit **metrics** (counters, gauges, histograms, timers, range samplers)
//! and **distributed traces** (spans stitched into traces), while a small
//! immutable [`Context`] flows across threads and across process boundaries
//! through pluggable text and binary carriers.
//!
//! ## Getting started
//!
//! ```no_run
//! use vantage::{Config, Runtime};
//! use vantage::tag::TagSet;
//!
//! let runtime = Runtime::new(Config::from_yaml(r#"
//! vantage:
//!   environment:
//!     service: billing
//!   trace:
//!     sampler: adaptive
//! "#)?)?;
//!
//! // Metrics
//! let requests = runtime.metrics().counter("requests")?;
//! requests.with_tags(TagSet::of("endpoint", "/users")).increment();
//!
//! // Traces
//! let tracer = runtime.tracer();
//! let span = tracer.span_builder("GET /users").start(tracer);
//! span.tag("http.status_code", 200i64);
//! span.finish();
//! # Ok::<(), vantage::Error>(())
//! ```
//!
//! ## Architecture
//!
//! * [`metrics`]: instrument cells and the name-indexed
//!   [`MetricRegistry`](metrics::MetricRegistry); reporters pull
//!   [`PeriodSnapshot`](metrics::PeriodSnapshot)s.
//! * [`trace`]: the [`Tracer`](trace::Tracer), sampling strategies and the
//!   bounded finished-span ring drained by reporters.
//! * [`context`]: the immutable [`Context`] and its thread-local storage.
//! * [`propagation`]: named channels reading/writing contexts onto
//!   HTTP-style and binary carriers.
//! * [`config`]: the YAML-backed configuration tree and reconfigure hub.
//! * [`runtime`]: the [`Runtime`] that owns and wires everything; no
//!   global singletons.
//!
//! The library never installs loggers, owns no network transport, and does
//! not persist anything; reporters are external collaborators polling
//! snapshots and spans on their own cadence.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod extension;
#[macro_use]
mod macros;
pub mod metrics;
pub mod propagation;
pub mod runtime;
pub mod scheduler;
pub mod tag;
pub mod trace;

pub use clock::Clock;
pub use config::{Config, ConfigHub};
pub use context::{Context, ContextGuard, ContextKey};
pub use error::{Error, Result};
pub use extension::ExtensionRegistry;
pub use runtime::{Environment, Runtime};
pub use tag::{TagSet, TagSetBuilder, TagValue};
