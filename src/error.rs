use thiserror::Error;

/// Result type returned by fallible `vantage` operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced at configuration and registration boundaries.
///
/// Hot-path operations (recording measurements, starting and finishing
/// spans, reading tags) never return errors; per the crate's degradation
/// policy they fall back to a documented behavior and log instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A metric name is already registered with a different instrument kind.
    #[error("metric `{name}` is already registered as a {existing}, cannot re-register as a {requested}")]
    MetricKindMismatch {
        /// The metric name in conflict.
        name: String,
        /// Kind of the already-registered metric.
        existing: &'static str,
        /// Kind requested by the failing call.
        requested: &'static str,
    },

    /// A propagation medium was configured without the mandatory "default" channel.
    #[error("{medium} propagation is configured but has no \"default\" channel")]
    MissingDefaultChannel {
        /// The affected medium, `"http"` or `"binary"`.
        medium: &'static str,
    },

    /// A user-named extension point could not be instantiated.
    #[error("cannot instantiate {kind} extension `{name}`: {reason}")]
    Instantiation {
        /// Extension category, e.g. `"sampler"`.
        kind: &'static str,
        /// The offending extension name.
        name: String,
        /// Why instantiation failed.
        reason: String,
    },

    /// A configuration value is missing or malformed.
    #[error("invalid configuration at `{path}`: {reason}")]
    Configuration {
        /// Dotted path of the offending key.
        path: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// An identifier could not be parsed from its textual or byte form.
    #[error("`{0}` is not a valid identifier")]
    InvalidIdentifier(String),
}

impl Error {
    pub(crate) fn configuration(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Configuration {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
