//! Error types for the visibility layer.
//!
//! Every variant except [`VisibilityError::Configuration`] describes a caller
//! contract violation, such as a missing context layer or a second cleanup.

use thiserror::Error;

/// Errors raised by the visibility layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VisibilityError {
    /// The context was never forked with a mutable layer.
    #[error("no mutable context found")]
    NoMutableContext,

    /// A required mutable context value is absent in the whole chain.
    #[error("failed to find the value for key '{key}'")]
    ValueNotFound { key: &'static str },

    /// A metric name was reused with a different unit.
    #[error("inconsistent units for metric {metric}: registered as '{registered}', got '{requested}'")]
    InconsistentUnit {
        metric: String,
        registered: String,
        requested: String,
    },

    /// No metric aggregator was attached to the context.
    #[error("no metric aggregator was attached")]
    NoMetricAggregator,

    /// Logging from a context without a logger.
    #[error("logging from a context without a logger")]
    NoLogger,

    /// The context does not carry a span created by `begin_span`.
    #[error("no span created by begin_span found in the context")]
    NoActiveSpan,

    /// Cleanup was called on a span that already ended.
    #[error("span '{0}' has already been finalized")]
    SpanAlreadyEnded(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type alias using `VisibilityError`
pub type Result<T> = std::result::Result<T, VisibilityError>;
