//! Request-scoped observability helpers.
//!
//! Builds on `opentelemetry::Context` to give request handlers a mutable
//! value store, spans that count their own Success/Error/Fault outcome,
//! per-request metric aggregation and context-carried structured logging.

#![warn(clippy::pedantic)]

/// Module for error types
pub mod error;

/// Module for observer and logging configuration
pub mod config;

/// Module for mutable values layered over the propagation context
pub mod mutable_context;

/// Module for metric units
pub mod units;

/// Module for the meter abstraction and its `metrics` facade adapter
pub mod meter;

/// Module for the tracer abstraction and its OpenTelemetry adapter
pub mod tracer;

/// Module for trace and span id generation
pub mod ids;

/// Module for per-request metric aggregation
pub mod aggregator;

/// Module for context-carried structured logging
pub mod logging;

/// Module for canary request marking
pub mod canary;

/// Module for the observer bundling tracer, meter and root logger
pub mod observer;

/// Module for the span lifecycle wrapper and leak detection
pub mod span;

/// Module for span start and end options
pub mod span_config;

mod panic_record;

/// Module for recording collaborators used in tests
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use aggregator::{MetricAggregator, NamedMetric};
pub use error::{Result, VisibilityError};
pub use observer::Observer;
pub use span::{
    begin_span, begin_span_with_config, cleanup_current, current_span, in_span, WrappedSpan,
};
pub use span_config::{EndOptions, SpanConfig, StartOptions};
