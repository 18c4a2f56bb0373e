//! Context-carried structured logging.
//!
//! A [`Logger`] is a named `tracing` span plus the structured fields attached
//! to it. Code logs through the logger found in its context:
//!
//! ```rust
//! use opentelemetry::Context;
//! use visibility::logging::{self, Logger};
//!
//! let cx = logging::imbue(&Context::new(), Logger::root("billing"));
//! logging::logger(&cx).unwrap().in_scope(|| tracing::info!("charged"));
//! ```
//!
//! Subscriber installation happens once per process through [`init`].

use crate::config::LoggingConfig;
use crate::error::{Result, VisibilityError};
use opentelemetry::trace::SpanContext;
use opentelemetry::Context;
use std::sync::OnceLock;
use tracing::field::Empty;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log field carrying the Datadog-formatted trace id.
pub const DD_TRACE_ID: &str = "dd.trace_id";
/// Log field carrying the Datadog-formatted span id.
pub const DD_SPAN_ID: &str = "dd.span_id";

/// A named logger with structured fields.
#[derive(Debug, Clone)]
pub struct Logger {
    name: String,
    fields: Vec<(String, String)>,
    span: tracing::Span,
}

impl Logger {
    /// A top-level logger. An empty name leaves the logger unnamed.
    pub fn root(name: impl Into<String>) -> Self {
        let name = name.into();
        let span = tracing::info_span!(
            "logger",
            logger = %name,
            dd.trace_id = Empty,
            dd.span_id = Empty,
            extra = Empty,
        );
        Self {
            name,
            fields: Vec::new(),
            span,
        }
    }

    /// A child logger whose name is `<parent>.<name>`, or just `name` when
    /// the parent is unnamed.
    pub fn named(&self, name: &str) -> Self {
        let full = if self.name.is_empty() {
            name.to_owned()
        } else if name.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{name}", self.name)
        };
        self.derive(full, self.fields.clone())
    }

    /// A child logger carrying `fields` in addition to the current ones.
    pub fn with_fields<K, V>(&self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut all = self.fields.clone();
        for (key, value) in fields {
            let key = key.into();
            let value = value.into();
            match all.iter_mut().find(|(k, _)| *k == key) {
                Some(existing) => existing.1 = value,
                None => all.push((key, value)),
            }
        }
        self.derive(self.name.clone(), all)
    }

    fn derive(&self, name: String, fields: Vec<(String, String)>) -> Self {
        // Each span carries the full field set; no parent link.
        let span = tracing::info_span!(
            parent: None,
            "logger",
            logger = %name,
            dd.trace_id = Empty,
            dd.span_id = Empty,
            extra = Empty,
        );

        let mut extra = Vec::new();
        for (key, value) in &fields {
            match key.as_str() {
                DD_TRACE_ID => {
                    span.record(DD_TRACE_ID, value.as_str());
                }
                DD_SPAN_ID => {
                    span.record(DD_SPAN_ID, value.as_str());
                }
                _ => extra.push(format!("{key}={value}")),
            }
        }
        if !extra.is_empty() {
            span.record("extra", extra.join(" ").as_str());
        }

        Self { name, fields, span }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// The value of field `key`, if set.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The backing span; enter it to attach events to this logger.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Run `f` with this logger's span entered.
    pub fn in_scope<F: FnOnce() -> T, T>(&self, f: F) -> T {
        self.span.in_scope(f)
    }
}

#[derive(Clone)]
struct LoggerLayer(Logger);

/// Derive a context carrying `logger`.
pub fn imbue(cx: &Context, logger: Logger) -> Context {
    cx.with_value(LoggerLayer(logger))
}

/// The logger attached to `cx`, if any.
pub fn try_logger(cx: &Context) -> Option<Logger> {
    cx.get::<LoggerLayer>().map(|layer| layer.0.clone())
}

/// The logger attached to `cx`.
///
/// # Errors
///
/// Returns `VisibilityError::NoLogger` if nothing upstream attached one.
pub fn logger(cx: &Context) -> Result<Logger> {
    try_logger(cx).ok_or(VisibilityError::NoLogger)
}

/// Derive a context whose logger carries extra `fields`.
///
/// # Errors
///
/// Returns `VisibilityError::NoLogger` if `cx` has no logger.
pub fn with_fields<K, V>(
    cx: &Context,
    fields: impl IntoIterator<Item = (K, V)>,
) -> Result<Context>
where
    K: Into<String>,
    V: Into<String>,
{
    let derived = logger(cx)?.with_fields(fields);
    Ok(imbue(cx, derived))
}

/// Datadog log correlation fields for a span.
///
/// Datadog expects the low 64 bits of the trace id and the span id as
/// unsigned decimals. Invalid span contexts produce no fields.
pub fn datadog_log_fields(span_context: &SpanContext) -> Vec<(String, String)> {
    if !span_context.is_valid() {
        return Vec::new();
    }

    #[allow(clippy::cast_possible_truncation)]
    let low = u128::from_be_bytes(span_context.trace_id().to_bytes()) as u64;

    vec![
        (DD_TRACE_ID.to_owned(), low.to_string()),
        (
            DD_SPAN_ID.to_owned(),
            u64::from_be_bytes(span_context.span_id().to_bytes()).to_string(),
        ),
    ]
}

static INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Install the process-wide `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.level` when set. Only the first call installs
/// anything; every later call returns the first call's outcome.
///
/// # Errors
///
/// Returns `VisibilityError::Configuration` if the filter is invalid or
/// another subscriber was already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    INIT.get_or_init(|| install(config))
        .clone()
        .map_err(VisibilityError::Configuration)
}

fn install(config: &LoggingConfig) -> std::result::Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| format!("invalid log filter '{}': {e}", config.level))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    installed.map_err(|e| format!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::MemorySink;
    use opentelemetry::trace::{SpanId, TraceFlags, TraceId, TraceState};

    fn span_context(trace: &str, span: &str) -> SpanContext {
        SpanContext::new(
            TraceId::from_hex(trace).unwrap(),
            SpanId::from_hex(span).unwrap(),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        )
    }

    #[test]
    fn test_datadog_fields_use_low_64_bits() {
        let sc = span_context("f1405ced8b9968baf9109259515bf702", "5a291b00ff7bfd6a");
        let fields = datadog_log_fields(&sc);

        assert_eq!(
            fields,
            vec![
                (DD_TRACE_ID.to_owned(), "17947005427386152706".to_owned()),
                (DD_SPAN_ID.to_owned(), "6496753628558916970".to_owned()),
            ]
        );
    }

    #[test]
    fn test_datadog_fields_skip_invalid_context() {
        assert!(datadog_log_fields(&SpanContext::empty_context()).is_empty());
    }

    #[test]
    fn test_named_and_fields_compose() {
        let root = Logger::root("");
        let op = root.named("TestSpan").with_fields([("a", "1")]);
        let nested = op.named("inner").with_fields([("a", "2"), ("b", "3")]);

        assert_eq!(op.name(), "TestSpan");
        assert_eq!(nested.name(), "TestSpan.inner");
        assert_eq!(nested.field("a"), Some("2"));
        assert_eq!(nested.field("b"), Some("3"));
        assert_eq!(op.field("b"), None);
    }

    #[test]
    fn test_context_without_logger() {
        let cx = Context::new();
        assert!(try_logger(&cx).is_none());
        assert_eq!(logger(&cx).unwrap_err(), VisibilityError::NoLogger);
        assert_eq!(
            with_fields(&cx, [("k", "v")]).unwrap_err(),
            VisibilityError::NoLogger
        );
    }

    #[test]
    fn test_events_carry_logger_fields() {
        let sink = MemorySink::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(sink.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let cx = imbue(&Context::new(), Logger::root(""));
            let cx = with_fields(&cx, [(DD_TRACE_ID, "42"), ("tenant", "acme")]).unwrap();
            logger(&cx)
                .unwrap()
                .in_scope(|| tracing::info!("This is a test"));
        });

        let out = sink.contents();
        assert!(out.contains("This is a test"), "{out}");
        assert!(out.contains(r#""dd.trace_id":"42""#), "{out}");
        assert!(out.contains("tenant=acme"), "{out}");
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        let first = init(&config);
        assert_eq!(init(&config), first);
        assert_eq!(init(&LoggingConfig { level: "debug".to_string(), json: true }), first);
    }
}
