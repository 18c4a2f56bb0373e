//! Options for [`begin_span_with_config`](crate::span::begin_span_with_config).

use opentelemetry::trace::{SpanContext, SpanId, SpanKind, TraceFlags, TraceId, TraceState};
use opentelemetry::KeyValue;
use std::time::SystemTime;

/// Options passed through to the tracer when the span starts.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub kind: Option<SpanKind>,
    pub start_time: Option<SystemTime>,
    pub attributes: Vec<KeyValue>,
    pub links: Vec<SpanContext>,
}

/// Options applied when the span is finally ended by cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndOptions {
    /// End timestamp; cleanup time if unset.
    pub timestamp: Option<SystemTime>,
    /// Attach a backtrace captured at end time.
    pub stack_trace: bool,
}

impl EndOptions {
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn with_stack_trace(mut self) -> Self {
        self.stack_trace = true;
        self
    }
}

fn span_context(trace_id: TraceId, span_id: SpanId, remote: bool) -> SpanContext {
    SpanContext::new(
        trace_id,
        span_id,
        TraceFlags::SAMPLED,
        remote,
        TraceState::default(),
    )
}

/// Span creation options.
#[derive(Debug, Clone)]
pub struct SpanConfig {
    pub span_name: String,
    /// Instrumentation library override; the observer's default if unset.
    pub library_name: Option<String>,
    pub start_options: StartOptions,

    pub add_metrics: bool,
    pub metric_prefix: String,
    pub metric_name_base: String,

    pub without_leak_check: bool,

    pub grafted_parent: Option<SpanContext>,
}

impl SpanConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let span_name = name.into();
        Self {
            metric_name_base: span_name.clone(),
            span_name,
            library_name: None,
            start_options: StartOptions::default(),
            add_metrics: false,
            metric_prefix: String::new(),
            without_leak_check: false,
            grafted_parent: None,
        }
    }

    /// Override the instrumentation library name.
    ///
    /// An instrumentation library is the code that emits telemetry on behalf
    /// of an instrumented library; name it after the library it instruments.
    #[must_use]
    pub fn with_library_name(mut self, name: impl Into<String>) -> Self {
        self.library_name = Some(name.into());
        self
    }

    /// Merge raw start options: kind and start time override, attributes and
    /// links accumulate.
    #[must_use]
    pub fn with_start_options(mut self, options: StartOptions) -> Self {
        if options.kind.is_some() {
            self.start_options.kind = options.kind;
        }
        if options.start_time.is_some() {
            self.start_options.start_time = options.start_time;
        }
        self.start_options.attributes.extend(options.attributes);
        self.start_options.links.extend(options.links);
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.start_options.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn with_start_time(mut self, start_time: SystemTime) -> Self {
        self.start_options.start_time = Some(start_time);
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: KeyValue) -> Self {
        self.start_options.attributes.push(attribute);
        self
    }

    /// Count the span's outcome in `<prefix><base>Success`, `...Error` and
    /// `...Fault`, where `<base>` defaults to the span name.
    #[must_use]
    pub fn with_metrics(mut self) -> Self {
        self.add_metrics = true;
        self
    }

    #[must_use]
    pub fn with_metric_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.metric_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_metric_name_base(mut self, base: impl Into<String>) -> Self {
        self.metric_name_base = base.into();
        self
    }

    /// Skip leak reporting for this span, e.g. in tight loops.
    #[must_use]
    pub fn without_leak_check(mut self) -> Self {
        self.without_leak_check = true;
        self
    }

    /// Parent the span under the given ids instead of whatever the context
    /// implies. Used for spans started after their logical parent request
    /// already completed.
    #[must_use]
    pub fn with_grafted_parent(self, trace_id: TraceId, span_id: SpanId, remote: bool) -> Self {
        self.with_grafted_parent_context(span_context(trace_id, span_id, remote))
    }

    #[must_use]
    pub fn with_grafted_parent_context(mut self, parent: SpanContext) -> Self {
        self.grafted_parent = Some(parent);
        self
    }

    /// Link the span to another span, e.g. an untrusted remote one.
    #[must_use]
    pub fn with_linked_context(mut self, linked: SpanContext) -> Self {
        self.start_options.links.push(linked);
        self
    }

    #[must_use]
    pub fn with_link(self, trace_id: TraceId, span_id: SpanId, remote: bool) -> Self {
        self.with_linked_context(span_context(trace_id, span_id, remote))
    }

    pub fn success_metric(&self) -> String {
        format!("{}Success", self.metric_name_base)
    }

    pub fn error_metric(&self) -> String {
        format!("{}Error", self.metric_name_base)
    }

    pub fn fault_metric(&self) -> String {
        format!("{}Fault", self.metric_name_base)
    }
}
