//! The tracing backend seen from the span wrapper.
//!
//! The wrapper only needs to start a span under an explicit parent and then
//! drive it through attributes, status, errors and end. [`OtelTracer`] maps
//! that onto any OpenTelemetry [`TracerProvider`].

use opentelemetry::trace::{
    Link, SpanContext, SpanKind, Status, TraceContextExt, Tracer as _, TracerProvider,
};
use opentelemetry::{Context, KeyValue};
use std::error::Error;
use std::fmt;
use std::time::SystemTime;

/// A live span in the backend.
pub trait SpanHandle: Send + Sync {
    /// Stable identifier pair used for parenting and log correlation.
    fn span_context(&self) -> &SpanContext;

    fn set_attribute(&mut self, attribute: KeyValue);

    fn set_status(&mut self, status: Status);

    fn record_error(&mut self, err: &dyn Error);

    /// Finish the span, at `end_time` if given, now otherwise.
    fn end(&mut self, end_time: Option<SystemTime>);
}

/// Everything the backend needs to open a span.
#[derive(Debug, Clone)]
pub struct SpanStart<'a> {
    /// Instrumentation library name.
    pub library_name: &'a str,
    pub name: &'a str,
    /// Explicit parent. `None` starts a new trace.
    pub parent: Option<SpanContext>,
    pub links: &'a [SpanContext],
    pub kind: Option<SpanKind>,
    pub start_time: Option<SystemTime>,
    pub attributes: &'a [KeyValue],
}

/// Span factory.
pub trait Tracer: Send + Sync + fmt::Debug {
    fn start_span(&self, start: SpanStart<'_>) -> Box<dyn SpanHandle>;
}

/// [`Tracer`] over an OpenTelemetry tracer provider.
#[derive(Debug, Clone)]
pub struct OtelTracer<P> {
    provider: P,
}

impl<P> OtelTracer<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

struct OtelSpan<S> {
    span: S,
}

impl<S> SpanHandle for OtelSpan<S>
where
    S: opentelemetry::trace::Span + Send + Sync,
{
    fn span_context(&self) -> &SpanContext {
        self.span.span_context()
    }

    fn set_attribute(&mut self, attribute: KeyValue) {
        self.span.set_attribute(attribute);
    }

    fn set_status(&mut self, status: Status) {
        self.span.set_status(status);
    }

    fn record_error(&mut self, err: &dyn Error) {
        self.span.record_error(err);
    }

    fn end(&mut self, end_time: Option<SystemTime>) {
        match end_time {
            Some(ts) => self.span.end_with_timestamp(ts),
            None => self.span.end(),
        }
    }
}

impl<P> Tracer for OtelTracer<P>
where
    P: TracerProvider + Send + Sync + fmt::Debug,
    <P::Tracer as opentelemetry::trace::Tracer>::Span: Send + Sync + 'static,
{
    fn start_span(&self, start: SpanStart<'_>) -> Box<dyn SpanHandle> {
        let tracer = self.provider.tracer(start.library_name.to_owned());

        let mut builder = tracer.span_builder(start.name.to_owned());
        builder.span_kind = start.kind;
        builder.start_time = start.start_time;
        if !start.attributes.is_empty() {
            builder.attributes = Some(start.attributes.to_vec());
        }
        if !start.links.is_empty() {
            builder.links = Some(
                start
                    .links
                    .iter()
                    .map(|sc| Link::with_context(sc.clone()))
                    .collect(),
            );
        }

        let parent_cx = match start.parent {
            Some(parent) => Context::new().with_remote_span_context(parent),
            None => Context::new(),
        };

        Box::new(OtelSpan {
            span: tracer.build_with_context(builder, &parent_cx),
        })
    }
}

/// [`Tracer`] producing non-recording spans that still carry valid ids, so
/// log correlation keeps working when tracing is switched off.
#[derive(Debug, Default)]
pub struct NoopTracer {
    ids: crate::ids::RandomIdGenerator,
}

struct NoopSpan {
    span_context: SpanContext,
}

impl SpanHandle for NoopSpan {
    fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    fn set_attribute(&mut self, _attribute: KeyValue) {}

    fn set_status(&mut self, _status: Status) {}

    fn record_error(&mut self, _err: &dyn Error) {}

    fn end(&mut self, _end_time: Option<SystemTime>) {}
}

impl Tracer for NoopTracer {
    fn start_span(&self, start: SpanStart<'_>) -> Box<dyn SpanHandle> {
        use crate::ids::IdGenerator;

        let span_context = match start.parent {
            Some(parent) => SpanContext::new(
                parent.trace_id(),
                self.ids.new_span_id(),
                parent.trace_flags(),
                false,
                parent.trace_state().clone(),
            ),
            None => {
                let (trace_id, span_id) = self.ids.new_ids();
                SpanContext::new(
                    trace_id,
                    span_id,
                    opentelemetry::trace::TraceFlags::default(),
                    false,
                    opentelemetry::trace::TraceState::default(),
                )
            }
        };
        Box::new(NoopSpan { span_context })
    }
}
