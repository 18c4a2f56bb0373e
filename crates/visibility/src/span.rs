//! Span lifecycle with outcome metrics and leak detection.
//!
//! Every span started here must be finished by exactly one cleanup call:
//!
//! ```rust
//! use opentelemetry::Context;
//! use visibility::{begin_span, Observer};
//!
//! let obs = Observer::blind("billing").unwrap();
//! let (span, cx) = begin_span(&Context::new(), &obs, "Charge");
//! // ... work under `cx` ...
//! span.cleanup().unwrap();
//! ```
//!
//! Cleanup classifies the span as Success, Error or Fault, bumps the matching
//! count when metrics are enabled, copies the aggregator totals onto the span
//! and ends it. A span dropped while the thread unwinds is cleaned up as a
//! Fault. A span dropped in any other state without cleanup is reported to
//! the observer's leak handler together with the place it was created.
//!
//! [`in_span`] wraps all of this around a closure.

use crate::aggregator::{context_with_metric_aggregator, MetricAggregator};
use crate::canary::{is_canary_request, CANARY_ATTRIBUTE_NAME};
use crate::error::{Result, VisibilityError};
use crate::logging::{self, Logger};
use crate::observer::Observer;
use crate::panic_record::{self, PanicRecord};
use crate::span_config::{EndOptions, SpanConfig};
use crate::tracer::{SpanHandle, SpanStart};
use opentelemetry::trace::{SpanContext, Status, TraceContextExt};
use opentelemetry::{Context, KeyValue};
use std::any::Any;
use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Span attribute set when the span was finished by a panic.
pub const IN_PANIC_ATTRIBUTE: &str = "IsInPanic";

/// Span attribute holding a captured backtrace.
pub const STACKTRACE_ATTRIBUTE: &str = "exception.stacktrace";

/// Error recorded on spans finished by a panic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("panic: {0}")]
pub struct PanicError(pub String);

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}

/// A span that was dropped without cleanup.
#[derive(Debug, Clone)]
pub struct LeakReport {
    pub span_name: String,
    pub created_at: &'static Location<'static>,
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "A span has not been finalized. Created at: {}:{}",
            self.created_at.file(),
            self.created_at.line()
        )
    }
}

/// Receives leak reports.
pub type LeakHandler = Arc<dyn Fn(&LeakReport) + Send + Sync>;

/// Default leak handler: log the report, and in debug builds fail loudly.
#[allow(clippy::panic)]
pub fn report_leak(report: &LeakReport) {
    tracing::error!(
        span = %report.span_name,
        created_at = %report.created_at,
        "{report}"
    );

    if cfg!(debug_assertions) && !std::thread::panicking() {
        panic!("{report}");
    }
}

enum Outcome<'a> {
    Completed,
    Failed(&'a dyn Error),
    Panicked {
        message: String,
        origin: Option<PanicRecord>,
    },
}

impl Outcome<'_> {
    /// The panic that produced `payload`.
    fn caught(payload: &(dyn Any + Send)) -> Self {
        Self::Panicked {
            message: panic_message(payload),
            origin: panic_record::matching(payload),
        }
    }

    /// The panic the current thread is unwinding from.
    fn unwinding() -> Self {
        let origin = panic_record::last();
        Self::Panicked {
            message: origin
                .as_ref()
                .map_or_else(|| "unwinding".to_owned(), |record| record.message.clone()),
            origin,
        }
    }
}

struct SpanState {
    handle: Box<dyn SpanHandle>,
    stored_error: Option<String>,
    ended_with_error: bool,
    end_options: EndOptions,
    ended: bool,
}

struct SpanShared {
    config: SpanConfig,
    span_context: SpanContext,
    created_at: &'static Location<'static>,
    aggregator: Option<Arc<MetricAggregator>>,
    logger: Logger,
    leak_handler: Option<LeakHandler>,
    state: Mutex<SpanState>,
}

impl SpanShared {
    fn lock(&self) -> MutexGuard<'_, SpanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn count_outcome(aggregator: &MetricAggregator, metric: &str) {
    if let Err(e) = aggregator.add_count(metric, 1.0) {
        tracing::warn!(metric, error = %e, "failed to count span outcome");
    }
}

fn finalize(
    config: &SpanConfig,
    aggregator: Option<&MetricAggregator>,
    state: &mut SpanState,
    outcome: &Outcome<'_>,
) {
    state.ended = true;

    let metric = match outcome {
        Outcome::Panicked { .. } => config.fault_metric(),
        Outcome::Failed(_) => config.error_metric(),
        Outcome::Completed if state.ended_with_error || state.stored_error.is_some() => {
            config.error_metric()
        }
        Outcome::Completed => config.success_metric(),
    };
    if let Some(aggregator) = aggregator {
        count_outcome(aggregator, &metric);
        aggregator.export_to_span(state.handle.as_mut());
        aggregator.close();
    }

    let panic_trace = match outcome {
        Outcome::Panicked { message, origin } => {
            let err = PanicError(message.clone());
            state.handle.record_error(&err);
            state.handle.set_status(Status::error(err.to_string()));
            state
                .handle
                .set_attribute(KeyValue::new(IN_PANIC_ATTRIBUTE, true));
            origin.as_ref().map(|record| {
                if let Some(location) = &record.location {
                    tracing::warn!(span = %config.span_name, %location, "span finished by panic");
                }
                // Frames of the panicking code, gone from the stack by now.
                record.backtrace.to_string()
            })
        }
        Outcome::Failed(err) => {
            state.handle.record_error(*err);
            state.handle.set_status(Status::error(err.to_string()));
            None
        }
        Outcome::Completed => None,
    };

    let force_trace = state.end_options.stack_trace || matches!(outcome, Outcome::Panicked { .. });
    let stack_trace =
        panic_trace.or_else(|| force_trace.then(|| Backtrace::force_capture().to_string()));
    if let Some(stack_trace) = stack_trace {
        state
            .handle
            .set_attribute(KeyValue::new(STACKTRACE_ATTRIBUTE, stack_trace));
    }
    state.handle.end(state.end_options.timestamp);
    tracing::debug!(span = %config.span_name, outcome = %metric, "span finished");
}

impl Drop for SpanShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.ended {
            return;
        }

        if std::thread::panicking() {
            finalize(
                &self.config,
                self.aggregator.as_deref(),
                state,
                &Outcome::unwinding(),
            );
            return;
        }

        if let Some(handler) = &self.leak_handler {
            handler(&LeakReport {
                span_name: self.config.span_name.clone(),
                created_at: self.created_at,
            });
        }
    }
}

/// A span with outcome accounting. Clones share the same span.
#[derive(Clone)]
pub struct WrappedSpan {
    inner: Arc<SpanShared>,
}

impl fmt::Debug for WrappedSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedSpan")
            .field("name", &self.inner.config.span_name)
            .field("span_context", &self.inner.span_context)
            .field("created_at", &self.inner.created_at)
            .finish_non_exhaustive()
    }
}

impl WrappedSpan {
    pub fn name(&self) -> &str {
        &self.inner.config.span_name
    }

    pub fn config(&self) -> &SpanConfig {
        &self.inner.config
    }

    pub fn span_context(&self) -> &SpanContext {
        &self.inner.span_context
    }

    /// Where [`begin_span`] was called.
    pub fn created_at(&self) -> &'static Location<'static> {
        self.inner.created_at
    }

    /// The span's logger, carrying its log correlation fields.
    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    /// The span's own aggregator, when metrics are enabled.
    pub fn metric_aggregator(&self) -> Option<&Arc<MetricAggregator>> {
        self.inner.aggregator.as_ref()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.lock().ended
    }

    /// Record `err` on the span. The span is classified as Error at cleanup
    /// even if cleanup itself gets no error.
    pub fn record_error(&self, err: &dyn Error) {
        let mut state = self.inner.lock();
        if state.ended {
            return;
        }
        state.stored_error = Some(err.to_string());
        state.handle.record_error(err);
    }

    /// Set the span status. An error status classifies the span as Error.
    pub fn set_status(&self, status: Status) {
        let mut state = self.inner.lock();
        if state.ended {
            return;
        }
        if matches!(status, Status::Error { .. }) {
            state.ended_with_error = true;
        }
        state.handle.set_status(status);
    }

    pub fn set_attribute(&self, attribute: KeyValue) {
        let mut state = self.inner.lock();
        if !state.ended {
            state.handle.set_attribute(attribute);
        }
    }

    /// Options applied when cleanup ends the span. The span stays open.
    pub fn end(&self, options: EndOptions) {
        let mut state = self.inner.lock();
        if !state.ended {
            state.end_options = options;
        }
    }

    fn finish(&self, outcome: &Outcome<'_>) -> Result<()> {
        let mut state = self.inner.lock();
        if state.ended {
            tracing::warn!(span = %self.inner.config.span_name, "span cleaned up twice");
            return Err(VisibilityError::SpanAlreadyEnded(
                self.inner.config.span_name.clone(),
            ));
        }
        finalize(
            &self.inner.config,
            self.inner.aggregator.as_deref(),
            &mut state,
            outcome,
        );
        Ok(())
    }

    /// Finish the span normally. It counts as Success unless an error was
    /// recorded or an error status was set.
    ///
    /// # Errors
    ///
    /// Returns `VisibilityError::SpanAlreadyEnded` if the span was already
    /// cleaned up. Nothing is emitted in that case.
    pub fn cleanup(&self) -> Result<()> {
        self.finish(&Outcome::Completed)
    }

    /// Finish the span as Error, recording `err` on it.
    ///
    /// # Errors
    ///
    /// See [`cleanup`](Self::cleanup).
    pub fn cleanup_with_err(&self, err: &dyn Error) -> Result<()> {
        self.finish(&Outcome::Failed(err))
    }

    /// Finish the span as Fault after `catch_unwind` returned `payload`, then
    /// resume unwinding with the same payload.
    ///
    /// The span carries the backtrace of the frames that panicked.
    ///
    /// # Panics
    ///
    /// Always, with `payload`. A span that was already cleaned up is left as
    /// it is, but the panic still resumes.
    pub fn cleanup_on_panic(&self, payload: Box<dyn Any + Send>) -> ! {
        let _ = self.finish(&Outcome::caught(payload.as_ref()));
        panic::resume_unwind(payload)
    }
}

#[derive(Clone)]
struct CurrentSpan(WrappedSpan);

/// The innermost wrapped span started under `cx`.
pub fn current_span(cx: &Context) -> Option<WrappedSpan> {
    cx.get::<CurrentSpan>().map(|current| current.0.clone())
}

/// Clean up the innermost wrapped span of `cx`, as Error if `err` is given.
///
/// # Errors
///
/// Returns `VisibilityError::NoActiveSpan` if `cx` has no wrapped span, or
/// `VisibilityError::SpanAlreadyEnded` if it was already cleaned up.
pub fn cleanup_current(cx: &Context, err: Option<&dyn Error>) -> Result<()> {
    let span = current_span(cx).ok_or(VisibilityError::NoActiveSpan)?;
    match err {
        Some(err) => span.cleanup_with_err(err),
        None => span.cleanup(),
    }
}

fn parent_of(cx: &Context, config: &SpanConfig) -> Option<SpanContext> {
    if let Some(grafted) = &config.grafted_parent {
        return Some(grafted.clone());
    }
    if let Some(current) = current_span(cx) {
        return Some(current.span_context().clone());
    }
    let span = cx.span();
    let span_context = span.span_context();
    span_context.is_valid().then(|| span_context.clone())
}

/// Start a span named `name` under `cx`.
#[track_caller]
pub fn begin_span(cx: &Context, obs: &Observer, name: &str) -> (WrappedSpan, Context) {
    begin_span_with_config(cx, obs, SpanConfig::new(name))
}

/// Start a span under `cx`.
///
/// The parent is the grafted parent if configured, else the innermost wrapped
/// span in `cx`, else the OpenTelemetry span in `cx`. The returned context
/// carries the new span, its logger and, with metrics enabled, its
/// aggregator.
#[track_caller]
pub fn begin_span_with_config(
    cx: &Context,
    obs: &Observer,
    config: SpanConfig,
) -> (WrappedSpan, Context) {
    let created_at = Location::caller();
    panic_record::install_hook();
    let library_name = config
        .library_name
        .as_deref()
        .unwrap_or_else(|| obs.library_name());

    let mut handle = obs.tracer().start_span(SpanStart {
        library_name,
        name: &config.span_name,
        parent: parent_of(cx, &config),
        links: &config.start_options.links,
        kind: config.start_options.kind.clone(),
        start_time: config.start_options.start_time,
        attributes: &config.start_options.attributes,
    });
    if is_canary_request(cx) {
        handle.set_attribute(KeyValue::new(CANARY_ATTRIBUTE_NAME, true));
    }
    let span_context = handle.span_context().clone();

    let mut span_cx = cx.clone();
    let aggregator = if config.add_metrics {
        let aggregator = Arc::new(obs.metric_aggregator_with_prefix(&config.metric_prefix));
        aggregator.init_counts(&[
            &config.success_metric(),
            &config.error_metric(),
            &config.fault_metric(),
        ]);
        span_cx = context_with_metric_aggregator(&span_cx, Arc::clone(&aggregator));
        Some(aggregator)
    } else {
        None
    };

    let logger = obs.derive_logger(
        &span_cx,
        &config.span_name,
        obs.log_fields_for_span(&span_context),
    );
    span_cx = logging::imbue(&span_cx, logger.clone());

    let leak_handler = (obs.leak_check() && !config.without_leak_check)
        .then(|| Arc::clone(obs.leak_handler()));

    tracing::debug!(
        span = %config.span_name,
        trace_id = %span_context.trace_id(),
        span_id = %span_context.span_id(),
        "span started"
    );

    let span = WrappedSpan {
        inner: Arc::new(SpanShared {
            config,
            span_context,
            created_at,
            aggregator,
            logger,
            leak_handler,
            state: Mutex::new(SpanState {
                handle,
                stored_error: None,
                ended_with_error: false,
                end_options: EndOptions::default(),
                ended: false,
            }),
        }),
    };
    let span_cx = span_cx.with_value(CurrentSpan(span.clone()));
    (span, span_cx)
}

/// Run `f` inside a span and clean it up according to how `f` finished.
///
/// `Ok` counts as Success (or Error if `f` recorded one), `Err` as Error and
/// a panic as Fault. Panics propagate with their original payload after
/// cleanup.
#[track_caller]
pub fn in_span<T, E, F>(
    cx: &Context,
    obs: &Observer,
    config: SpanConfig,
    f: F,
) -> std::result::Result<T, E>
where
    E: Error,
    F: FnOnce(&Context) -> std::result::Result<T, E>,
{
    let (span, span_cx) = begin_span_with_config(cx, obs, config);

    // Cleanup failures here mean `f` already cleaned the span up itself,
    // which `finish` has logged.
    match panic::catch_unwind(AssertUnwindSafe(|| f(&span_cx))) {
        Ok(Ok(value)) => {
            let _ = span.cleanup();
            Ok(value)
        }
        Ok(Err(err)) => {
            let _ = span.cleanup_with_err(&err);
            Err(err)
        }
        Err(payload) => span.cleanup_on_panic(payload),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::float_cmp,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::aggregator::metric_aggregator;
    use crate::canary::mark_as_canary;
    use crate::logging::{DD_SPAN_ID, DD_TRACE_ID};
    use crate::testing::{recording_observer, LeakRecorder, MemorySink};
    use opentelemetry::trace::{SpanId, TraceId};
    use opentelemetry::Value;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_cleanup_counts_success() {
        let (obs, rec) = recording_observer();
        let (span, cx) =
            begin_span_with_config(&Context::new(), &obs, SpanConfig::new("Op").with_metrics());

        metric_aggregator(&cx)
            .unwrap()
            .add_count("items", 3.0)
            .unwrap();
        span.cleanup().unwrap();

        assert_eq!(rec.meter.sum("OpSuccess"), Some(1.0));
        assert_eq!(rec.meter.sum("OpError"), Some(0.0));
        assert_eq!(rec.meter.sum("OpFault"), Some(0.0));

        let spans = rec.tracer.take_finished();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "Op");
        assert_eq!(spans[0].library_name, "tests");
        assert_eq!(spans[0].attribute("OpSuccess"), Some(&Value::F64(1.0)));
        assert_eq!(spans[0].attribute("items"), Some(&Value::F64(3.0)));
        assert_eq!(spans[0].status, Status::Unset);
    }

    #[test]
    fn test_recorded_error_turns_cleanup_into_error() {
        let (obs, rec) = recording_observer();
        let (span, _cx) =
            begin_span_with_config(&Context::new(), &obs, SpanConfig::new("Op").with_metrics());

        span.record_error(&Boom);
        span.cleanup().unwrap();

        assert_eq!(rec.meter.sum("OpError"), Some(1.0));
        assert_eq!(rec.meter.sum("OpSuccess"), Some(0.0));
        assert_eq!(rec.tracer.take_finished()[0].errors, vec!["boom".to_owned()]);
    }

    #[test]
    fn test_error_status_turns_cleanup_into_error() {
        let (obs, rec) = recording_observer();
        let (span, _cx) =
            begin_span_with_config(&Context::new(), &obs, SpanConfig::new("Op").with_metrics());

        span.set_status(Status::error("denied"));
        span.cleanup().unwrap();

        assert_eq!(rec.meter.sum("OpError"), Some(1.0));
    }

    #[test]
    fn test_cleanup_with_err_records_error_and_status() {
        let (obs, rec) = recording_observer();
        let (span, cx) = begin_span_with_config(
            &Context::new(),
            &obs,
            SpanConfig::new("Op")
                .with_metrics()
                .with_metric_prefix("svc."),
        );

        cleanup_current(&cx, Some(&Boom)).unwrap();

        assert_eq!(rec.meter.sum("svc.OpError"), Some(1.0));
        let finished = rec.tracer.take_finished();
        assert_eq!(finished[0].status, Status::error("boom"));
        assert_eq!(finished[0].attribute("svc.OpError"), Some(&Value::F64(1.0)));
        assert!(span.is_ended());
    }

    #[test]
    fn test_second_cleanup_is_rejected() {
        let (obs, rec) = recording_observer();
        let (span, _cx) =
            begin_span_with_config(&Context::new(), &obs, SpanConfig::new("Op").with_metrics());

        span.cleanup().unwrap();
        assert_eq!(
            span.cleanup_with_err(&Boom).unwrap_err(),
            VisibilityError::SpanAlreadyEnded("Op".to_owned())
        );
        assert_eq!(rec.meter.calls("OpSuccess"), 1);
        assert_eq!(rec.meter.calls("OpError"), 1);
        assert_eq!(rec.tracer.take_finished().len(), 1);
    }

    #[test]
    fn test_cleanup_current_without_span() {
        assert_eq!(
            cleanup_current(&Context::new(), None).unwrap_err(),
            VisibilityError::NoActiveSpan
        );
    }

    #[test]
    fn test_end_options_apply_at_cleanup() {
        let (obs, rec) = recording_observer();
        let (span, _cx) = begin_span(&Context::new(), &obs, "Op");
        let at = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(60);

        span.end(EndOptions::default().with_timestamp(at).with_stack_trace());
        assert!(!span.is_ended());
        span.cleanup().unwrap();

        let finished = rec.tracer.take_finished();
        assert_eq!(finished[0].end_time, Some(at));
        assert!(finished[0].attribute(STACKTRACE_ATTRIBUTE).is_some());
    }

    #[inline(never)]
    fn fail_deep_in_storage() -> std::result::Result<(), Boom> {
        panic!("run!")
    }

    #[test]
    fn test_in_span_propagates_panic_as_fault() {
        let (obs, rec) = recording_observer();

        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            in_span(
                &Context::new(),
                &obs,
                SpanConfig::new("Op").with_metrics(),
                |_cx| fail_deep_in_storage(),
            )
        }));

        let payload = caught.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"run!"));

        assert_eq!(rec.meter.sum("OpFault"), Some(1.0));
        assert_eq!(rec.meter.sum("OpSuccess"), Some(0.0));
        assert_eq!(rec.meter.sum("OpError"), Some(0.0));

        let finished = rec.tracer.take_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(
            finished[0].attribute(IN_PANIC_ATTRIBUTE),
            Some(&Value::Bool(true))
        );
        assert_eq!(finished[0].errors, vec!["panic: run!".to_owned()]);
        let trace = finished[0]
            .attribute(STACKTRACE_ATTRIBUTE)
            .unwrap()
            .to_string();
        assert!(trace.contains("fail_deep_in_storage"), "{trace}");
        assert!(rec.leaks.reports().is_empty());
    }

    #[test]
    fn test_cleanup_on_panic_resumes_with_same_payload() {
        let (obs, rec) = recording_observer();
        let (span, _cx) =
            begin_span_with_config(&Context::new(), &obs, SpanConfig::new("Op").with_metrics());

        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            span.cleanup_on_panic(Box::new(String::from("lost connection")))
        }));

        let payload = caught.unwrap_err();
        assert_eq!(
            payload.downcast_ref::<String>().map(String::as_str),
            Some("lost connection")
        );
        assert!(span.is_ended());
        assert_eq!(rec.meter.sum("OpFault"), Some(1.0));
        let finished = rec.tracer.take_finished();
        assert_eq!(finished[0].errors, vec!["panic: lost connection".to_owned()]);
        assert!(finished[0].attribute(STACKTRACE_ATTRIBUTE).is_some());
    }

    #[test]
    fn test_cleanup_on_panic_after_cleanup_still_resumes() {
        let (obs, rec) = recording_observer();
        let (span, _cx) =
            begin_span_with_config(&Context::new(), &obs, SpanConfig::new("Op").with_metrics());
        span.cleanup().unwrap();

        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            span.cleanup_on_panic(Box::new(42_u8));
        }));

        assert_eq!(caught.unwrap_err().downcast_ref::<u8>(), Some(&42));
        assert_eq!(rec.meter.sum("OpSuccess"), Some(1.0));
        assert_eq!(rec.meter.sum("OpFault"), Some(0.0));
        assert_eq!(rec.tracer.take_finished().len(), 1);
    }

    #[test]
    fn test_in_span_classifies_result() {
        let (obs, rec) = recording_observer();
        let cfg = SpanConfig::new("Op").with_metrics();

        let ok: std::result::Result<u32, Boom> =
            in_span(&Context::new(), &obs, cfg.clone(), |_| Ok(7));
        assert_eq!(ok.unwrap(), 7);
        let err: std::result::Result<u32, Boom> =
            in_span(&Context::new(), &obs, cfg, |_| Err(Boom));
        assert!(err.is_err());

        assert_eq!(rec.meter.sum("OpSuccess"), Some(1.0));
        assert_eq!(rec.meter.sum("OpError"), Some(1.0));
    }

    #[test]
    fn test_drop_during_unwind_is_fault() {
        let (obs, rec) = recording_observer();

        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            let (_span, _cx) =
                begin_span_with_config(&Context::new(), &obs, SpanConfig::new("Op").with_metrics());
            panic!("inside");
        }));

        assert!(caught.is_err());
        assert_eq!(rec.meter.sum("OpFault"), Some(1.0));
        assert!(rec.leaks.reports().is_empty());
        let finished = rec.tracer.take_finished();
        assert_eq!(
            finished[0].attribute(IN_PANIC_ATTRIBUTE),
            Some(&Value::Bool(true))
        );
        assert_eq!(finished[0].errors, vec!["panic: inside".to_owned()]);
        let trace = finished[0]
            .attribute(STACKTRACE_ATTRIBUTE)
            .unwrap()
            .to_string();
        assert!(trace.contains("test_drop_during_unwind_is_fault"), "{trace}");
    }

    #[test]
    fn test_leak_reports_creation_site() {
        let (obs, rec) = recording_observer();

        let line = line!() + 1;
        let (span, cx) = begin_span(&Context::new(), &obs, "Leaky");
        drop(cx);
        drop(span);

        let reports = rec.leaks.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].span_name, "Leaky");
        assert_eq!(reports[0].created_at.file(), file!());
        assert_eq!(reports[0].created_at.line(), line);
        assert_eq!(
            reports[0].to_string(),
            format!("A span has not been finalized. Created at: {}:{line}", file!())
        );
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "A span has not been finalized")]
    fn test_default_leak_handler_fails_loudly() {
        let obs = Observer::blind("tests").unwrap();
        let (span, cx) = begin_span(&Context::new(), &obs, "Forgotten");
        drop(cx);
        drop(span);
    }

    #[test]
    fn test_no_leak_after_cleanup_or_when_disabled() {
        let (obs, rec) = recording_observer();

        let (span, _cx) = begin_span(&Context::new(), &obs, "Clean");
        span.cleanup().unwrap();
        drop(span);

        let (span, cx) = begin_span_with_config(
            &Context::new(),
            &obs,
            SpanConfig::new("Loop").without_leak_check(),
        );
        drop(cx);
        drop(span);

        assert!(rec.leaks.reports().is_empty());
    }

    #[test]
    fn test_observer_can_disable_leak_check() {
        let leaks = LeakRecorder::default();
        let mut config = crate::config::ObserverConfig::new("tests");
        config.leak_check = false;
        let obs = Observer::builder(config)
            .leak_handler(leaks.handler())
            .build()
            .unwrap();

        let (span, cx) = begin_span(&Context::new(), &obs, "Unchecked");
        drop(cx);
        drop(span);
        assert!(leaks.reports().is_empty());
    }

    #[test]
    fn test_children_inherit_trace() {
        let (obs, rec) = recording_observer();
        let (parent, cx) = begin_span(&Context::new(), &obs, "Parent");
        let (child, child_cx) = begin_span(&cx, &obs, "Child");

        assert_eq!(current_span(&child_cx).unwrap().name(), "Child");
        assert_eq!(current_span(&cx).unwrap().name(), "Parent");

        child.cleanup().unwrap();
        parent.cleanup().unwrap();

        let finished = rec.tracer.take_finished();
        let (child_rec, parent_rec) = (&finished[0], &finished[1]);
        assert_eq!(child_rec.parent.as_ref(), Some(&parent_rec.span_context));
        assert_eq!(
            child_rec.span_context.trace_id(),
            parent_rec.span_context.trace_id()
        );
        assert_eq!(parent_rec.parent, None);
    }

    #[test]
    fn test_grafted_parent_wins_over_context() {
        let (obs, rec) = recording_observer();
        let (outer, cx) = begin_span(&Context::new(), &obs, "Outer");

        let trace_id = TraceId::from(0xabc_u128);
        let span_id = SpanId::from(0xdef_u64);
        let (late, _late_cx) = begin_span_with_config(
            &cx,
            &obs,
            SpanConfig::new("Late").with_grafted_parent(trace_id, span_id, true),
        );
        late.cleanup().unwrap();
        outer.cleanup().unwrap();

        let finished = rec.tracer.take_finished();
        let parent = finished[0].parent.as_ref().unwrap();
        assert_eq!(parent.trace_id(), trace_id);
        assert_eq!(parent.span_id(), span_id);
        assert_eq!(finished[0].span_context.trace_id(), trace_id);
    }

    #[test]
    fn test_links_are_forwarded() {
        let (obs, rec) = recording_observer();
        let (span, _cx) = begin_span_with_config(
            &Context::new(),
            &obs,
            SpanConfig::new("Linked")
                .with_link(TraceId::from(5_u128), SpanId::from(6_u64), true),
        );
        span.cleanup().unwrap();

        let finished = rec.tracer.take_finished();
        assert_eq!(finished[0].links.len(), 1);
        assert_eq!(finished[0].links[0].trace_id(), TraceId::from(5_u128));
        assert!(finished[0].links[0].is_remote());
    }

    #[test]
    fn test_canary_requests_are_tagged() {
        let (obs, rec) = recording_observer();
        let cx = mark_as_canary(&Context::new(), true);

        let (span, _cx) = begin_span(&cx, &obs, "Canary");
        span.cleanup().unwrap();
        let (plain, _cx) = begin_span(&Context::new(), &obs, "Plain");
        plain.cleanup().unwrap();

        let finished = rec.tracer.take_finished();
        assert_eq!(
            finished[0].attribute(CANARY_ATTRIBUTE_NAME),
            Some(&Value::Bool(true))
        );
        assert_eq!(finished[1].attribute(CANARY_ATTRIBUTE_NAME), None);
    }

    #[test]
    fn test_span_logger_carries_correlation_fields() {
        let (obs, rec) = recording_observer();
        let sink = MemorySink::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(sink.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let (span, cx) = begin_span(&Context::new(), &obs, "TestSpan");
            logging::logger(&cx)
                .unwrap()
                .in_scope(|| tracing::info!("This is a test"));
            span.cleanup().unwrap();
        });

        let finished = rec.tracer.take_finished();
        let fields = logging::datadog_log_fields(&finished[0].span_context);
        let out = sink.contents();
        assert!(out.contains("This is a test"), "{out}");
        assert!(out.contains(r#""logger":"TestSpan""#), "{out}");
        for (key, value) in fields {
            assert!(key == DD_TRACE_ID || key == DD_SPAN_ID);
            assert!(out.contains(&format!(r#""{key}":"{value}""#)), "{out}");
        }
    }
}
