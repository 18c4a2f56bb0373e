//! End-to-end request handling through the public API.
//!
//! A simulated request handler forks a mutable context, runs nested spans
//! with metrics, and reports through the recording collaborators.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::float_cmp,
    clippy::indexing_slicing
)]

use opentelemetry::trace::Status;
use opentelemetry::{Context, Value};
use std::panic::{self, AssertUnwindSafe};
use visibility::aggregator::{self, named};
use visibility::mutable_context::{self, ContextKey};
use visibility::testing::recording_observer;
use visibility::units::BYTES;
use visibility::{begin_span_with_config, cleanup_current, in_span, SpanConfig, VisibilityError};

#[derive(Debug, thiserror::Error)]
#[error("upstream unavailable")]
struct Unavailable;

/// Nested spans share one trace, and each span exports its own totals.
#[test]
fn test_request_with_nested_operations() -> Result<(), anyhow::Error> {
    let (obs, rec) = recording_observer();
    let user = ContextKey::<String>::new("user");

    let cx = mutable_context::fork(&Context::new());
    let (request, cx) = begin_span_with_config(
        &cx,
        &obs,
        SpanConfig::new("Request")
            .with_metrics()
            .with_metric_prefix("api."),
    );

    // Values set below the request are visible to everything it calls.
    mutable_context::set(&cx, &user, "alice".to_string())?;

    let stored: Result<u64, VisibilityError> = in_span(
        &cx,
        &obs,
        SpanConfig::new("Store").with_metrics(),
        |cx| {
            assert_eq!(mutable_context::must_get(cx, &user)?, "alice");
            aggregator::metric_aggregator(cx)?.add(&named("written", BYTES), 512.0)?;
            Ok(512)
        },
    );
    assert_eq!(stored?, 512);

    aggregator::metric_aggregator(&cx)?.add_count("items", 2.0)?;
    request.cleanup()?;

    assert_eq!(rec.meter.sum("StoreSuccess"), Some(1.0));
    assert_eq!(rec.meter.sum("written"), Some(512.0));
    assert_eq!(rec.meter.sum("written_num"), Some(1.0));
    assert_eq!(rec.meter.sum("api.RequestSuccess"), Some(1.0));
    assert_eq!(rec.meter.sum("api.items"), Some(2.0));
    assert_eq!(rec.meter.sum("api.RequestFault"), Some(0.0));

    let spans = rec.tracer.take_finished();
    assert_eq!(spans.len(), 2);
    let (store, request) = (&spans[0], &spans[1]);
    assert_eq!(store.name, "Store");
    assert_eq!(store.parent.as_ref(), Some(&request.span_context));
    assert_eq!(store.attribute("written"), Some(&Value::F64(512.0)));
    assert_eq!(store.attribute("api.items"), None);
    assert_eq!(request.attribute("api.items"), Some(&Value::F64(2.0)));
    assert!(rec.leaks.reports().is_empty());

    Ok(())
}

/// A failing operation marks its own span as Error and leaves the caller's
/// classification to the caller.
#[test]
fn test_failed_operation_is_classified_as_error() -> Result<(), anyhow::Error> {
    let (obs, rec) = recording_observer();

    let (request, cx) =
        begin_span_with_config(&Context::new(), &obs, SpanConfig::new("Request").with_metrics());
    let fetched: Result<(), Unavailable> = in_span(
        &cx,
        &obs,
        SpanConfig::new("Fetch").with_metrics(),
        |_| Err(Unavailable),
    );
    assert!(fetched.is_err());
    cleanup_current(&cx, None)?;

    assert_eq!(rec.meter.sum("FetchError"), Some(1.0));
    assert_eq!(rec.meter.sum("FetchSuccess"), Some(0.0));
    assert_eq!(rec.meter.sum("RequestSuccess"), Some(1.0));
    assert!(request.is_ended());

    let spans = rec.tracer.take_finished();
    assert_eq!(spans[0].status, Status::error("upstream unavailable"));
    assert_eq!(spans[0].errors, vec!["upstream unavailable".to_string()]);

    Ok(())
}

/// A panic in a nested operation faults every span it unwinds through, and
/// each of them reports the original panic.
#[test]
fn test_panic_faults_all_open_spans() {
    let (obs, rec) = recording_observer();

    let caught = panic::catch_unwind(AssertUnwindSafe(|| {
        let (_request, cx) = begin_span_with_config(
            &Context::new(),
            &obs,
            SpanConfig::new("Request").with_metrics(),
        );
        let _: Result<(), Unavailable> = in_span(
            &cx,
            &obs,
            SpanConfig::new("Parse").with_metrics(),
            |_| -> Result<(), Unavailable> { panic!("malformed input") },
        );
    }));

    let payload = caught.expect_err("panic must propagate");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"malformed input"));

    assert_eq!(rec.meter.sum("ParseFault"), Some(1.0));
    assert_eq!(rec.meter.sum("RequestFault"), Some(1.0));
    assert_eq!(rec.meter.sum("RequestSuccess"), Some(0.0));

    let spans = rec.tracer.take_finished();
    assert_eq!(spans.len(), 2);
    assert_eq!(spans[0].errors, vec!["panic: malformed input".to_string()]);
    // The outer span is finished while unwinding and still names the panic.
    assert_eq!(spans[1].errors, vec!["panic: malformed input".to_string()]);
    assert!(rec.leaks.reports().is_empty());
}
