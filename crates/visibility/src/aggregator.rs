//! Per-request metric accumulation.
//!
//! A [`MetricAggregator`] lives for one request (or one span). Every [`add`]
//! is forwarded to the meter immediately and also folded into a running total
//! that ends up on the span as an attribute. Metrics registered with [`init`]
//! but never touched are submitted as explicit zeros on [`close`], so
//! dashboards show `0` rather than a gap.
//!
//! [`add`]: MetricAggregator::add
//! [`init`]: MetricAggregator::init
//! [`close`]: MetricAggregator::close

use crate::error::{Result, VisibilityError};
use crate::meter::Meter;
use crate::tracer::SpanHandle;
use crate::units::{Unit, DIMENSIONLESS};
use opentelemetry::{Context, KeyValue};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Suffix of the per-call sample counter emitted next to every metric.
pub const SAMPLE_COUNT_SUFFIX: &str = "_num";

/// A metric name together with its unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedMetric {
    pub name: String,
    pub unit: Unit,
}

impl NamedMetric {
    pub fn new(name: impl Into<String>, unit: Unit) -> Self {
        Self {
            name: name.into(),
            unit,
        }
    }

    /// A dimensionless count.
    pub fn count(name: impl Into<String>) -> Self {
        Self::new(name, DIMENSIONLESS)
    }
}

/// Shorthand for [`NamedMetric::new`].
pub fn named(name: impl Into<String>, unit: Unit) -> NamedMetric {
    NamedMetric::new(name, unit)
}

#[derive(Default)]
struct AggregatorState {
    to_zero: HashMap<String, NamedMetric>,
    to_submit: HashMap<String, NamedMetric>,
    values: BTreeMap<String, f64>,
}

/// Accumulates metrics for one request.
pub struct MetricAggregator {
    meter: Arc<dyn Meter>,
    prefix: String,
    state: Mutex<AggregatorState>,
}

impl fmt::Debug for MetricAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricAggregator")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl MetricAggregator {
    pub fn new(meter: Arc<dyn Meter>, prefix: impl Into<String>) -> Self {
        Self {
            meter,
            prefix: prefix.into(),
            state: Mutex::new(AggregatorState::default()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Tag propagation is not wired up yet; instruments always get an empty set.
    fn tags(&self) -> Vec<KeyValue> {
        Vec::new()
    }

    /// Register metrics to be submitted as zero if nothing is added to them.
    pub fn init(&self, metrics: &[NamedMetric]) {
        let mut state = self.lock();
        for metric in metrics {
            state.to_zero.insert(metric.name.clone(), metric.clone());
        }
    }

    /// [`init`](Self::init) for dimensionless counts.
    pub fn init_counts(&self, names: &[&str]) {
        let mut state = self.lock();
        for name in names {
            state
                .to_zero
                .insert((*name).to_owned(), NamedMetric::count(*name));
        }
    }

    /// Add `delta` to a dimensionless count.
    ///
    /// # Errors
    ///
    /// See [`add`](Self::add).
    pub fn add_count(&self, name: &str, delta: f64) -> Result<()> {
        self.add(&NamedMetric::count(name), delta)
    }

    /// Add `delta` to `metric` and emit it to the meter.
    ///
    /// The first submission fixes the unit of a name for the lifetime of the
    /// aggregator.
    ///
    /// # Errors
    ///
    /// Returns `VisibilityError::InconsistentUnit` if the name was submitted
    /// before with another unit. Nothing is recorded in that case.
    pub fn add(&self, metric: &NamedMetric, delta: f64) -> Result<()> {
        let mut state = self.lock();

        if let Some(registered) = state.to_submit.get(&metric.name) {
            if registered.unit != metric.unit {
                return Err(VisibilityError::InconsistentUnit {
                    metric: metric.name.clone(),
                    registered: registered.unit.to_string(),
                    requested: metric.unit.to_string(),
                });
            }
        }

        // Touched metrics are no longer zero candidates.
        state.to_zero.remove(&metric.name);
        state.to_submit.insert(metric.name.clone(), metric.clone());
        *state.values.entry(metric.name.clone()).or_insert(0.0) += delta;

        let tags = self.tags();
        let full_name = format!("{}{}", self.prefix, metric.name);
        self.meter
            .up_down_counter(&full_name, &metric.unit)
            .add(delta, &tags);

        // Counters only keep the sum, so also count the samples to allow
        // averages to be reconstructed.
        self.meter
            .counter(&format!("{full_name}{SAMPLE_COUNT_SUFFIX}"), &DIMENSIONLESS)
            .add(1.0, &tags);

        Ok(())
    }

    /// Submit a zero for every registered metric that was never added to.
    ///
    /// The zero candidates are drained, so closing twice submits nothing new.
    pub fn close(&self) {
        let pending: Vec<NamedMetric> = {
            let mut state = self.lock();
            state.to_zero.drain().map(|(_, metric)| metric).collect()
        };

        let tags = self.tags();
        for metric in pending {
            self.meter
                .up_down_counter(&format!("{}{}", self.prefix, metric.name), &metric.unit)
                .add(0.0, &tags);
        }
    }

    /// Copy every running total onto `span` as a float attribute.
    pub fn export_to_span(&self, span: &mut dyn SpanHandle) {
        let state = self.lock();
        for (name, value) in &state.values {
            span.set_attribute(KeyValue::new(format!("{}{}", self.prefix, name), *value));
        }
    }

    /// The running total of `name`, if anything was added to it.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.lock().values.get(name).copied()
    }
}

/// The context entry holding the request's aggregator.
#[derive(Clone)]
struct AggregatorLayer(Arc<MetricAggregator>);

/// Derive a context carrying `aggregator`.
pub fn context_with_metric_aggregator(
    cx: &Context,
    aggregator: Arc<MetricAggregator>,
) -> Context {
    cx.with_value(AggregatorLayer(aggregator))
}

/// The aggregator attached to `cx`, if any.
pub fn try_metric_aggregator(cx: &Context) -> Option<Arc<MetricAggregator>> {
    cx.get::<AggregatorLayer>().map(|layer| Arc::clone(&layer.0))
}

/// The aggregator attached to `cx`.
///
/// # Errors
///
/// Returns `VisibilityError::NoMetricAggregator` if none was attached.
pub fn metric_aggregator(cx: &Context) -> Result<Arc<MetricAggregator>> {
    try_metric_aggregator(cx).ok_or(VisibilityError::NoMetricAggregator)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::testing::{RecordingMeter, RecordingTracer};
    use crate::tracer::{SpanStart, Tracer};
    use crate::units::{BYTES, MILLISECONDS};
    use opentelemetry::Value;

    fn aggregator(prefix: &str) -> (Arc<RecordingMeter>, MetricAggregator) {
        let meter = Arc::new(RecordingMeter::default());
        let agg = MetricAggregator::new(Arc::clone(&meter) as Arc<dyn Meter>, prefix);
        (meter, agg)
    }

    #[test]
    fn test_add_accumulates() {
        let (meter, agg) = aggregator("");

        agg.add(&named("x", BYTES), 10.0).unwrap();
        agg.add(&named("x", BYTES), 5.0).unwrap();

        assert_eq!(agg.value("x"), Some(15.0));
        assert_eq!(meter.sum("x"), Some(15.0));
        assert_eq!(meter.sum("x_num"), Some(2.0));
        assert_eq!(meter.unit("x"), Some(BYTES));
    }

    #[test]
    fn test_concurrent_adds_are_not_lost() {
        let (meter, agg) = aggregator("");

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        agg.add_count("hits", 1.0).unwrap();
                    }
                });
            }
        });

        assert_eq!(agg.value("hits"), Some(800.0));
        assert_eq!(meter.sum("hits"), Some(800.0));
        assert_eq!(meter.calls("hits"), 800);
        assert_eq!(meter.sum("hits_num"), Some(800.0));
    }

    #[test]
    fn test_unit_conflict_fails_on_second_add_only() {
        let (meter, agg) = aggregator("");

        assert!(agg.add(&named("latency", MILLISECONDS), 3.0).is_ok());
        let err = agg.add(&named("latency", BYTES), 1.0).unwrap_err();

        assert!(matches!(
            err,
            VisibilityError::InconsistentUnit { ref metric, .. } if metric == "latency"
        ));
        assert_eq!(agg.value("latency"), Some(3.0));
        assert_eq!(meter.calls("latency"), 1);
    }

    #[test]
    fn test_close_zero_submits_untouched_metrics_once() {
        let (meter, agg) = aggregator("svc.");
        agg.init_counts(&["OpSuccess", "OpError"]);
        agg.init(&[named("payload", BYTES)]);

        agg.add_count("OpSuccess", 1.0).unwrap();
        agg.close();

        assert_eq!(meter.sum("svc.OpSuccess"), Some(1.0));
        assert_eq!(meter.sum("svc.OpError"), Some(0.0));
        assert_eq!(meter.sum("svc.payload"), Some(0.0));
        assert_eq!(meter.unit("svc.payload"), Some(BYTES));
        assert_eq!(meter.calls("svc.OpError"), 1);

        agg.close();
        assert_eq!(meter.calls("svc.OpError"), 1);
        assert_eq!(meter.calls("svc.OpSuccess"), 1);
    }

    #[test]
    fn test_export_to_span_writes_prefixed_totals() {
        let tracer = RecordingTracer::default();
        let (_meter, agg) = aggregator("");
        agg.add(&named("x", BYTES), 10.0).unwrap();
        agg.add(&named("x", BYTES), 5.0).unwrap();

        let mut span = tracer.start_span(SpanStart {
            library_name: "tests",
            name: "export",
            parent: None,
            links: &[],
            kind: None,
            start_time: None,
            attributes: &[],
        });
        agg.export_to_span(span.as_mut());
        span.end(None);

        let recorded = tracer.take_finished();
        assert_eq!(recorded[0].attribute("x"), Some(&Value::F64(15.0)));

        let (_meter, prefixed) = aggregator("svc.");
        prefixed.add_count("hits", 2.0).unwrap();
        let mut span = tracer.start_span(SpanStart {
            library_name: "tests",
            name: "prefixed",
            parent: None,
            links: &[],
            kind: None,
            start_time: None,
            attributes: &[],
        });
        prefixed.export_to_span(span.as_mut());
        span.end(None);
        assert_eq!(tracer.take_finished()[0].attribute("svc.hits"), Some(&Value::F64(2.0)));
    }

    #[test]
    fn test_context_attachment() {
        let cx = Context::new();
        assert!(try_metric_aggregator(&cx).is_none());
        assert_eq!(
            metric_aggregator(&cx).unwrap_err(),
            VisibilityError::NoMetricAggregator
        );

        let (_meter, agg) = aggregator("");
        let cx = context_with_metric_aggregator(&cx, Arc::new(agg));
        metric_aggregator(&cx).unwrap().add_count("c", 1.0).unwrap();
        assert_eq!(try_metric_aggregator(&cx).unwrap().value("c"), Some(1.0));
    }
}
