//! The metrics pipeline seen from the aggregator.
//!
//! [`FacadeMeter`] routes everything through the `metrics` facade so whatever
//! recorder the process installed (Prometheus exporter, `DebuggingRecorder` in
//! tests) receives the values. Up-down counters map onto gauges incremented by
//! the delta, which keeps float precision and allows negative deltas.

use crate::units::Unit;
use opentelemetry::KeyValue;
use std::fmt;

/// A named instrument accepting additive updates.
pub trait Instrument: Send + Sync {
    fn add(&self, value: f64, tags: &[KeyValue]);
}

/// Factory for named instruments.
pub trait Meter: Send + Sync + fmt::Debug {
    /// An instrument that may move in both directions.
    fn up_down_counter(&self, name: &str, unit: &Unit) -> Box<dyn Instrument>;

    /// A monotonic instrument.
    fn counter(&self, name: &str, unit: &Unit) -> Box<dyn Instrument>;
}

fn labels(tags: &[KeyValue]) -> Vec<metrics::Label> {
    tags.iter()
        .map(|kv| metrics::Label::new(kv.key.as_str().to_owned(), kv.value.to_string()))
        .collect()
}

/// [`Meter`] backed by the global (or thread-local) `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMeter;

struct FacadeGauge {
    name: String,
}

impl Instrument for FacadeGauge {
    fn add(&self, value: f64, tags: &[KeyValue]) {
        metrics::gauge!(self.name.clone(), labels(tags)).increment(value);
    }
}

struct FacadeCounter {
    name: String,
}

impl Instrument for FacadeCounter {
    fn add(&self, value: f64, tags: &[KeyValue]) {
        // Facade counters are integral; fractional and negative deltas are dropped.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let value = value.max(0.0) as u64;
        metrics::counter!(self.name.clone(), labels(tags)).increment(value);
    }
}

impl Meter for FacadeMeter {
    fn up_down_counter(&self, name: &str, unit: &Unit) -> Box<dyn Instrument> {
        if let Some(unit) = unit.to_metrics_unit() {
            metrics::describe_gauge!(name.to_owned(), unit, "");
        }
        Box::new(FacadeGauge {
            name: name.to_owned(),
        })
    }

    fn counter(&self, name: &str, unit: &Unit) -> Box<dyn Instrument> {
        if let Some(unit) = unit.to_metrics_unit() {
            metrics::describe_counter!(name.to_owned(), unit, "");
        }
        Box::new(FacadeCounter {
            name: name.to_owned(),
        })
    }
}

/// [`Meter`] that discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMeter;

struct NoopInstrument;

impl Instrument for NoopInstrument {
    fn add(&self, _value: f64, _tags: &[KeyValue]) {}
}

impl Meter for NoopMeter {
    fn up_down_counter(&self, _name: &str, _unit: &Unit) -> Box<dyn Instrument> {
        Box::new(NoopInstrument)
    }

    fn counter(&self, _name: &str, _unit: &Unit) -> Box<dyn Instrument> {
        Box::new(NoopInstrument)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::units::{BYTES, DIMENSIONLESS};
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_facade_meter_reaches_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let meter = FacadeMeter;
            let gauge = meter.up_down_counter("upload_size", &BYTES);
            gauge.add(10.0, &[]);
            gauge.add(5.5, &[]);
            meter
                .counter("upload_size_num", &DIMENSIONLESS)
                .add(1.0, &[]);
            meter
                .counter("upload_size_num", &DIMENSIONLESS)
                .add(1.0, &[]);
        });

        let recorded = snapshotter.snapshot().into_vec();

        let gauge = recorded
            .iter()
            .find(|(key, ..)| key.key().name() == "upload_size")
            .expect("gauge recorded");
        assert_eq!(gauge.1, Some(metrics::Unit::Bytes));
        match &gauge.3 {
            DebugValue::Gauge(v) => assert!((v.into_inner() - 15.5).abs() < f64::EPSILON),
            other => panic!("expected a gauge, got {other:?}"),
        }

        let counter = recorded
            .iter()
            .find(|(key, ..)| key.key().name() == "upload_size_num")
            .expect("counter recorded");
        assert_eq!(counter.3, DebugValue::Counter(2));
    }

    #[test]
    fn test_facade_meter_forwards_tags_as_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            FacadeMeter
                .up_down_counter("queue_depth", &DIMENSIONLESS)
                .add(3.0, &[KeyValue::new("queue", "gpu")]);
        });

        let recorded = snapshotter.snapshot().into_vec();
        let (key, ..) = recorded
            .iter()
            .find(|(key, ..)| key.key().name() == "queue_depth")
            .expect("gauge recorded");
        let labels: Vec<_> = key
            .key()
            .labels()
            .map(|l| (l.key().to_owned(), l.value().to_owned()))
            .collect();
        assert_eq!(labels, vec![("queue".to_owned(), "gpu".to_owned())]);
    }
}
