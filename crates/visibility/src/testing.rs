//! Recording collaborators for tests.
//!
//! Enabled for this crate's own tests and, through the `test-utils` feature,
//! for downstream test suites.

use crate::config::ObserverConfig;
use crate::ids::{IdGenerator, PredictableIdGenerator};
use crate::logging::Logger;
use crate::meter::{Instrument, Meter};
use crate::observer::Observer;
use crate::span::{LeakHandler, LeakReport};
use crate::tracer::{SpanHandle, SpanStart, Tracer};
use crate::units::Unit;
use opentelemetry::trace::{SpanContext, SpanKind, Status, TraceFlags, TraceState};
use opentelemetry::{KeyValue, Value};
use std::collections::HashMap;
use std::error::Error;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tracing_subscriber::fmt::MakeWriter;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A finished span as seen by [`RecordingTracer`].
#[derive(Debug, Clone)]
pub struct RecordedSpan {
    pub library_name: String,
    pub name: String,
    pub span_context: SpanContext,
    pub parent: Option<SpanContext>,
    pub links: Vec<SpanContext>,
    pub kind: Option<SpanKind>,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    pub attributes: Vec<KeyValue>,
    pub status: Status,
    /// Display text of every recorded error, in order.
    pub errors: Vec<String>,
}

impl RecordedSpan {
    /// The last value set for attribute `key`.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }
}

/// [`Tracer`] keeping finished spans in memory, with reproducible ids.
#[derive(Debug)]
pub struct RecordingTracer {
    ids: PredictableIdGenerator,
    finished: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl Default for RecordingTracer {
    fn default() -> Self {
        Self::with_seed(123)
    }
}

impl RecordingTracer {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            ids: PredictableIdGenerator::new(seed),
            finished: Arc::default(),
        }
    }

    /// Drain the spans finished so far, in end order.
    pub fn take_finished(&self) -> Vec<RecordedSpan> {
        std::mem::take(&mut *lock(&self.finished))
    }
}

struct RecordingSpan {
    record: RecordedSpan,
    finished: Arc<Mutex<Vec<RecordedSpan>>>,
    ended: bool,
}

impl SpanHandle for RecordingSpan {
    fn span_context(&self) -> &SpanContext {
        &self.record.span_context
    }

    fn set_attribute(&mut self, attribute: KeyValue) {
        let attributes = &mut self.record.attributes;
        match attributes.iter_mut().find(|kv| kv.key == attribute.key) {
            Some(existing) => *existing = attribute,
            None => attributes.push(attribute),
        }
    }

    fn set_status(&mut self, status: Status) {
        self.record.status = status;
    }

    fn record_error(&mut self, err: &dyn Error) {
        self.record.errors.push(err.to_string());
    }

    fn end(&mut self, end_time: Option<SystemTime>) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.record.end_time = end_time;
        lock(&self.finished).push(self.record.clone());
    }
}

impl Tracer for RecordingTracer {
    fn start_span(&self, start: SpanStart<'_>) -> Box<dyn SpanHandle> {
        let (trace_id, span_id) = match &start.parent {
            Some(parent) => (parent.trace_id(), self.ids.new_span_id()),
            None => self.ids.new_ids(),
        };
        let span_context = SpanContext::new(
            trace_id,
            span_id,
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        );

        Box::new(RecordingSpan {
            record: RecordedSpan {
                library_name: start.library_name.to_owned(),
                name: start.name.to_owned(),
                span_context,
                parent: start.parent,
                links: start.links.to_vec(),
                kind: start.kind,
                start_time: start.start_time,
                end_time: None,
                attributes: start.attributes.to_vec(),
                status: Status::Unset,
                errors: Vec::new(),
            },
            finished: Arc::clone(&self.finished),
            ended: false,
        })
    }
}

#[derive(Debug, Default)]
struct InstrumentRecord {
    unit: Option<Unit>,
    sum: f64,
    calls: usize,
}

type InstrumentRecords = Arc<Mutex<HashMap<String, InstrumentRecord>>>;

/// [`Meter`] summing every update per instrument name.
#[derive(Debug, Default)]
pub struct RecordingMeter {
    records: InstrumentRecords,
}

impl RecordingMeter {
    /// Sum of all updates to `name`, if it was ever updated.
    pub fn sum(&self, name: &str) -> Option<f64> {
        lock(&self.records).get(name).map(|r| r.sum)
    }

    pub fn unit(&self, name: &str) -> Option<Unit> {
        lock(&self.records).get(name).and_then(|r| r.unit.clone())
    }

    /// Number of updates to `name`.
    pub fn calls(&self, name: &str) -> usize {
        lock(&self.records).get(name).map_or(0, |r| r.calls)
    }

    /// Every instrument name updated so far, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.records).keys().cloned().collect();
        names.sort();
        names
    }

    fn instrument(&self, name: &str, unit: &Unit) -> Box<dyn Instrument> {
        Box::new(RecordingInstrument {
            name: name.to_owned(),
            unit: unit.clone(),
            records: Arc::clone(&self.records),
        })
    }
}

struct RecordingInstrument {
    name: String,
    unit: Unit,
    records: InstrumentRecords,
}

impl Instrument for RecordingInstrument {
    fn add(&self, value: f64, _tags: &[KeyValue]) {
        let mut records = lock(&self.records);
        let record = records.entry(self.name.clone()).or_default();
        record.unit.get_or_insert_with(|| self.unit.clone());
        record.sum += value;
        record.calls += 1;
    }
}

impl Meter for RecordingMeter {
    fn up_down_counter(&self, name: &str, unit: &Unit) -> Box<dyn Instrument> {
        self.instrument(name, unit)
    }

    fn counter(&self, name: &str, unit: &Unit) -> Box<dyn Instrument> {
        self.instrument(name, unit)
    }
}

/// Collects leak reports instead of failing.
#[derive(Debug, Clone, Default)]
pub struct LeakRecorder {
    reports: Arc<Mutex<Vec<LeakReport>>>,
}

impl LeakRecorder {
    pub fn handler(&self) -> LeakHandler {
        let reports = Arc::clone(&self.reports);
        Arc::new(move |report: &LeakReport| lock(&reports).push(report.clone()))
    }

    pub fn reports(&self) -> Vec<LeakReport> {
        lock(&self.reports).clone()
    }
}

/// In-memory log destination for `tracing_subscriber::fmt`.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buf)).into_owned()
    }
}

/// Writer handed out by [`MemorySink`].
pub struct MemorySinkWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for MemorySinkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        lock(&self.buf).extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for MemorySink {
    type Writer = MemorySinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MemorySinkWriter {
            buf: Arc::clone(&self.buf),
        }
    }
}

/// Handles onto the collaborators of a [`recording_observer`].
#[derive(Debug, Clone)]
pub struct Recorder {
    pub tracer: Arc<RecordingTracer>,
    pub meter: Arc<RecordingMeter>,
    pub leaks: LeakRecorder,
}

/// An observer for library `tests` wired to recording collaborators.
pub fn recording_observer() -> (Observer, Recorder) {
    let recorder = Recorder {
        tracer: Arc::new(RecordingTracer::default()),
        meter: Arc::new(RecordingMeter::default()),
        leaks: LeakRecorder::default(),
    };

    let mut config = ObserverConfig::new("tests");
    config.leak_check = true;
    let observer = Observer::builder(config)
        .tracer(Arc::clone(&recorder.tracer) as Arc<dyn Tracer>)
        .meter(Arc::clone(&recorder.meter) as Arc<dyn Meter>)
        .logger(Logger::root(""))
        .leak_handler(recorder.leaks.handler())
        .build()
        .unwrap_or_else(|e| unreachable!("static test configuration is valid: {e}"));

    (observer, recorder)
}
