//! The bundle of collaborators every span needs.

use crate::aggregator::MetricAggregator;
use crate::config::ObserverConfig;
use crate::error::Result;
use crate::logging::{self, datadog_log_fields, Logger};
use crate::meter::{FacadeMeter, Meter};
use crate::span::{report_leak, LeakHandler};
use crate::tracer::{NoopTracer, Tracer};
use opentelemetry::trace::SpanContext;
use opentelemetry::Context;
use std::fmt;
use std::sync::Arc;

/// Derives log correlation fields from a span's identifiers.
pub type LogFieldsForSpan = fn(&SpanContext) -> Vec<(String, String)>;

/// Tracer, meter and root logger shared by all spans of a process.
#[derive(Clone)]
pub struct Observer {
    library_name: String,
    tracer: Arc<dyn Tracer>,
    meter: Arc<dyn Meter>,
    logger: Logger,
    log_fields_for_span: LogFieldsForSpan,
    leak_check: bool,
    leak_handler: LeakHandler,
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("library_name", &self.library_name)
            .field("tracer", &self.tracer)
            .field("meter", &self.meter)
            .field("leak_check", &self.leak_check)
            .finish_non_exhaustive()
    }
}

impl Observer {
    pub fn builder(config: ObserverConfig) -> ObserverBuilder {
        ObserverBuilder {
            config,
            tracer: None,
            meter: None,
            logger: None,
            log_fields_for_span: datadog_log_fields,
            leak_handler: None,
        }
    }

    /// An observer that traces nothing and sends metrics to whatever
    /// `metrics` recorder is installed.
    ///
    /// # Errors
    ///
    /// Returns `VisibilityError::Configuration` if `library_name` is blank.
    pub fn blind(library_name: impl Into<String>) -> Result<Self> {
        Self::builder(ObserverConfig::new(library_name)).build()
    }

    pub fn library_name(&self) -> &str {
        &self.library_name
    }

    pub fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.tracer
    }

    pub fn meter(&self) -> &Arc<dyn Meter> {
        &self.meter
    }

    /// The process root logger.
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn leak_check(&self) -> bool {
        self.leak_check
    }

    pub fn leak_handler(&self) -> &LeakHandler {
        &self.leak_handler
    }

    pub fn log_fields_for_span(&self, span_context: &SpanContext) -> Vec<(String, String)> {
        (self.log_fields_for_span)(span_context)
    }

    /// Child of the logger in `cx` (or of the root logger) named `name` and
    /// carrying `fields`. An empty name keeps the parent's name.
    pub fn derive_logger(
        &self,
        cx: &Context,
        name: &str,
        fields: Vec<(String, String)>,
    ) -> Logger {
        let parent = logging::try_logger(cx).unwrap_or_else(|| self.logger.clone());
        parent.named(name).with_fields(fields)
    }

    /// Derive a context carrying [`derive_logger`](Self::derive_logger)'s result.
    pub fn context_with_logger(
        &self,
        cx: &Context,
        name: &str,
        fields: Vec<(String, String)>,
    ) -> Context {
        logging::imbue(cx, self.derive_logger(cx, name, fields))
    }

    pub fn metric_aggregator(&self) -> MetricAggregator {
        self.metric_aggregator_with_prefix("")
    }

    pub fn metric_aggregator_with_prefix(&self, prefix: &str) -> MetricAggregator {
        MetricAggregator::new(Arc::clone(&self.meter), prefix)
    }
}

/// Builder for [`Observer`].
pub struct ObserverBuilder {
    config: ObserverConfig,
    tracer: Option<Arc<dyn Tracer>>,
    meter: Option<Arc<dyn Meter>>,
    logger: Option<Logger>,
    log_fields_for_span: LogFieldsForSpan,
    leak_handler: Option<LeakHandler>,
}

impl ObserverBuilder {
    #[must_use]
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    #[must_use]
    pub fn meter(mut self, meter: Arc<dyn Meter>) -> Self {
        self.meter = Some(meter);
        self
    }

    /// Root logger. Defaults to an unnamed logger tagged with the service
    /// name and environment from the configuration.
    #[must_use]
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    #[must_use]
    pub fn log_fields_for_span(mut self, derive: LogFieldsForSpan) -> Self {
        self.log_fields_for_span = derive;
        self
    }

    /// Called when a span is dropped without cleanup. Defaults to
    /// [`report_leak`].
    #[must_use]
    pub fn leak_handler(mut self, handler: LeakHandler) -> Self {
        self.leak_handler = Some(handler);
        self
    }

    /// # Errors
    ///
    /// Returns `VisibilityError::Configuration` if the configuration is invalid.
    pub fn build(self) -> Result<Observer> {
        self.config.validate()?;

        let logger = self.logger.unwrap_or_else(|| {
            let mut fields = Vec::new();
            if !self.config.service_name.is_empty() {
                fields.push(("service", self.config.service_name.clone()));
            }
            if !self.config.environment.is_empty() {
                fields.push(("env", self.config.environment.clone()));
            }
            Logger::root("").with_fields(fields)
        });

        Ok(Observer {
            library_name: self.config.library_name,
            tracer: self
                .tracer
                .unwrap_or_else(|| Arc::new(NoopTracer::default())),
            meter: self.meter.unwrap_or_else(|| Arc::new(FacadeMeter)),
            logger,
            log_fields_for_span: self.log_fields_for_span,
            leak_check: self.config.leak_check,
            leak_handler: self
                .leak_handler
                .unwrap_or_else(|| Arc::new(report_leak)),
        })
    }
}
