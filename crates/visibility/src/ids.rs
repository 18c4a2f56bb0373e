//! Trace and span id generation.

use opentelemetry::trace::{SpanId, TraceId};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of trace and span ids.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// A fresh trace id and its root span id.
    fn new_ids(&self) -> (TraceId, SpanId);

    /// A fresh span id within an existing trace.
    fn new_span_id(&self) -> SpanId;
}

fn non_zero_u128(rng: &mut impl RngCore) -> u128 {
    loop {
        let v: u128 = rng.gen();
        if v != 0 {
            return v;
        }
    }
}

fn non_zero_u64(rng: &mut impl RngCore) -> u64 {
    loop {
        let v: u64 = rng.gen();
        if v != 0 {
            return v;
        }
    }
}

/// Cryptographically random ids.
///
/// With `xray_time_prefixed`, the first four bytes of every trace id hold the
/// current Unix time in seconds, as AWS X-Ray requires. That layout stays
/// valid until 2106.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator {
    pub xray_time_prefixed: bool,
}

impl RandomIdGenerator {
    pub fn xray() -> Self {
        Self {
            xray_time_prefixed: true,
        }
    }
}

impl IdGenerator for RandomIdGenerator {
    fn new_ids(&self) -> (TraceId, SpanId) {
        let mut rng = rand::thread_rng();
        let mut trace_id = non_zero_u128(&mut rng);

        if self.xray_time_prefixed {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            // Truncation to 32 bits is the X-Ray layout.
            #[allow(clippy::cast_possible_truncation)]
            let now = u128::from(now as u32);
            trace_id = (now << 96) | (trace_id & ((1_u128 << 96) - 1));
        }

        (
            TraceId::from(trace_id),
            SpanId::from(non_zero_u64(&mut rng)),
        )
    }

    fn new_span_id(&self) -> SpanId {
        SpanId::from(non_zero_u64(&mut rand::thread_rng()))
    }
}

/// Reproducible ids from a seeded pseudo-random source, for tests.
pub struct PredictableIdGenerator {
    rng: Mutex<StdRng>,
}

impl PredictableIdGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl fmt::Debug for PredictableIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictableIdGenerator")
            .finish_non_exhaustive()
    }
}

impl IdGenerator for PredictableIdGenerator {
    fn new_ids(&self) -> (TraceId, SpanId) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let trace_id = non_zero_u128(&mut *rng);
        let span_id = non_zero_u64(&mut *rng);
        (TraceId::from(trace_id), SpanId::from(span_id))
    }

    fn new_span_id(&self) -> SpanId {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        SpanId::from(non_zero_u64(&mut *rng))
    }
}
