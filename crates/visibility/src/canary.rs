//! Canary request marker, carried as OpenTelemetry baggage so it crosses
//! process boundaries with the trace.

use opentelemetry::baggage::BaggageExt;
use opentelemetry::{Context, KeyValue};

/// Baggage key holding the canary flag.
pub const CANARY_BAGGAGE_KEY: &str = "canary";

/// Span attribute set on spans of canary requests.
pub const CANARY_ATTRIBUTE_NAME: &str = "canary";

/// True if the request carried by `cx` was marked as canary traffic.
pub fn is_canary_request(cx: &Context) -> bool {
    cx.baggage()
        .get(CANARY_BAGGAGE_KEY)
        .and_then(|value| value.as_str().parse::<bool>().ok())
        .unwrap_or(false)
}

/// Derive a context whose baggage marks the request as canary (or not).
pub fn mark_as_canary(cx: &Context, is_canary: bool) -> Context {
    cx.with_baggage([KeyValue::new(CANARY_BAGGAGE_KEY, is_canary.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmarked_context_is_not_canary() {
        assert!(!is_canary_request(&Context::new()));
    }

    #[test]
    fn test_mark_and_unmark() {
        let marked = mark_as_canary(&Context::new(), true);
        assert!(is_canary_request(&marked));

        let unmarked = mark_as_canary(&marked, false);
        assert!(!is_canary_request(&unmarked));
        assert!(is_canary_request(&marked));
    }

    #[test]
    fn test_garbage_value_is_not_canary() {
        let cx = Context::new()
            .with_baggage([KeyValue::new(CANARY_BAGGAGE_KEY, "yes please")]);
        assert!(!is_canary_request(&cx));
    }
}
