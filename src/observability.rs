use biometrics::{Collector, Counter, Moments};

pub(crate) static CLIENT_REQUESTS: Counter = Counter::new("relaychat.client.requests");
pub(crate) static CLIENT_REQUEST_ERRORS: Counter = Counter::new("relaychat.client.request_errors");

pub(crate) static STREAM_BYTES: Counter = Counter::new("relaychat.stream.bytes");
pub(crate) static STREAM_EVENTS: Counter = Counter::new("relaychat.stream.events");
pub(crate) static STREAM_MALFORMED_LINES: Counter =
    Counter::new("relaychat.stream.malformed_lines");
pub(crate) static STREAM_TTFB: Moments = Moments::new("relaychat.stream.ttfb_seconds");
pub(crate) static STREAM_DURATION: Moments = Moments::new("relaychat.stream.duration_seconds");

pub(crate) static EXCHANGES_STARTED: Counter = Counter::new("relaychat.engine.exchanges_started");
pub(crate) static EXCHANGES_COMPLETED: Counter =
    Counter::new("relaychat.engine.exchanges_completed");
pub(crate) static EXCHANGES_FAILED: Counter = Counter::new("relaychat.engine.exchanges_failed");
pub(crate) static EXCHANGES_CANCELLED: Counter =
    Counter::new("relaychat.engine.exchanges_cancelled");
pub(crate) static EXCHANGES_REJECTED: Counter =
    Counter::new("relaychat.engine.exchanges_rejected");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&CLIENT_REQUESTS);
    collector.register_counter(&CLIENT_REQUEST_ERRORS);

    collector.register_counter(&STREAM_BYTES);
    collector.register_counter(&STREAM_EVENTS);
    collector.register_counter(&STREAM_MALFORMED_LINES);
    collector.register_moments(&STREAM_TTFB);
    collector.register_moments(&STREAM_DURATION);

    collector.register_counter(&EXCHANGES_STARTED);
    collector.register_counter(&EXCHANGES_COMPLETED);
    collector.register_counter(&EXCHANGES_FAILED);
    collector.register_counter(&EXCHANGES_CANCELLED);
    collector.register_counter(&EXCHANGES_REJECTED);
}
