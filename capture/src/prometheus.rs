use metrics::counter;

pub const CAPTURE_EVENTS_DROPPED_TOTAL: &str = "capture_events_dropped_total";

pub fn report_dropped_events(cause: &'static str, quantity: u64) {
    counter!(CAPTURE_EVENTS_DROPPED_TOTAL, "cause" => cause).increment(quantity);
}

/// Events the fast path could not hold. They are still queued.
pub fn report_buffer_overflow(quantity: u64) {
    counter!("capture_buffer_overflow_total").increment(quantity);
}
