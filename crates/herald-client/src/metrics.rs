//! Metrics instrumentation for the Herald client.
//!
//! Uses the `metrics` facade. Nothing is exported unless the application
//! installs a recorder.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const TRANSPORT_ATTEMPTS_TOTAL: &str = "herald_transport_attempts_total";
    pub const FALLBACKS_TOTAL: &str = "herald_fallbacks_total";
    pub const FRAMES_TOTAL: &str = "herald_frames_total";
    pub const FRAMES_DROPPED_TOTAL: &str = "herald_frames_dropped_total";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "herald_subscriptions_active";
}

/// Frame direction label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// Describe every client metric.
pub fn describe() {
    metrics::describe_counter!(
        names::TRANSPORT_ATTEMPTS_TOTAL,
        "Transport open attempts, by transport"
    );
    metrics::describe_counter!(
        names::FALLBACKS_TOTAL,
        "Attempts that failed and moved on to another candidate"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Frames exchanged with the service");
    metrics::describe_counter!(
        names::FRAMES_DROPPED_TOTAL,
        "Inbound frames dropped, by reason"
    );
    metrics::describe_gauge!(names::SUBSCRIPTIONS_ACTIVE, "Channels held by the client");
}

/// Record a transport attempt.
pub fn record_attempt(transport: &'static str) {
    counter!(names::TRANSPORT_ATTEMPTS_TOTAL, "transport" => transport).increment(1);
}

/// Record a failed attempt.
pub fn record_fallback(transport: &'static str) {
    counter!(names::FALLBACKS_TOTAL, "transport" => transport).increment(1);
}

/// Record a frame.
pub fn record_frame(direction: Direction) {
    counter!(names::FRAMES_TOTAL, "direction" => direction.as_str()).increment(1);
}

/// Record a dropped inbound frame.
pub fn record_dropped(reason: &'static str) {
    counter!(names::FRAMES_DROPPED_TOTAL, "reason" => reason).increment(1);
}

/// Update the channel count.
pub fn set_subscriptions(count: usize) {
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(count as f64);
}
