//! Process-wide telemetry client.
//!
//! The hot path reports counters and timings through a single global client
//! selected at startup. Tests install the no-op sink.

use std::sync::{Mutex, OnceLock};
use std::time::Duration;

/// Destination for telemetry points.
pub trait TelemetrySink: Send + Sync {
    fn incr(&self, name: &str, value: i64);
    fn timing(&self, name: &str, value: Duration);
    fn close(&self) {}
}

/// Sink that discards everything.
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn incr(&self, _name: &str, _value: i64) {}
    fn timing(&self, _name: &str, _value: Duration) {}
}

/// Sink that forwards points to the structured log, used when no external
/// provider is configured but operators still want visibility.
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn incr(&self, name: &str, value: i64) {
        tracing::debug!(metric = name, value, "telemetry incr");
    }

    fn timing(&self, name: &str, value: Duration) {
        tracing::debug!(metric = name, millis = value.as_millis() as u64, "telemetry timing");
    }
}

static SINK: OnceLock<Mutex<Box<dyn TelemetrySink>>> = OnceLock::new();

/// Initialize the process-wide telemetry client.
///
/// `provider` comes from `STATS_PROVIDER`; an empty selector installs the
/// no-op sink. Calling init again replaces the sink (tests rely on this).
pub fn init(provider: &str) {
    let sink: Box<dyn TelemetrySink> = match provider {
        "" => Box::new(NoopSink),
        _ => Box::new(LogSink),
    };
    install(sink);
}

/// Install a specific sink, replacing any existing one.
pub fn install(sink: Box<dyn TelemetrySink>) {
    let slot = SINK.get_or_init(|| Mutex::new(Box::new(NoopSink)));
    if let Ok(mut guard) = slot.lock() {
        *guard = sink;
    }
}

/// Close the telemetry client. Flushes and detaches the current sink.
pub fn close() {
    if let Some(slot) = SINK.get() {
        if let Ok(mut guard) = slot.lock() {
            guard.close();
            *guard = Box::new(NoopSink);
        }
    }
}

pub fn incr(name: &str, value: i64) {
    if let Some(slot) = SINK.get() {
        if let Ok(guard) = slot.lock() {
            guard.incr(name, value);
        }
    }
}

pub fn timing(name: &str, value: Duration) {
    if let Some(slot) = SINK.get() {
        if let Ok(guard) = slot.lock() {
            guard.timing(name, value);
        }
    }
}
