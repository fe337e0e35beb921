/*!
 * Tracing
 * Structured logging setup and spans for circuit operations
 *
 * Environment variables:
 * - RUST_LOG: log filter (default: info)
 * - DATAPLANE_TRACE_JSON: JSON output when "1" or "true"
 */

use crate::core::types::CircuitId;
use std::time::Instant;
use tracing::{debug, info, span, warn, Level};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Operations slower than this are logged at warn level
const SLOW_OPERATION_MS: u128 = 100;

/// Install the global subscriber
///
/// Records emitted through the `log` macros are forwarded into the same
/// subscriber. Safe to call more than once; later calls leave the first
/// subscriber in place.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("DATAPLANE_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json = use_json, "Dataplane tracing initialized");
    }
}

/// Unique id correlating the log lines of one operation
pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span around one circuit-level operation (create, release, ...)
pub struct CircuitSpan {
    span: tracing::Span,
    start: Instant,
    operation: &'static str,
    trace_id: String,
}

impl CircuitSpan {
    pub fn new(operation: &'static str, circuit: CircuitId) -> Self {
        let trace_id = generate_trace_id();
        let span = span!(
            Level::DEBUG,
            "circuit",
            trace_id = %trace_id,
            operation = operation,
            circuit = circuit,
            result = tracing::field::Empty,
            duration_us = tracing::field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            operation,
            trace_id,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    pub fn record_result(&self, success: bool) {
        self.span.record("result", if success { "success" } else { "error" });
    }
}

impl Drop for CircuitSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        let _entered = self.span.enter();
        self.span.record("duration_us", duration.as_micros() as u64);

        if duration.as_millis() > SLOW_OPERATION_MS {
            warn!(
                trace_id = %self.trace_id,
                operation = self.operation,
                duration_ms = duration.as_millis() as u64,
                slow = true,
                "slow circuit operation"
            );
        } else {
            debug!(
                trace_id = %self.trace_id,
                operation = self.operation,
                duration_us = duration.as_micros() as u64,
                "circuit operation completed"
            );
        }
    }
}
