/*!
 * Monitoring
 * Structured tracing and dataplane counters
 */

mod stats;
mod tracer;

pub use stats::{DataplaneStats, StatsSnapshot};
pub use tracer::{generate_trace_id, init_tracing, CircuitSpan};
