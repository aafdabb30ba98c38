//! Request-level middleware shared by every route.
//!
//! - **RequestLogging**: one structured log line per request, websocket upgrades included
//! - **MetricsMiddleware**: HTTP request and error counters in `RelayMetrics`

pub mod logging;
pub mod metrics;

pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;
