//! Logging, request identifiers and metrics export.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, request_id, RequestId, REQUEST_ID_HEADER};
pub use self::metrics::{describe_metrics, install_prometheus};
