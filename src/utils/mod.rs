//! Utils Module
pub mod cancel;
pub mod telemetry;
pub mod truncate;

pub use cancel::CancelToken;
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use truncate::{approx_token_count, clip_middle};
