//! Flowtrace library exports

pub mod clock;
pub mod config;
pub mod error;
pub mod interpreter;
pub mod telemetry;

pub use config::TelemetryConfig;
pub use error::{Result, TelemetryError};
