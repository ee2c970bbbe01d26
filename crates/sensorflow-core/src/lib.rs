/*!
 * SensorFlow Core
 *
 * This crate provides the shared foundation for the SensorFlow crates:
 * error type, layered configuration, logging setup, identifiers and
 * async helpers.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use anyhow;
    pub use chrono;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// SensorFlow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
