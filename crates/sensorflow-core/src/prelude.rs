/*!
 * Prelude module for SensorFlow Core.
 *
 * Re-exports the types and helpers most SensorFlow crates import.
 */

pub use crate::error::{Error, Result};

pub use crate::types::{now, Id, Timestamp};

pub use crate::config::{
    ChannelConfig, Config, ConfigBuilder, LoggingConfig, ServerConfig, SessionConfig,
};

pub use crate::utils::{millis_to_duration, spawn_and_log, with_timeout};

pub use tracing::{debug, error, info, trace, warn};
