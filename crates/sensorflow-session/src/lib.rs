/*!
 * SensorFlow Session
 *
 * This crate drives one device session: connect to a device server, open a
 * single sensor channel, deliver its change events to a listener for a
 * bounded time, then tear the channel and connection down in order.
 */

#![warn(missing_docs)]

// Re-export core types
pub use sensorflow_core::prelude;

pub mod controller;
pub mod error;
pub mod guard;
pub mod listener;
pub mod state;

// Re-export main types for convenience
pub use controller::{ListenOutcome, ListenReport, SessionController, SessionSettings, SessionSummary};
pub use error::{Result, SessionError};
pub use guard::{TeardownGuard, TeardownReport, TeardownStep};
pub use listener::{ChangeListener, Delivery, LoggingListener};
pub use state::ControllerState;

/// SensorFlow session crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
