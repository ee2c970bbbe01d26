/*!
 * Error types for the SensorFlow session crate.
 */
use thiserror::Error;

use sensorflow_core::error::Error as CoreError;
use sensorflow_devices::{ConnectError, DeviceError, OpenError};

/// Error type for session operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// The connection could not be established
    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),

    /// The channel could not be opened
    #[error("Open failed: {0}")]
    Open(#[from] OpenError),

    /// The device client failed outside connect and open
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Core error (configuration, logging)
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// The controller was asked for an illegal state transition
    #[error("State error: {0}")]
    State(String),
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Create a new state error
    pub fn state<S: AsRef<str>>(msg: S) -> Self {
        SessionError::State(msg.as_ref().to_string())
    }

    /// Process exit code for this error: `2` for configuration problems,
    /// `1` for everything that went wrong talking to the device
    pub fn exit_code(&self) -> u8 {
        match self {
            SessionError::Core(CoreError::Config(_)) => 2,
            _ => 1,
        }
    }

    /// Whether the session ended before a connection was established
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, SessionError::Connect(_))
    }
}
