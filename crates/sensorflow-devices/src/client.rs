/*!
 * Device client trait and error types.
 *
 * A `DeviceClient` is the collaborator that actually talks to a device
 * server. The session controller only sequences calls on it; framing,
 * discovery and event transport all live behind this trait.
 */
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use sensorflow_core::{error::Error as CoreError, types::Id};

use crate::model::{ChangeEvent, ChannelAddress, ChannelTuning, Endpoint};

/// Failure to establish a connection to a device server
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    /// The host could not be reached
    #[error("Host unreachable: {address}: {reason}")]
    Unreachable {
        /// `host:port`
        address: String,
        /// Underlying cause
        reason: String,
    },

    /// The connection attempt did not resolve in time
    #[error("Timed out connecting to {address} after {after:?}")]
    Timeout {
        /// `host:port`
        address: String,
        /// The timeout that elapsed
        after: Duration,
    },

    /// The server actively refused the connection
    #[error("Connection refused by {address}")]
    Refused {
        /// `host:port`
        address: String,
    },
}

impl ConnectError {
    /// Create an unreachable error
    pub fn unreachable<A: Into<String>, R: ToString>(address: A, reason: R) -> Self {
        ConnectError::Unreachable {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout<A: Into<String>>(address: A, after: Duration) -> Self {
        ConnectError::Timeout {
            address: address.into(),
            after,
        }
    }

    /// Create a refused error
    pub fn refused<A: Into<String>>(address: A) -> Self {
        ConnectError::Refused {
            address: address.into(),
        }
    }
}

/// Failure to bind a channel on an established connection
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OpenError {
    /// No matching input exists or it cannot be read
    #[error("Channel unavailable: {channel}: {reason}")]
    Unavailable {
        /// Channel description
        channel: String,
        /// Underlying cause
        reason: String,
    },

    /// The open attempt did not resolve in time
    #[error("Timed out opening {channel} after {after:?}")]
    Timeout {
        /// Channel description
        channel: String,
        /// The timeout that elapsed
        after: Duration,
    },

    /// Another session already holds the input
    #[error("Channel already bound: {channel}")]
    AlreadyBound {
        /// Channel description
        channel: String,
    },

    /// The connection is not in the connected state
    #[error("Connection {connection} is not connected")]
    NotConnected {
        /// Connection id, or the endpoint when no id was assigned
        connection: String,
    },
}

impl OpenError {
    /// Create an unavailable error
    pub fn unavailable<R: ToString>(address: &ChannelAddress, reason: R) -> Self {
        OpenError::Unavailable {
            channel: address.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout(address: &ChannelAddress, after: Duration) -> Self {
        OpenError::Timeout {
            channel: address.to_string(),
            after,
        }
    }

    /// Create an already-bound error
    pub fn already_bound(address: &ChannelAddress) -> Self {
        OpenError::AlreadyBound {
            channel: address.to_string(),
        }
    }

    /// Create a not-connected error for a connection id or endpoint
    pub fn not_connected<C: ToString>(connection: C) -> Self {
        OpenError::NotConnected {
            connection: connection.to_string(),
        }
    }
}

/// Error type for the remaining device client operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The connection is not known to the client
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// The channel is not known to the client
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// The operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Communication error with the device server
    #[error("Communication error: {0}")]
    Communication(String),

    /// The device server sent something we could not understand
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No provider supports the requested backend
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// Malformed endpoint or connection string
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// The device collaborator
///
/// Implementations own all I/O. Every method is called from a single
/// controller task; implementations may spawn their own tasks to feed
/// subscriptions.
#[async_trait]
pub trait DeviceClient: Send + Sync + Debug {
    /// Backend name, e.g. `simulated`
    fn name(&self) -> &'static str;

    /// Reach the device server. Returns the connection id.
    async fn connect(&self, endpoint: &Endpoint) -> std::result::Result<Id, ConnectError>;

    /// Bind an input on an established connection. Returns the channel id.
    async fn open_channel(
        &self,
        connection: &Id,
        address: &ChannelAddress,
        tuning: &ChannelTuning,
    ) -> std::result::Result<Id, OpenError>;

    /// Start pushing change events for `channel` into `sink`
    ///
    /// Events must be sent in arrival order. When the receiving side is
    /// dropped the client stops producing.
    async fn subscribe(&self, channel: &Id, sink: mpsc::Sender<ChangeEvent>) -> Result<()>;

    /// Unbind a channel
    async fn close_channel(&self, channel: &Id) -> Result<()>;

    /// Close the link to the device server
    async fn close_connection(&self, connection: &Id) -> Result<()>;

    /// Free everything the client still holds for a closed connection
    async fn release_connection(&self, connection: &Id) -> Result<()>;
}
