/*!
 * SensorFlow Devices
 *
 * This crate provides the device client abstraction used by a sensor
 * session, the domain model it works with (endpoints, channel addresses,
 * change events) and the bundled client backends.
 */

#![warn(missing_docs)]

// Re-export core types
pub use sensorflow_core::prelude;

pub mod client;
pub mod clients;
pub mod model;
pub mod provider;

pub use client::{ConnectError, DeviceClient, DeviceError, OpenError};
pub use model::{
    ChangeEvent, Channel, ChannelAddress, ChannelState, ChannelTuning, Connection,
    ConnectionState, Endpoint,
};
pub use provider::{ClientOptions, ClientProvider, ClientRegistry};

/// SensorFlow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Backends compiled into this build
pub fn available_backends() -> Vec<&'static str> {
    let mut backends = vec!["simulated"];

    #[cfg(feature = "tcp")]
    backends.push("tcp");

    backends
}
