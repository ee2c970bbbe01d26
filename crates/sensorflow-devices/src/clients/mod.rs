/*!
 * Device client implementations.
 *
 * `simulated` and `tcp` are reachable through [`BuiltinProvider`];
 * [`ScriptedClient`] is built directly by tests and demos.
 */
use std::sync::Arc;

use crate::client::{DeviceClient, DeviceError, Result};
use crate::provider::{ClientOptions, ClientProvider};

pub mod scripted;
pub mod simulated;
#[cfg(feature = "tcp")]
pub mod tcp;

pub use scripted::{CallLog, ClientCall, ScriptedClient};
pub use simulated::{SimulatedClient, SimulatedSettings};
#[cfg(feature = "tcp")]
pub use tcp::{TcpClient, TcpSettings};

/// Provider for the backends bundled with this crate
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinProvider;

impl ClientProvider for BuiltinProvider {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn supported_backends(&self) -> Vec<&'static str> {
        let mut backends = vec!["simulated"];
        #[cfg(feature = "tcp")]
        backends.push("tcp");
        backends
    }

    fn create_client(&self, backend: &str, options: &ClientOptions) -> Result<Arc<dyn DeviceClient>> {
        match backend {
            "simulated" => Ok(Arc::new(SimulatedClient::new(
                SimulatedSettings::from_options(options),
            ))),
            #[cfg(feature = "tcp")]
            "tcp" => Ok(Arc::new(TcpClient::new(TcpSettings::from_options(options)))),
            other => Err(DeviceError::UnsupportedBackend(other.to_string())),
        }
    }
}
