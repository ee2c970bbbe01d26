/*!
 * Client providers and the client registry.
 *
 * Backends are looked up by the name in an endpoint (`simulated`, `tcp`).
 * A provider turns the endpoint's extra parameters into a configured
 * client.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::client::{DeviceClient, DeviceError, Result};
use crate::model::Endpoint;

/// Backend-specific options taken from an endpoint's parameters
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    options: HashMap<String, String>,
}

impl ClientOptions {
    /// Creates an empty set of options
    pub fn new() -> Self {
        Self::default()
    }

    /// Options carried by `endpoint`
    pub fn from_endpoint(endpoint: &Endpoint) -> Self {
        Self {
            options: endpoint
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Adds an option
    pub fn with_option<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Self {
        self.options.insert(key.into(), value.to_string());
        self
    }

    /// Gets an option parsed as `T`; unparsable values are logged and ignored
    pub fn get_option<T: FromStr>(&self, key: &str) -> Option<T>
    where
        T::Err: Debug,
    {
        self.options.get(key).and_then(|v| {
            v.parse::<T>()
                .map_err(|e| {
                    warn!("Failed to convert option {}={:?}: {:?}", key, v, e);
                    e
                })
                .ok()
        })
    }

    /// Gets a string option
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.options.get(key).cloned()
    }

    /// Gets an unsigned integer option
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_option::<u64>(key)
    }

    /// Gets a signed integer option
    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get_option::<i32>(key)
    }

    /// Gets a boolean option
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_option::<bool>(key)
    }
}

/// Provider trait for client backends
pub trait ClientProvider: Send + Sync + Debug {
    /// Get the provider name
    fn name(&self) -> &'static str;

    /// Get supported backends
    fn supported_backends(&self) -> Vec<&'static str>;

    /// Check if a backend is supported
    fn supports_backend(&self, backend: &str) -> bool {
        self.supported_backends().contains(&backend)
    }

    /// Create a client for `backend`
    fn create_client(&self, backend: &str, options: &ClientOptions) -> Result<Arc<dyn DeviceClient>>;
}

/// ClientRegistry maps backend names to providers
#[derive(Debug, Default)]
pub struct ClientRegistry {
    providers: Vec<Box<dyn ClientProvider>>,
}

impl ClientRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Create a registry with the bundled backends
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_provider(crate::clients::BuiltinProvider);
        registry
    }

    /// Register a provider. Later registrations win for shared backend names.
    pub fn register_provider<P: ClientProvider + 'static>(&mut self, provider: P) {
        debug!("Registered client provider {}", provider.name());
        self.providers.insert(0, Box::new(provider));
    }

    /// Get a provider by name
    pub fn get_provider(&self, name: &str) -> Option<&dyn ClientProvider> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    /// All backend names, sorted and deduplicated
    pub fn backends(&self) -> Vec<&'static str> {
        let mut backends: Vec<&'static str> = self
            .providers
            .iter()
            .flat_map(|p| p.supported_backends())
            .collect();
        backends.sort_unstable();
        backends.dedup();
        backends
    }

    /// Create a client able to talk to `endpoint`
    pub fn create_client(&self, endpoint: &Endpoint) -> Result<Arc<dyn DeviceClient>> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.supports_backend(&endpoint.backend))
            .ok_or_else(|| DeviceError::UnsupportedBackend(endpoint.backend.clone()))?;

        debug!(
            "Creating {} client via provider {}",
            endpoint.backend,
            provider.name()
        );
        provider.create_client(&endpoint.backend, &ClientOptions::from_endpoint(endpoint))
    }
}

/// Connection string utilities
pub mod util {
    use super::*;

    /// Parse a connection string into a backend name and key-value pairs
    ///
    /// Connection string format: "backend://param1=value1;param2=value2"
    pub fn parse_connection_string(conn_str: &str) -> Result<(String, HashMap<String, String>)> {
        let (backend, params_str) = conn_str.split_once("://").ok_or_else(|| {
            DeviceError::InvalidEndpoint(format!("Invalid connection string format: {}", conn_str))
        })?;

        let mut params = HashMap::new();
        for param in params_str.split(';') {
            if param.is_empty() {
                continue;
            }

            let (key, value) = param.split_once('=').ok_or_else(|| {
                DeviceError::InvalidEndpoint(format!(
                    "Invalid parameter format in connection string: {}",
                    param
                ))
            })?;

            params.insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok((backend.to_string(), params))
    }

    /// Build a connection string from backend and parameters, keys sorted
    pub fn build_connection_string(backend: &str, params: &HashMap<String, String>) -> String {
        let mut pairs: Vec<_> = params.iter().collect();
        pairs.sort();
        let params_str = pairs
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<String>>()
            .join(";");

        format!("{}://{}", backend, params_str)
    }
}

#[cfg(test)]
mod tests {
    use super::util::*;
    use super::*;

    #[test]
    fn test_parse_connection_string() {
        let (backend, params) =
            parse_connection_string("simulated://host=localhost; port=5661;channels=4;").unwrap();
        assert_eq!(backend, "simulated");
        assert_eq!(params.get("host").map(String::as_str), Some("localhost"));
        assert_eq!(params.get("port").map(String::as_str), Some("5661"));
        assert_eq!(params.get("channels").map(String::as_str), Some("4"));
    }

    #[test]
    fn test_parse_connection_string_errors() {
        assert!(parse_connection_string("no-scheme").is_err());
        assert!(parse_connection_string("tcp://host").is_err());
    }

    #[test]
    fn test_connection_string_round_trip() {
        let endpoint = Endpoint::new("tcp", "10.0.0.2", 8888).with_param("read_command", "AI{index}R");
        let rendered = endpoint.to_connection_string();
        assert_eq!(rendered, "tcp://host=10.0.0.2;port=8888;read_command=AI{index}R");
        assert_eq!(Endpoint::parse(&rendered).unwrap(), endpoint);
    }

    #[test]
    fn test_client_options() {
        let options = ClientOptions::new()
            .with_option("channels", 4)
            .with_option("refuse", true)
            .with_option("latency_ms", "fast");
        assert_eq!(options.get_u64("channels"), Some(4));
        assert_eq!(options.get_bool("refuse"), Some(true));
        assert_eq!(options.get_u64("latency_ms"), None);
        assert_eq!(options.get_string("missing"), None);
    }

    #[test]
    fn test_registry_defaults() {
        let registry = ClientRegistry::with_defaults();
        assert!(registry.get_provider("builtin").is_some());
        assert!(registry.backends().contains(&"simulated"));
        assert!(registry
            .create_client(&Endpoint::new("simulated", "localhost", 5661))
            .is_ok());
        assert!(matches!(
            registry.create_client(&Endpoint::new("carrier-pigeon", "localhost", 1)),
            Err(DeviceError::UnsupportedBackend(_))
        ));
    }
}
