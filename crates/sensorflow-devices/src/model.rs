/*!
 * Session data model.
 *
 * Connections and channels are plain handles owned by the session
 * controller. The device client keeps its own bookkeeping keyed by the
 * handle ids; these structs only mirror what the controller has observed.
 */
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sensorflow_core::config::{ChannelConfig, ServerConfig, ANY};
use sensorflow_core::types::{now, Id, Timestamp};

use crate::client::{DeviceError, Result};
use crate::provider::util::{build_connection_string, parse_connection_string};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Connected to the device server
    Connected,
    /// The connection attempt failed
    Failed,
}

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    /// Not bound
    Closed,
    /// Open in progress
    Opening,
    /// Bound and delivering readings
    Open,
    /// The open attempt failed
    Failed,
}

/// Where a device server lives and which client backend talks to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Client backend name (simulated, tcp, ...)
    pub backend: String,
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Backend-specific parameters
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Endpoint {
    /// Create an endpoint without extra parameters
    pub fn new<B: Into<String>, H: Into<String>>(backend: B, host: H, port: u16) -> Self {
        Self {
            backend: backend.into(),
            host: host.into(),
            port,
            params: BTreeMap::new(),
        }
    }

    /// Add a backend-specific parameter
    pub fn with_param<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Parse `backend://host=H;port=P;key=value`
    pub fn parse(connection_string: &str) -> Result<Self> {
        let (backend, mut params) = parse_connection_string(connection_string)?;
        if backend.is_empty() {
            return Err(DeviceError::InvalidEndpoint(format!(
                "missing backend in {}",
                connection_string
            )));
        }

        let host = params.remove("host").ok_or_else(|| {
            DeviceError::InvalidEndpoint(format!("missing host in {}", connection_string))
        })?;
        let port = params
            .remove("port")
            .ok_or_else(|| {
                DeviceError::InvalidEndpoint(format!("missing port in {}", connection_string))
            })?
            .parse::<u16>()
            .map_err(|e| DeviceError::InvalidEndpoint(format!("invalid port: {}", e)))?;

        Ok(Self {
            backend,
            host,
            port,
            params: params.into_iter().collect(),
        })
    }

    /// Build an endpoint from the `[server]` configuration section
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.backend.clone(), config.host.clone(), config.port)
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Render as a connection string accepted by [`Endpoint::parse`]
    pub fn to_connection_string(&self) -> String {
        let mut params: HashMap<String, String> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        params.insert("host".to_string(), self.host.clone());
        params.insert("port".to_string(), self.port.to_string());
        build_connection_string(&self.backend, &params)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.backend, self.address())
    }
}

/// Addressable sensor input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelAddress {
    /// Channel index on the device
    pub index: u32,
    /// Device serial number, `-1` for any
    pub serial_number: i32,
    /// Hub port, `-1` for any
    pub hub_port: i32,
}

impl ChannelAddress {
    /// Channel `index` on any device
    pub fn new(index: u32) -> Self {
        Self {
            index,
            serial_number: ANY,
            hub_port: ANY,
        }
    }

    /// Restrict to a device serial number
    pub fn with_serial_number(mut self, serial_number: i32) -> Self {
        self.serial_number = serial_number;
        self
    }

    /// Restrict to a hub port
    pub fn with_hub_port(mut self, hub_port: i32) -> Self {
        self.hub_port = hub_port;
        self
    }

    /// Whether `other` names the same physical input, treating `-1` as a wildcard
    pub fn overlaps(&self, other: &ChannelAddress) -> bool {
        fn matches(a: i32, b: i32) -> bool {
            a == ANY || b == ANY || a == b
        }
        self.index == other.index
            && matches(self.serial_number, other.serial_number)
            && matches(self.hub_port, other.hub_port)
    }
}

impl From<&ChannelConfig> for ChannelAddress {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            index: config.index,
            serial_number: config.serial_number,
            hub_port: config.hub_port,
        }
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {}", self.index)?;
        if self.serial_number != ANY {
            write!(f, " sn {}", self.serial_number)?;
        }
        if self.hub_port != ANY {
            write!(f, " hub port {}", self.hub_port)?;
        }
        Ok(())
    }
}

/// How often a channel samples and how much a reading must move to be reported
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelTuning {
    /// Sampling period
    pub data_interval: Duration,
    /// Minimum absolute change that produces a change event
    pub change_trigger: f64,
}

impl ChannelTuning {
    /// Whether moving from `previous` to `current` should be reported
    pub fn should_report(&self, previous: Option<f64>, current: f64) -> bool {
        match previous {
            None => true,
            Some(previous) => (current - previous).abs() >= self.change_trigger,
        }
    }
}

impl Default for ChannelTuning {
    fn default() -> Self {
        Self {
            data_interval: Duration::from_millis(250),
            change_trigger: 0.0,
        }
    }
}

impl From<&ChannelConfig> for ChannelTuning {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            data_interval: config.data_interval(),
            change_trigger: config.change_trigger,
        }
    }
}

/// A new reading pushed by the device client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The channel that produced the reading
    pub channel: Id,
    /// The reading
    pub value: f64,
    /// When the client received the reading
    pub received_at: Timestamp,
}

impl ChangeEvent {
    /// Create an event stamped with the current time
    pub fn new(channel: Id, value: f64) -> Self {
        Self {
            channel,
            value,
            received_at: now(),
        }
    }
}

/// Controller-side handle for a link to a device server
///
/// Created before the connect attempt; the client assigns the id once the
/// link is up.
#[derive(Debug, Clone)]
pub struct Connection {
    id: Option<Id>,
    endpoint: Endpoint,
    state: ConnectionState,
}

impl Connection {
    /// Handle for a link to `endpoint` that has not been attempted yet
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            id: None,
            endpoint,
            state: ConnectionState::Disconnected,
        }
    }

    /// Connection id assigned by the client, once connected
    pub fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    /// Target endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether channels may be opened on this connection
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Record a state change
    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Record that the client established the link as `id`
    pub fn established(&mut self, id: Id) {
        self.id = Some(id);
        self.state = ConnectionState::Connected;
    }
}

/// Controller-side handle for one sensor input
#[derive(Debug, Clone)]
pub struct Channel {
    id: Option<Id>,
    connection: Id,
    address: ChannelAddress,
    state: ChannelState,
    last_reading: Option<f64>,
}

impl Channel {
    /// Handle for `address` on `connection`, not opened yet
    pub fn new(connection: Id, address: ChannelAddress) -> Self {
        Self {
            id: None,
            connection,
            address,
            state: ChannelState::Closed,
            last_reading: None,
        }
    }

    /// Channel id assigned by the client, once opened
    pub fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    /// Id of the connection this channel is bound to
    pub fn connection_id(&self) -> &Id {
        &self.connection
    }

    /// Channel address
    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether the channel is bound
    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Record a state change
    pub fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    /// Record that the client opened the channel as `id`
    pub fn opened(&mut self, id: Id) {
        self.id = Some(id);
        self.state = ChannelState::Open;
    }

    /// Last observed reading, absent until the first event
    pub fn last_reading(&self) -> Option<f64> {
        self.last_reading
    }

    /// Remember the reading carried by `event`
    pub fn observe(&mut self, event: &ChangeEvent) {
        self.last_reading = Some(event.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let endpoint = Endpoint::parse("tcp://host=192.168.1.12;port=8888;read_command=AI{index}R")
            .unwrap();
        assert_eq!(endpoint.backend, "tcp");
        assert_eq!(endpoint.host, "192.168.1.12");
        assert_eq!(endpoint.port, 8888);
        assert_eq!(endpoint.params.get("read_command").map(String::as_str), Some("AI{index}R"));
        assert_eq!(endpoint.to_string(), "tcp://192.168.1.12:8888");
    }

    #[test]
    fn test_endpoint_parse_rejects_missing_parts() {
        assert!(matches!(
            Endpoint::parse("simulated://port=5661"),
            Err(DeviceError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Endpoint::parse("simulated://host=localhost"),
            Err(DeviceError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Endpoint::parse("simulated://host=localhost;port=99999"),
            Err(DeviceError::InvalidEndpoint(_))
        ));
        assert!(Endpoint::parse("localhost:5661").is_err());
    }

    #[test]
    fn test_endpoint_from_config() {
        let endpoint = Endpoint::from_config(&ServerConfig::default());
        assert_eq!(endpoint, Endpoint::new("simulated", "localhost", 5661));
    }

    #[test]
    fn test_channel_address_overlap() {
        let any = ChannelAddress::new(0);
        let specific = ChannelAddress::new(0).with_serial_number(12345).with_hub_port(2);
        assert!(any.overlaps(&specific));
        assert!(specific.overlaps(&any));
        assert!(!specific.overlaps(&ChannelAddress::new(0).with_serial_number(999)));
        assert!(!any.overlaps(&ChannelAddress::new(1)));
        assert_eq!(specific.to_string(), "channel 0 sn 12345 hub port 2");
    }

    #[test]
    fn test_change_trigger() {
        let tuning = ChannelTuning {
            data_interval: Duration::from_millis(100),
            change_trigger: 0.01,
        };
        assert!(tuning.should_report(None, 0.5));
        assert!(!tuning.should_report(Some(0.5), 0.505));
        assert!(tuning.should_report(Some(0.5), 0.49));
        assert!(ChannelTuning::default().should_report(Some(0.5), 0.5));
    }

    #[test]
    fn test_connection_lifecycle() {
        let mut connection = Connection::new(Endpoint::new("tcp", "10.0.0.2", 8888));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.id(), None);

        connection.set_state(ConnectionState::Connecting);
        assert!(!connection.is_connected());

        connection.established(Id::from("conn"));
        assert!(connection.is_connected());
        assert_eq!(connection.id(), Some(&Id::from("conn")));
        assert_eq!(connection.endpoint().address(), "10.0.0.2:8888");
    }

    #[test]
    fn test_channel_observe() {
        let mut channel = Channel::new(Id::from("conn"), ChannelAddress::new(0));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.id(), None);

        channel.set_state(ChannelState::Opening);
        channel.opened(Id::from("ch"));
        assert!(channel.is_open());
        assert_eq!(channel.id(), Some(&Id::from("ch")));
        assert_eq!(channel.last_reading(), None);

        channel.observe(&ChangeEvent::new(Id::from("ch"), 1.02));
        assert_eq!(channel.last_reading(), Some(1.02));
    }
}
