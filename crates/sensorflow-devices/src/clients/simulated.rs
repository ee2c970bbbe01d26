/*!
 * In-process simulated device server.
 *
 * Produces a smooth voltage-ratio signal on every open channel so the full
 * session lifecycle can run without hardware.
 */
use std::collections::HashMap;
use std::f64::consts::TAU;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use sensorflow_core::config::ANY;
use sensorflow_core::types::Id;

use crate::client::{ConnectError, DeviceClient, DeviceError, OpenError, Result};
use crate::model::{ChangeEvent, ChannelAddress, ChannelTuning, Endpoint};
use crate::provider::ClientOptions;

/// Period of the simulated waveform
const SIGNAL_PERIOD: Duration = Duration::from_secs(4);

/// Simulated server behaviour
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedSettings {
    /// Number of inputs on the simulated device
    pub channel_count: u32,
    /// Serial number of the simulated device
    pub serial_number: i32,
    /// Refuse every connection attempt
    pub refuse_connections: bool,
    /// Delay applied to connect and open
    pub latency: Duration,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            channel_count: 4,
            serial_number: 500_000,
            refuse_connections: false,
            latency: Duration::from_millis(20),
        }
    }
}

impl SimulatedSettings {
    /// Read `channels`, `serial`, `refuse` and `latency_ms` from endpoint options
    pub fn from_options(options: &ClientOptions) -> Self {
        let defaults = Self::default();
        Self {
            channel_count: options
                .get_u64("channels")
                .and_then(|c| u32::try_from(c).ok())
                .unwrap_or(defaults.channel_count),
            serial_number: options.get_i32("serial").unwrap_or(defaults.serial_number),
            refuse_connections: options.get_bool("refuse").unwrap_or(defaults.refuse_connections),
            latency: options
                .get_u64("latency_ms")
                .map(Duration::from_millis)
                .unwrap_or(defaults.latency),
        }
    }
}

#[derive(Debug)]
struct SimConnection {
    address: String,
    open: bool,
}

#[derive(Debug)]
struct SimChannel {
    connection: Id,
    address: ChannelAddress,
    tuning: ChannelTuning,
    emitter: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct SimState {
    connections: HashMap<Id, SimConnection>,
    channels: HashMap<Id, SimChannel>,
}

/// Simulated device client
#[derive(Debug)]
pub struct SimulatedClient {
    settings: SimulatedSettings,
    state: Mutex<SimState>,
}

impl SimulatedClient {
    /// Create a simulated client
    pub fn new(settings: SimulatedSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Number of channels currently bound
    pub async fn open_channels(&self) -> usize {
        self.state.lock().await.channels.len()
    }

    /// Number of connections not yet released
    pub async fn live_connections(&self) -> usize {
        self.state.lock().await.connections.len()
    }
}

impl Default for SimulatedClient {
    fn default() -> Self {
        Self::new(SimulatedSettings::default())
    }
}

/// Voltage ratio at `elapsed` for input `index`, in [0.1, 0.9]
pub fn signal(index: u32, elapsed: Duration) -> f64 {
    let phase = f64::from(index) * 0.25;
    let turns = elapsed.as_secs_f64() / SIGNAL_PERIOD.as_secs_f64() + phase;
    let value = 0.5 + 0.4 * (TAU * turns).sin();
    (value * 10_000.0).round() / 10_000.0
}

async fn emit_signal(
    channel: Id,
    index: u32,
    tuning: ChannelTuning,
    sink: mpsc::Sender<ChangeEvent>,
) {
    let start = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(tuning.data_interval);
    let mut last: Option<f64> = None;

    loop {
        ticker.tick().await;
        let value = signal(index, start.elapsed());
        if !tuning.should_report(last, value) {
            continue;
        }
        last = Some(value);
        trace!(channel = %channel.short(), value, "simulated reading");
        if sink.send(ChangeEvent::new(channel.clone(), value)).await.is_err() {
            debug!(channel = %channel.short(), "subscriber gone, stopping simulated signal");
            return;
        }
    }
}

#[async_trait]
impl DeviceClient for SimulatedClient {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn connect(&self, endpoint: &Endpoint) -> std::result::Result<Id, ConnectError> {
        tokio::time::sleep(self.settings.latency).await;

        if endpoint.host.trim().is_empty() {
            return Err(ConnectError::unreachable(endpoint.address(), "empty host"));
        }
        if self.settings.refuse_connections {
            return Err(ConnectError::refused(endpoint.address()));
        }

        let id = Id::new();
        self.state.lock().await.connections.insert(
            id.clone(),
            SimConnection {
                address: endpoint.address(),
                open: true,
            },
        );
        info!("Simulated server accepted connection from {}", endpoint.address());
        Ok(id)
    }

    async fn open_channel(
        &self,
        connection: &Id,
        address: &ChannelAddress,
        tuning: &ChannelTuning,
    ) -> std::result::Result<Id, OpenError> {
        tokio::time::sleep(self.settings.latency).await;

        let mut state = self.state.lock().await;
        match state.connections.get(connection) {
            Some(conn) if conn.open => {}
            _ => return Err(OpenError::not_connected(connection)),
        }

        if address.index >= self.settings.channel_count {
            return Err(OpenError::unavailable(
                address,
                format!("device has {} channels", self.settings.channel_count),
            ));
        }
        if address.serial_number != ANY && address.serial_number != self.settings.serial_number {
            return Err(OpenError::unavailable(
                address,
                format!("no device with serial number {}", address.serial_number),
            ));
        }
        if state.channels.values().any(|c| c.address.overlaps(address)) {
            return Err(OpenError::already_bound(address));
        }

        let id = Id::new();
        state.channels.insert(
            id.clone(),
            SimChannel {
                connection: connection.clone(),
                address: *address,
                tuning: *tuning,
                emitter: None,
            },
        );
        debug!("Simulated {} opened as {}", address, id.short());
        Ok(id)
    }

    async fn subscribe(&self, channel: &Id, sink: mpsc::Sender<ChangeEvent>) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .channels
            .get_mut(channel)
            .ok_or_else(|| DeviceError::UnknownChannel(channel.to_string()))?;

        if entry.emitter.is_some() {
            return Err(DeviceError::InvalidState(format!(
                "channel {} already has a subscriber",
                channel
            )));
        }

        entry.emitter = Some(tokio::spawn(emit_signal(
            channel.clone(),
            entry.address.index,
            entry.tuning,
            sink,
        )));
        Ok(())
    }

    async fn close_channel(&self, channel: &Id) -> Result<()> {
        let removed = self.state.lock().await.channels.remove(channel);
        match removed {
            Some(entry) => {
                if let Some(emitter) = entry.emitter {
                    emitter.abort();
                }
                debug!("Simulated {} closed", entry.address);
                Ok(())
            }
            None => Err(DeviceError::UnknownChannel(channel.to_string())),
        }
    }

    async fn close_connection(&self, connection: &Id) -> Result<()> {
        let mut state = self.state.lock().await;
        let bound = state
            .channels
            .values()
            .filter(|c| &c.connection == connection)
            .count();
        if bound > 0 {
            return Err(DeviceError::InvalidState(format!(
                "{} channel(s) still open on connection {}",
                bound, connection
            )));
        }

        let entry = state
            .connections
            .get_mut(connection)
            .ok_or_else(|| DeviceError::UnknownConnection(connection.to_string()))?;
        entry.open = false;
        info!("Simulated connection to {} closed", entry.address);
        Ok(())
    }

    async fn release_connection(&self, connection: &Id) -> Result<()> {
        let mut state = self.state.lock().await;
        state.channels.retain(|_, c| {
            if &c.connection == connection {
                if let Some(emitter) = c.emitter.take() {
                    emitter.abort();
                }
                false
            } else {
                true
            }
        });
        state
            .connections
            .remove(connection)
            .map(|_| ())
            .ok_or_else(|| DeviceError::UnknownConnection(connection.to_string()))
    }
}
