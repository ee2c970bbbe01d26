/*!
 * Scripted device client.
 *
 * Follows a fixed script (failures, delays and a timeline of readings) and
 * records every call it receives, so call ordering can be asserted.
 */
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use sensorflow_core::types::Id;

use crate::client::{ConnectError, DeviceClient, DeviceError, OpenError, Result};
use crate::model::{ChangeEvent, ChannelAddress, ChannelTuning, Endpoint};

/// A call received by [`ScriptedClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCall {
    /// `connect`
    Connect {
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },
    /// `open_channel`
    OpenChannel(ChannelAddress),
    /// `subscribe`
    Subscribe,
    /// `close_channel`
    CloseChannel,
    /// `close_connection`
    CloseConnection,
    /// `release_connection`
    ReleaseConnection,
}

/// Shared, clonable record of calls
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<ClientCall>>>);

impl CallLog {
    fn entries(&self) -> MutexGuard<'_, Vec<ClientCall>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, call: ClientCall) {
        self.entries().push(call);
    }

    /// Snapshot of the calls so far
    pub fn calls(&self) -> Vec<ClientCall> {
        self.entries().clone()
    }

    /// Number of calls matching `predicate`
    pub fn count(&self, predicate: impl Fn(&ClientCall) -> bool) -> usize {
        self.entries().iter().filter(|&c| predicate(c)).count()
    }

    /// Position of the first call equal to `call`
    pub fn position(&self, call: &ClientCall) -> Option<usize> {
        self.entries().iter().position(|c| c == call)
    }
}

/// Device client driven by a script
#[derive(Debug, Default)]
pub struct ScriptedClient {
    connect_failure: Option<ConnectError>,
    connect_delay: Duration,
    open_failure: Option<OpenError>,
    open_delay: Duration,
    fail_close_channel: bool,
    timeline: Vec<(Duration, f64)>,
    log: CallLog,
    emitter: Mutex<Option<JoinHandle<()>>>,
}

impl ScriptedClient {
    /// A client that connects and opens immediately and emits nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `connect` with `error`
    pub fn fail_connect(mut self, error: ConnectError) -> Self {
        self.connect_failure = Some(error);
        self
    }

    /// Wait before answering `connect`
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Fail `open_channel` with `error`
    pub fn fail_open(mut self, error: OpenError) -> Self {
        self.open_failure = Some(error);
        self
    }

    /// Wait before answering `open_channel`
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Fail `close_channel` with a communication error
    pub fn fail_close_channel(mut self) -> Self {
        self.fail_close_channel = true;
        self
    }

    /// Emit `value` at `offset` after `subscribe`
    pub fn emit_at(mut self, offset: Duration, value: f64) -> Self {
        self.timeline.push((offset, value));
        self
    }

    /// Emit `values` one `spacing` apart, starting one `spacing` after `subscribe`
    pub fn emit_every(mut self, spacing: Duration, values: &[f64]) -> Self {
        let base = self.timeline.last().map(|(t, _)| *t).unwrap_or_default();
        for (i, value) in values.iter().enumerate() {
            let step = u32::try_from(i + 1).unwrap_or(u32::MAX);
            self.timeline.push((base + spacing * step, *value));
        }
        self
    }

    /// The call log, shareable with assertions
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Snapshot of the calls so far
    pub fn calls(&self) -> Vec<ClientCall> {
        self.log.calls()
    }

    fn stop_emitter(&self) {
        let mut emitter = self.emitter.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = emitter.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl DeviceClient for ScriptedClient {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self, endpoint: &Endpoint) -> std::result::Result<Id, ConnectError> {
        self.log.push(ClientCall::Connect {
            host: endpoint.host.clone(),
            port: endpoint.port,
        });
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        match &self.connect_failure {
            Some(error) => Err(error.clone()),
            None => Ok(Id::from("scripted-connection")),
        }
    }

    async fn open_channel(
        &self,
        _connection: &Id,
        address: &ChannelAddress,
        _tuning: &ChannelTuning,
    ) -> std::result::Result<Id, OpenError> {
        self.log.push(ClientCall::OpenChannel(*address));
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        match &self.open_failure {
            Some(error) => Err(error.clone()),
            None => Ok(Id::from(format!("scripted-channel-{}", address.index))),
        }
    }

    async fn subscribe(&self, channel: &Id, sink: mpsc::Sender<ChangeEvent>) -> Result<()> {
        self.log.push(ClientCall::Subscribe);

        let channel = channel.clone();
        let timeline = self.timeline.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            for (offset, value) in timeline {
                tokio::time::sleep_until(start + offset).await;
                if sink.send(ChangeEvent::new(channel.clone(), value)).await.is_err() {
                    debug!("scripted subscriber gone");
                    return;
                }
            }
        });

        self.stop_emitter();
        *self.emitter.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    async fn close_channel(&self, _channel: &Id) -> Result<()> {
        self.log.push(ClientCall::CloseChannel);
        self.stop_emitter();
        if self.fail_close_channel {
            return Err(DeviceError::Communication(
                "scripted close_channel failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn close_connection(&self, _connection: &Id) -> Result<()> {
        self.log.push(ClientCall::CloseConnection);
        Ok(())
    }

    async fn release_connection(&self, _connection: &Id) -> Result<()> {
        self.log.push(ClientCall::ReleaseConnection);
        Ok(())
    }
}
