/*!
 * Framed text client over TCP.
 *
 * Talks to lab controllers that accept one command per frame, framed as
 * `STX body FRAME_END`, and answer with a short ASCII payload. A channel is
 * a numbered analog input: opening it issues a probe read, subscribing
 * polls it at the channel's data interval and pushes a change event when
 * the reading moves by at least the change trigger.
 */
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sensorflow_core::types::Id;
use sensorflow_core::utils::spawn_and_log;

use crate::client::{ConnectError, DeviceClient, DeviceError, OpenError, Result};
use crate::model::{ChangeEvent, ChannelAddress, ChannelTuning, Endpoint};
use crate::provider::ClientOptions;

/// Start of a command frame
pub const STX: u8 = 0x02;
/// End of a command frame
pub const FRAME_END: u8 = 0x13;
/// Largest reply accepted without a line terminator
pub const MAX_RESPONSE: usize = 1024;

/// Default read command; `{index}` is replaced by the channel index
pub const DEFAULT_READ_COMMAND: &str = "AI{index}R";

/// TCP client behaviour
#[derive(Debug, Clone, PartialEq)]
pub struct TcpSettings {
    /// Read command template
    pub read_command: String,
    /// Deadline for a single command/response exchange
    pub exchange_timeout: Duration,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            read_command: DEFAULT_READ_COMMAND.to_string(),
            exchange_timeout: Duration::from_secs(2),
        }
    }
}

impl TcpSettings {
    /// Read `read_command` and `exchange_timeout_ms` from endpoint options
    pub fn from_options(options: &ClientOptions) -> Self {
        let defaults = Self::default();
        Self {
            read_command: options
                .get_string("read_command")
                .unwrap_or(defaults.read_command),
            exchange_timeout: options
                .get_u64("exchange_timeout_ms")
                .map(Duration::from_millis)
                .unwrap_or(defaults.exchange_timeout),
        }
    }

    /// Command body that reads input `index`
    pub fn read_command_for(&self, index: u32) -> String {
        self.read_command.replace("{index}", &index.to_string())
    }
}

/// Wrap a command body in a frame
pub fn encode_command(body: &str) -> Bytes {
    let mut frame = BytesMut::with_capacity(body.len() + 2);
    frame.put_u8(STX);
    frame.put_slice(body.as_bytes());
    frame.put_u8(FRAME_END);
    frame.freeze()
}

/// Parse a response payload as a reading
///
/// Surrounding whitespace and framing bytes are ignored.
pub fn decode_reading(payload: &[u8]) -> Result<f64> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| DeviceError::Protocol(format!("response is not ASCII: {}", e)))?;
    let text = text.trim_matches(|c: char| c.is_whitespace() || c.is_control());
    if text.is_empty() {
        return Err(DeviceError::Protocol("empty response".to_string()));
    }
    let value = text
        .parse::<f64>()
        .map_err(|_| DeviceError::Protocol(format!("unexpected response {:?}", text)))?;
    if !value.is_finite() {
        return Err(DeviceError::Protocol(format!("non-finite reading {:?}", text)));
    }
    Ok(value)
}

/// Split the next CR/LF terminated reply off `pending`
///
/// Terminators left over from a previous reply are skipped. Returns `None`
/// while the reply is still incomplete.
fn take_reply(pending: &mut BytesMut) -> Option<Bytes> {
    let start = match pending.iter().position(|b| !matches!(b, b'\r' | b'\n')) {
        Some(start) => start,
        None => {
            pending.clear();
            return None;
        }
    };
    pending.advance(start);
    let end = pending.iter().position(|b| matches!(b, b'\r' | b'\n'))?;
    Some(pending.split_to(end).freeze())
}

/// Socket plus bytes received but not yet consumed
#[derive(Debug)]
struct LinkIo {
    stream: TcpStream,
    pending: BytesMut,
}

/// One open socket; exchanges are serialized through the mutex
#[derive(Debug)]
struct Link {
    address: String,
    io: Mutex<Option<LinkIo>>,
    exchange_timeout: Duration,
}

impl Link {
    fn new(address: String, stream: TcpStream, exchange_timeout: Duration) -> Self {
        Self {
            address,
            io: Mutex::new(Some(LinkIo {
                stream,
                pending: BytesMut::with_capacity(MAX_RESPONSE),
            })),
            exchange_timeout,
        }
    }

    async fn exchange(&self, body: &str) -> Result<Bytes> {
        let mut guard = self.io.lock().await;
        let io = guard
            .as_mut()
            .ok_or_else(|| DeviceError::InvalidState(format!("link to {} is closed", self.address)))?;

        let frame = encode_command(body);
        let round_trip = async {
            io.stream.write_all(&frame).await?;
            loop {
                if let Some(reply) = take_reply(&mut io.pending) {
                    return Ok::<_, DeviceError>(reply);
                }
                if io.pending.len() >= MAX_RESPONSE {
                    io.pending.clear();
                    return Err(DeviceError::Protocol(format!(
                        "no line terminator from {} within {} bytes",
                        self.address, MAX_RESPONSE
                    )));
                }
                if io.stream.read_buf(&mut io.pending).await? == 0 {
                    return Err(DeviceError::Communication(format!(
                        "{} closed the connection",
                        self.address
                    )));
                }
            }
        };

        match tokio::time::timeout(self.exchange_timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Communication(format!(
                "no response from {} within {:?}",
                self.address, self.exchange_timeout
            ))),
        }
    }

    async fn read(&self, command: &str) -> Result<f64> {
        let payload = self.exchange(command).await?;
        decode_reading(&payload)
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(mut io) = self.io.lock().await.take() {
            io.stream.shutdown().await?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct TcpChannel {
    connection: Id,
    address: ChannelAddress,
    tuning: ChannelTuning,
    poller: Option<JoinHandle<()>>,
}

/// TCP device client
#[derive(Debug, Default)]
pub struct TcpClient {
    settings: TcpSettings,
    links: Mutex<HashMap<Id, Arc<Link>>>,
    channels: Mutex<HashMap<Id, TcpChannel>>,
}

impl TcpClient {
    /// Create a TCP client
    pub fn new(settings: TcpSettings) -> Self {
        Self {
            settings,
            links: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    async fn link(&self, connection: &Id) -> Option<Arc<Link>> {
        self.links.lock().await.get(connection).cloned()
    }
}

async fn poll_channel(
    link: Arc<Link>,
    channel: Id,
    command: String,
    tuning: ChannelTuning,
    sink: mpsc::Sender<ChangeEvent>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(tuning.data_interval);
    let mut last: Option<f64> = None;

    loop {
        ticker.tick().await;
        let value = match link.read(&command).await {
            Ok(value) => value,
            Err(DeviceError::Protocol(reason)) => {
                warn!(channel = %channel.short(), "skipping bad reading: {}", reason);
                continue;
            }
            Err(e) => return Err(e),
        };
        if !tuning.should_report(last, value) {
            continue;
        }
        last = Some(value);
        if sink.send(ChangeEvent::new(channel.clone(), value)).await.is_err() {
            debug!(channel = %channel.short(), "subscriber gone, stopping poll");
            return Ok(());
        }
    }
}

#[async_trait]
impl DeviceClient for TcpClient {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn connect(&self, endpoint: &Endpoint) -> std::result::Result<Id, ConnectError> {
        let address = endpoint.address();
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::ConnectionRefused => ConnectError::refused(&address),
                ErrorKind::TimedOut => ConnectError::unreachable(&address, "connect timed out"),
                _ => ConnectError::unreachable(&address, e),
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {}: {}", address, e);
        }

        let id = Id::new();
        self.links.lock().await.insert(
            id.clone(),
            Arc::new(Link::new(address.clone(), stream, self.settings.exchange_timeout)),
        );
        info!("Connected to {}", address);
        Ok(id)
    }

    async fn open_channel(
        &self,
        connection: &Id,
        address: &ChannelAddress,
        tuning: &ChannelTuning,
    ) -> std::result::Result<Id, OpenError> {
        let link = self
            .link(connection)
            .await
            .ok_or_else(|| OpenError::not_connected(connection))?;

        {
            let channels = self.channels.lock().await;
            if channels
                .values()
                .any(|c| &c.connection == connection && c.address.overlaps(address))
            {
                return Err(OpenError::already_bound(address));
            }
        }

        let probe = link
            .read(&self.settings.read_command_for(address.index))
            .await
            .map_err(|e| OpenError::unavailable(address, e))?;
        debug!("Probe read of {} returned {}", address, probe);

        let id = Id::new();
        self.channels.lock().await.insert(
            id.clone(),
            TcpChannel {
                connection: connection.clone(),
                address: *address,
                tuning: *tuning,
                poller: None,
            },
        );
        Ok(id)
    }

    async fn subscribe(&self, channel: &Id, sink: mpsc::Sender<ChangeEvent>) -> Result<()> {
        let mut channels = self.channels.lock().await;
        let entry = channels
            .get_mut(channel)
            .ok_or_else(|| DeviceError::UnknownChannel(channel.to_string()))?;
        if entry.poller.is_some() {
            return Err(DeviceError::InvalidState(format!(
                "channel {} already has a subscriber",
                channel
            )));
        }

        let link = self
            .link(&entry.connection)
            .await
            .ok_or_else(|| DeviceError::UnknownConnection(entry.connection.to_string()))?;
        let command = self.settings.read_command_for(entry.address.index);
        entry.poller = Some(spawn_and_log(
            "tcp-poll",
            poll_channel(link, channel.clone(), command, entry.tuning, sink),
        ));
        Ok(())
    }

    async fn close_channel(&self, channel: &Id) -> Result<()> {
        let entry = self
            .channels
            .lock()
            .await
            .remove(channel)
            .ok_or_else(|| DeviceError::UnknownChannel(channel.to_string()))?;
        if let Some(poller) = entry.poller {
            poller.abort();
        }
        debug!("Closed {}", entry.address);
        Ok(())
    }

    async fn close_connection(&self, connection: &Id) -> Result<()> {
        let bound = self
            .channels
            .lock()
            .await
            .values()
            .filter(|c| &c.connection == connection)
            .count();
        if bound > 0 {
            return Err(DeviceError::InvalidState(format!(
                "{} channel(s) still open on connection {}",
                bound, connection
            )));
        }

        let link = self
            .link(connection)
            .await
            .ok_or_else(|| DeviceError::UnknownConnection(connection.to_string()))?;
        link.shutdown().await?;
        info!("Closed connection to {}", link.address);
        Ok(())
    }

    async fn release_connection(&self, connection: &Id) -> Result<()> {
        self.channels.lock().await.retain(|_, c| {
            if &c.connection == connection {
                if let Some(poller) = c.poller.take() {
                    poller.abort();
                }
                false
            } else {
                true
            }
        });
        self.links
            .lock()
            .await
            .remove(connection)
            .map(|_| ())
            .ok_or_else(|| DeviceError::UnknownConnection(connection.to_string()))
    }
}
