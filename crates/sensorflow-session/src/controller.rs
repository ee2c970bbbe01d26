/*!
 * Session lifecycle controller.
 *
 * Drives one session against a device client: connect, open one channel,
 * subscribe, listen for a bounded time, then tear down in order. Change
 * events arrive on a bounded channel and are consumed by a deadline loop on
 * the controller task.
 */
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn, Instrument};

use sensorflow_core::config::Config;
use sensorflow_core::logging::operation_span;
use sensorflow_core::types::Id;
use sensorflow_core::utils::with_timeout;
use sensorflow_devices::{
    ChangeEvent, Channel, ChannelAddress, ChannelState, ChannelTuning, ConnectError, Connection,
    ConnectionState, DeviceClient, Endpoint, OpenError,
};

use crate::error::{Result, SessionError};
use crate::guard::{ordered_teardown, TeardownGuard, TeardownReport, TeardownStep};
use crate::listener::{deliver, ChangeListener, Delivery};
use crate::state::{ControllerState, StateTracker};

/// Everything a controller needs to run one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Device server to connect to
    pub endpoint: Endpoint,
    /// Channel to open
    pub address: ChannelAddress,
    /// Sampling and change trigger for the channel
    pub tuning: ChannelTuning,
    /// Label for logged readings
    pub label: String,
    /// Limit on `connect`
    pub connect_timeout: Duration,
    /// Limit on `open_channel`
    pub open_timeout: Duration,
    /// How long to listen
    pub listen_duration: Duration,
    /// Capacity of the event queue
    pub event_buffer: usize,
    /// Close and release the connection when the open fails
    pub release_on_open_failure: bool,
}

impl SessionSettings {
    /// Settings from a validated configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            endpoint: Endpoint::from_config(&config.server),
            address: ChannelAddress::from(&config.channel),
            tuning: ChannelTuning::from(&config.channel),
            label: config.channel.label.clone(),
            connect_timeout: config.server.connect_timeout(),
            open_timeout: config.channel.open_timeout(),
            listen_duration: config.session.listen_duration(),
            event_buffer: config.session.event_buffer,
            release_on_open_failure: config.session.release_on_open_failure,
        })
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        let config = Config::default();
        Self {
            endpoint: Endpoint::from_config(&config.server),
            address: ChannelAddress::from(&config.channel),
            tuning: ChannelTuning::from(&config.channel),
            label: config.channel.label.clone(),
            connect_timeout: config.server.connect_timeout(),
            open_timeout: config.channel.open_timeout(),
            listen_duration: config.session.listen_duration(),
            event_buffer: config.session.event_buffer,
            release_on_open_failure: config.session.release_on_open_failure,
        }
    }
}

/// Why listening stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenOutcome {
    /// The listen duration elapsed
    Elapsed,
    /// The shutdown future resolved first
    Shutdown,
}

impl fmt::Display for ListenOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenOutcome::Elapsed => f.write_str("elapsed"),
            ListenOutcome::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Result of one listen period
#[derive(Debug, Clone, PartialEq)]
pub struct ListenReport {
    /// Why listening stopped
    pub outcome: ListenOutcome,
    /// Events taken off the queue
    pub received: usize,
    /// Events the listener accepted
    pub delivered: usize,
    /// Events the listener rejected or panicked on
    pub listener_failures: usize,
    /// Time spent listening
    pub listened: Duration,
}

/// What a completed session did
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Connection id assigned by the client
    pub connection: Id,
    /// Server the session talked to
    pub endpoint: Endpoint,
    /// Channel that was opened
    pub address: ChannelAddress,
    /// Last reading seen, if any
    pub last_reading: Option<f64>,
    /// Listen period details
    pub listen: ListenReport,
    /// Teardown details
    pub teardown: TeardownReport,
}

struct Subscription {
    events: mpsc::Receiver<ChangeEvent>,
    listener: Box<dyn ChangeListener>,
}

/// Owns one connection and one channel for the life of a session
pub struct SessionController {
    client: Arc<dyn DeviceClient>,
    settings: SessionSettings,
    state: StateTracker,
    connection: Option<Connection>,
    channel: Option<Channel>,
    subscription: Option<Subscription>,
    guard: Option<TeardownGuard>,
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("client", &self.client.name())
            .field("state", &self.state.current())
            .field("connection", &self.connection)
            .field("channel", &self.channel)
            .field("subscribed", &self.subscription.is_some())
            .finish()
    }
}

impl SessionController {
    /// Create a controller in the idle state
    pub fn new(client: Arc<dyn DeviceClient>, settings: SessionSettings) -> Self {
        Self {
            client,
            settings,
            state: StateTracker::new(),
            connection: None,
            channel: None,
            subscription: None,
            guard: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ControllerState {
        self.state.current()
    }

    /// Follow state changes
    pub fn watch_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// The settings this controller runs with
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// The established connection, if any
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// The open channel, if any
    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    /// Connect to `endpoint`, giving up after `timeout`
    pub async fn establish_connection(
        &mut self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Connection> {
        self.state.transition(ControllerState::Connecting)?;
        info!("Connecting to {}", endpoint);
        let mut connection = Connection::new(endpoint.clone());
        connection.set_state(ConnectionState::Connecting);
        self.connection = Some(connection.clone());

        let address = endpoint.address();
        let attempt = with_timeout(timeout, self.client.connect(endpoint), |after| {
            ConnectError::timeout(address, after)
        })
        .await;

        match attempt {
            Ok(id) => {
                info!("Connected to {} as {}", endpoint, id.short());
                self.guard = Some(TeardownGuard::new(Arc::clone(&self.client), id.clone()));
                connection.established(id);
                self.connection = Some(connection.clone());
                self.state.transition(ControllerState::Connected)?;
                Ok(connection)
            }
            Err(e) => {
                debug!("Connecting to {} failed: {}", endpoint, e);
                connection.set_state(ConnectionState::Failed);
                self.connection = Some(connection);
                self.state.transition(ControllerState::Terminated)?;
                Err(e.into())
            }
        }
    }

    /// Open the input at `address` on `connection`, giving up after `timeout`
    pub async fn open_channel(
        &mut self,
        connection: &Connection,
        address: &ChannelAddress,
        timeout: Duration,
    ) -> Result<Channel> {
        self.state.transition(ControllerState::ChannelOpening)?;
        let connection_id = match connection.id() {
            Some(id) if connection.is_connected() => id.clone(),
            Some(id) => return self.fail_open(OpenError::not_connected(id)).await,
            None => {
                return self
                    .fail_open(OpenError::not_connected(connection.endpoint()))
                    .await
            }
        };

        info!("Opening {}", address);
        let mut channel = Channel::new(connection_id.clone(), *address);
        channel.set_state(ChannelState::Opening);
        self.channel = Some(channel.clone());

        let tuning = self.settings.tuning;
        let attempt = with_timeout(
            timeout,
            self.client.open_channel(&connection_id, address, &tuning),
            |after| OpenError::timeout(address, after),
        )
        .await;

        match attempt {
            Ok(id) => {
                info!("Opened {} as {}", address, id.short());
                if let Some(guard) = self.guard.as_mut() {
                    guard.set_channel(id.clone());
                }
                channel.opened(id);
                self.channel = Some(channel.clone());
                Ok(channel)
            }
            Err(e) => self.fail_open(e).await,
        }
    }

    async fn fail_open<T>(&mut self, e: OpenError) -> Result<T> {
        debug!("Opening channel failed: {}", e);
        if let Some(channel) = self.channel.as_mut() {
            channel.set_state(ChannelState::Failed);
        }

        if let Some((_, connection_id)) = self.guard.as_mut().and_then(TeardownGuard::disarm) {
            if self.settings.release_on_open_failure {
                let report = ordered_teardown(self.client.as_ref(), None, &connection_id).await;
                let state = if report.is_clean() {
                    ConnectionState::Disconnected
                } else {
                    warn!("Releasing {} after failed open was incomplete", connection_id.short());
                    ConnectionState::Failed
                };
                if let Some(connection) = self.connection.as_mut() {
                    connection.set_state(state);
                }
            } else {
                debug!("Leaving connection {} in place", connection_id.short());
            }
        }

        self.state.transition(ControllerState::Terminated)?;
        Err(e.into())
    }

    /// Register `listener` for change events on `channel`
    pub async fn subscribe<L>(&mut self, channel: &Channel, listener: L) -> Result<()>
    where
        L: ChangeListener + 'static,
    {
        if self.state() != ControllerState::ChannelOpening || self.channel.is_none() {
            return Err(SessionError::state(format!(
                "cannot subscribe while {}",
                self.state()
            )));
        }
        let channel_id = channel
            .id()
            .filter(|_| channel.is_open())
            .ok_or_else(|| SessionError::state(format!("{} is not open", channel.address())))?;

        let (tx, rx) = mpsc::channel(self.settings.event_buffer.max(1));
        if let Err(e) = self.client.subscribe(channel_id, tx).await {
            error!("Subscribing to {} failed: {}", channel_id.short(), e);
            return Err(e.into());
        }

        self.subscription = Some(Subscription {
            events: rx,
            listener: Box::new(listener),
        });
        self.state.transition(ControllerState::Listening)?;
        Ok(())
    }

    /// Deliver events for exactly `duration`
    pub async fn run_for(&mut self, duration: Duration) -> Result<ListenReport> {
        self.run_until(duration, future::pending::<()>()).await
    }

    /// Deliver events for `duration`, or until `shutdown` resolves
    pub async fn run_until<S>(&mut self, duration: Duration, shutdown: S) -> Result<ListenReport>
    where
        S: Future<Output = ()>,
    {
        if self.state() != ControllerState::Listening {
            return Err(SessionError::state(format!(
                "cannot listen while {}",
                self.state()
            )));
        }
        let mut subscription = self
            .subscription
            .take()
            .ok_or_else(|| SessionError::state("listening without a subscription"))?;

        info!("Listening for {:?}", duration);
        let started = Instant::now();
        let deadline = sleep_until(started + duration);
        tokio::pin!(deadline);
        tokio::pin!(shutdown);

        let mut received = 0;
        let mut delivered = 0;
        let mut listener_failures = 0;
        let mut stream_open = true;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = &mut deadline => break ListenOutcome::Elapsed,
                _ = &mut shutdown => {
                    info!("Shutdown requested, ending listen early");
                    break ListenOutcome::Shutdown;
                }
                event = subscription.events.recv(), if stream_open => match event {
                    Some(event) => {
                        received += 1;
                        if let Some(channel) = self.channel.as_mut() {
                            channel.observe(&event);
                        }
                        match deliver(&mut *subscription.listener, &event) {
                            Delivery::Delivered => delivered += 1,
                            Delivery::Failed | Delivery::Panicked => listener_failures += 1,
                        }
                    }
                    None => {
                        debug!("Event stream closed by the client");
                        stream_open = false;
                    }
                },
            }
        };

        self.subscription = Some(subscription);
        let report = ListenReport {
            outcome,
            received,
            delivered,
            listener_failures,
            listened: started.elapsed(),
        };
        info!(
            "Listening {} after {:?}: {} events",
            report.outcome, report.listened, report.received
        );
        Ok(report)
    }

    /// Close the channel, close the connection, release the connection
    pub async fn teardown(&mut self) -> Result<TeardownReport> {
        self.state.transition(ControllerState::ClosingChannel)?;
        self.subscription = None;

        let (channel_id, connection_id) = self
            .guard
            .as_mut()
            .and_then(TeardownGuard::disarm)
            .ok_or_else(|| SessionError::state("teardown without a connection"))?;
        let client = Arc::clone(&self.client);
        let mut report = TeardownReport::default();

        if let Some(id) = channel_id {
            let closed = report.step(client.as_ref(), TeardownStep::CloseChannel, &id).await;
            if let Some(channel) = self.channel.as_mut() {
                channel.set_state(if closed {
                    ChannelState::Closed
                } else {
                    ChannelState::Failed
                });
            }
        }

        self.state.transition(ControllerState::ClosingConnection)?;
        let closed = report
            .step(client.as_ref(), TeardownStep::CloseConnection, &connection_id)
            .await;
        report
            .step(client.as_ref(), TeardownStep::ReleaseConnection, &connection_id)
            .await;
        if let Some(connection) = self.connection.as_mut() {
            connection.set_state(if closed {
                ConnectionState::Disconnected
            } else {
                ConnectionState::Failed
            });
        }

        self.state.transition(ControllerState::Terminated)?;
        if report.is_clean() {
            info!("Session torn down");
        } else {
            warn!("Session torn down with {} failed steps", report.failures.len());
        }
        Ok(report)
    }

    /// Run the whole session: connect, open, subscribe, listen, tear down
    pub async fn run<L, S>(self, listener: L, shutdown: S) -> Result<SessionSummary>
    where
        L: ChangeListener + 'static,
        S: Future<Output = ()>,
    {
        let span = operation_span("run", "session");
        self.run_inner(listener, shutdown).instrument(span).await
    }

    async fn run_inner<L, S>(mut self, listener: L, shutdown: S) -> Result<SessionSummary>
    where
        L: ChangeListener + 'static,
        S: Future<Output = ()>,
    {
        let endpoint = self.settings.endpoint.clone();
        let address = self.settings.address;

        let connection = self
            .establish_connection(&endpoint, self.settings.connect_timeout)
            .await?;
        let channel = self
            .open_channel(&connection, &address, self.settings.open_timeout)
            .await?;

        if let Err(e) = self.subscribe(&channel, listener).await {
            if let Err(teardown_error) = self.teardown().await {
                warn!("Teardown after failed subscribe: {}", teardown_error);
            }
            return Err(e);
        }

        let listen = self
            .run_until(self.settings.listen_duration, shutdown)
            .await?;
        let teardown = self.teardown().await?;

        Ok(SessionSummary {
            connection: channel.connection_id().clone(),
            endpoint: connection.endpoint().clone(),
            address: *channel.address(),
            last_reading: self.channel.as_ref().and_then(Channel::last_reading),
            listen,
            teardown,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use sensorflow_devices::clients::{CallLog, ClientCall, ScriptedClient};

    fn settings() -> SessionSettings {
        SessionSettings {
            endpoint: Endpoint::new("scripted", "localhost", 5661),
            ..SessionSettings::default()
        }
    }

    fn session(client: ScriptedClient) -> (SessionController, CallLog) {
        let log = client.log();
        (SessionController::new(Arc::new(client), settings()), log)
    }

    fn recorder() -> (Arc<Mutex<Vec<f64>>>, impl ChangeListener + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = move |event: &ChangeEvent| -> anyhow::Result<()> {
            sink.lock().unwrap().push(event.value);
            Ok(())
        };
        (seen, listener)
    }

    fn ignore(_: &ChangeEvent) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_open_call(call: &ClientCall) -> bool {
        matches!(call, ClientCall::OpenChannel(_))
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.server.port = 5700;
        config.channel.index = 2;
        config.channel.change_trigger = 0.01;
        config.session.listen_duration_ms = 1500;

        let settings = SessionSettings::from_config(&config).unwrap();
        assert_eq!(settings.endpoint.port, 5700);
        assert_eq!(settings.address.index, 2);
        assert_eq!(settings.tuning.change_trigger, 0.01);
        assert_eq!(settings.listen_duration, Duration::from_millis(1500));
        assert_eq!(settings.label, "VoltageRatio");

        config.server.port = 0;
        let err = SessionSettings::from_config(&config).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_order() {
        let (controller, log) = session(ScriptedClient::new());
        let (_, listener) = recorder();

        let summary = controller.run(listener, future::pending::<()>()).await.unwrap();

        let close_channel = log.position(&ClientCall::CloseChannel).unwrap();
        let close_connection = log.position(&ClientCall::CloseConnection).unwrap();
        let release = log.position(&ClientCall::ReleaseConnection).unwrap();
        assert!(close_channel < close_connection);
        assert!(close_connection < release);
        assert_eq!(release, log.calls().len() - 1);
        assert!(summary.teardown.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_short_circuits() {
        let (controller, log) = session(
            ScriptedClient::new().fail_connect(ConnectError::refused("localhost:5661")),
        );
        let mut states = controller.watch_state();
        let (seen, listener) = recorder();

        let err = controller.run(listener, future::pending::<()>()).await.unwrap_err();

        assert!(err.is_connect_failure());
        assert_eq!(err.exit_code(), 1);
        assert_eq!(log.count(is_open_call), 0);
        assert_eq!(log.calls().len(), 1);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(*states.borrow_and_update(), ControllerState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_skips_listening_and_releases() {
        let (controller, log) = session(
            ScriptedClient::new()
                .fail_open(OpenError::unavailable(&ChannelAddress::new(0), "no such input"))
                .emit_at(Duration::from_millis(10), 0.5),
        );
        let (seen, listener) = recorder();
        let started = Instant::now();

        let err = controller.run(listener, future::pending::<()>()).await.unwrap_err();

        assert!(matches!(err, SessionError::Open(OpenError::Unavailable { .. })));
        assert_ne!(err.exit_code(), 0);
        assert_eq!(log.position(&ClientCall::Subscribe), None);
        assert_eq!(log.position(&ClientCall::CloseChannel), None);
        assert!(log.position(&ClientCall::ReleaseConnection).is_some());
        assert!(seen.lock().unwrap().is_empty());
        assert!(started.elapsed() < settings().listen_duration);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_can_leave_connection() {
        let client = ScriptedClient::new().fail_open(OpenError::already_bound(&ChannelAddress::new(0)));
        let log = client.log();
        let settings = SessionSettings {
            release_on_open_failure: false,
            ..settings()
        };
        let controller = SessionController::new(Arc::new(client), settings);

        let err = controller.run(ignore, future::pending::<()>()).await.unwrap_err();

        assert!(matches!(err, SessionError::Open(OpenError::AlreadyBound { .. })));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(log.position(&ClientCall::CloseConnection), None);
        assert_eq!(log.position(&ClientCall::ReleaseConnection), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_for_lasts_exactly() {
        let readings: Vec<f64> = (0..2000).map(|i| f64::from(i) * 0.001).collect();
        let (mut controller, _) =
            session(ScriptedClient::new().emit_every(Duration::from_millis(5), &readings));
        let endpoint = controller.settings().endpoint.clone();
        let connection = tokio_test::assert_ok!(
            controller.establish_connection(&endpoint, Duration::from_secs(5)).await
        );
        let channel = tokio_test::assert_ok!(
            controller
                .open_channel(&connection, &ChannelAddress::new(0), Duration::from_secs(5))
                .await
        );
        tokio_test::assert_ok!(controller.subscribe(&channel, ignore).await);

        let started = Instant::now();
        let report = controller.run_for(Duration::from_millis(5000)).await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_millis(5000));
        assert_eq!(report.listened, Duration::from_millis(5000));
        assert_eq!(report.outcome, ListenOutcome::Elapsed);
        assert!(report.received > 0);
        assert_eq!(report.delivered, report.received);
        assert_eq!(controller.state(), ControllerState::Listening);

        controller.teardown().await.unwrap();
        assert_eq!(controller.state(), ControllerState::Terminated);
        assert_eq!(controller.channel().map(Channel::state), Some(ChannelState::Closed));
        assert_eq!(
            controller.connection().map(Connection::state),
            Some(ConnectionState::Disconnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_marks_connection_failed() {
        let (mut controller, _) = session(
            ScriptedClient::new().fail_connect(ConnectError::refused("localhost:5661")),
        );
        let endpoint = controller.settings().endpoint.clone();

        let err = tokio_test::assert_err!(
            controller.establish_connection(&endpoint, Duration::from_secs(5)).await
        );

        assert!(err.is_connect_failure());
        assert_eq!(controller.state(), ControllerState::Terminated);
        let connection = controller.connection().unwrap();
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert_eq!(connection.id(), None);
        assert_eq!(connection.endpoint(), &endpoint);
    }

    /// Collects formatted log output
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_left_to_the_caller_to_report() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::ERROR)
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let (controller, _) = session(
            ScriptedClient::new().fail_connect(ConnectError::refused("localhost:5661")),
        );
        let err = controller.run(ignore, future::pending::<()>()).await.unwrap_err();

        assert!(err.is_connect_failure());
        assert!(captured.0.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_states() {
        let failure = || OpenError::unavailable(&ChannelAddress::new(0), "no such input");
        let (mut released, _) = session(ScriptedClient::new().fail_open(failure()));
        let (mut kept, log) = session(ScriptedClient::new().fail_open(failure()));
        kept.settings.release_on_open_failure = false;

        for controller in [&mut released, &mut kept] {
            let endpoint = controller.settings().endpoint.clone();
            let connection = tokio_test::assert_ok!(
                controller.establish_connection(&endpoint, Duration::from_secs(5)).await
            );
            tokio_test::assert_err!(
                controller
                    .open_channel(&connection, &ChannelAddress::new(0), Duration::from_secs(5))
                    .await
            );
            assert_eq!(controller.channel().map(Channel::state), Some(ChannelState::Failed));
            assert_eq!(controller.state(), ControllerState::Terminated);
        }

        assert_eq!(
            released.connection().map(Connection::state),
            Some(ConnectionState::Disconnected)
        );
        assert_eq!(
            kept.connection().map(Connection::state),
            Some(ConnectionState::Connected)
        );
        assert_eq!(log.position(&ClientCall::CloseConnection), None);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_events_delivered_in_order_then_teardown() {
        let (controller, log) = session(
            ScriptedClient::new().emit_every(Duration::from_millis(500), &[1.01, 1.02, 0.99]),
        );
        let (seen, listener) = recorder();

        let summary = controller.run(listener, future::pending::<()>()).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1.01, 1.02, 0.99]);
        assert_eq!(summary.listen.delivered, 3);
        assert_eq!(summary.last_reading, Some(0.99));
        assert_eq!(summary.listen.outcome, ListenOutcome::Elapsed);
        let calls = log.calls();
        assert_eq!(
            &calls[calls.len() - 3..],
            &[
                ClientCall::CloseChannel,
                ClientCall::CloseConnection,
                ClientCall::ReleaseConnection
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (controller, log) =
            session(ScriptedClient::new().connect_delay(Duration::from_secs(30)));
        let started = Instant::now();

        let err = controller
            .run(ignore, future::pending::<()>())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Connect(ConnectError::Timeout { .. })));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(started.elapsed(), settings().connect_timeout);
        assert_eq!(
            log.calls(),
            vec![ClientCall::Connect {
                host: "localhost".to_string(),
                port: 5661
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout() {
        let (controller, log) =
            session(ScriptedClient::new().open_delay(Duration::from_secs(30)));

        let err = controller
            .run(ignore, future::pending::<()>())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Open(OpenError::Timeout { .. })));
        assert_eq!(log.position(&ClientCall::Subscribe), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_failures_do_not_end_session() {
        let (controller, log) = session(
            ScriptedClient::new().emit_every(Duration::from_millis(100), &[0.1, 0.2, 0.3]),
        );
        let listener = |event: &ChangeEvent| -> anyhow::Result<()> {
            if event.value > 0.25 {
                panic!("reading too high");
            }
            anyhow::ensure!(event.value > 0.15, "reading too low");
            Ok(())
        };

        let summary = controller.run(listener, future::pending::<()>()).await.unwrap();

        assert_eq!(summary.listen.received, 3);
        assert_eq!(summary.listen.delivered, 1);
        assert_eq!(summary.listen.listener_failures, 2);
        assert!(log.position(&ClientCall::ReleaseConnection).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_listening_early() {
        let (controller, log) = session(ScriptedClient::new());
        let started = Instant::now();
        let shutdown = tokio::time::sleep(Duration::from_millis(1200));

        let summary = controller
            .run(ignore, shutdown)
            .await
            .unwrap();

        assert_eq!(summary.listen.outcome, ListenOutcome::Shutdown);
        assert_eq!(started.elapsed(), Duration::from_millis(1200));
        assert!(log.position(&ClientCall::ReleaseConnection).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_failure_is_reported_not_fatal() {
        let (controller, log) = session(ScriptedClient::new().fail_close_channel());

        let summary = controller
            .run(ignore, future::pending::<()>())
            .await
            .unwrap();

        assert!(!summary.teardown.is_clean());
        assert_eq!(summary.teardown.attempted.len(), 3);
        assert!(log.position(&ClientCall::ReleaseConnection).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_session_still_tears_down() {
        let (controller, log) = session(ScriptedClient::new());

        let cancelled = tokio::time::timeout(
            Duration::from_millis(1000),
            controller.run(ignore, future::pending::<()>()),
        )
        .await;
        assert!(cancelled.is_err());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let calls = log.calls();
        assert_eq!(
            &calls[calls.len() - 3..],
            &[
                ClientCall::CloseChannel,
                ClientCall::CloseConnection,
                ClientCall::ReleaseConnection
            ]
        );
    }

    #[tokio::test]
    async fn test_illegal_calls_are_rejected() {
        let (mut controller, log) = session(ScriptedClient::new());

        let err = controller.run_for(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, SessionError::State(_)));
        assert!(matches!(controller.teardown().await, Err(SessionError::State(_))));
        assert!(log.calls().is_empty());
    }
}
