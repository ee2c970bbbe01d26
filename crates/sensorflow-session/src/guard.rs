/*!
 * Ordered teardown and the guard that guarantees it.
 *
 * Teardown always runs close-channel, close-connection, release-connection
 * in that order. A failing step is logged and the remaining steps still run.
 * [`TeardownGuard`] holds the ids between connect and teardown; if it is
 * dropped while still armed (the session future was cancelled) it schedules
 * the same teardown on the current tokio runtime.
 */
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use sensorflow_core::types::Id;
use sensorflow_devices::DeviceClient;

/// One teardown call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    /// `close_channel`
    CloseChannel,
    /// `close_connection`
    CloseConnection,
    /// `release_connection`
    ReleaseConnection,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeardownStep::CloseChannel => "close channel",
            TeardownStep::CloseConnection => "close connection",
            TeardownStep::ReleaseConnection => "release connection",
        };
        f.write_str(name)
    }
}

/// What happened during teardown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Steps attempted, in order
    pub attempted: Vec<TeardownStep>,
    /// Steps that failed, with the error message
    pub failures: Vec<(TeardownStep, String)>,
}

impl TeardownReport {
    /// Whether every attempted step succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Run one step against `client` and record the outcome; `true` on success
    pub async fn step(&mut self, client: &dyn DeviceClient, step: TeardownStep, id: &Id) -> bool {
        self.attempted.push(step);
        let result = match step {
            TeardownStep::CloseChannel => client.close_channel(id).await,
            TeardownStep::CloseConnection => client.close_connection(id).await,
            TeardownStep::ReleaseConnection => client.release_connection(id).await,
        };

        match result {
            Ok(()) => {
                debug!("Teardown: {} {} done", step, id.short());
                true
            }
            Err(e) => {
                warn!("Teardown: {} {} failed: {}", step, id.short(), e);
                self.failures.push((step, e.to_string()));
                false
            }
        }
    }
}

/// Run the full ordered teardown
pub async fn ordered_teardown(
    client: &dyn DeviceClient,
    channel: Option<&Id>,
    connection: &Id,
) -> TeardownReport {
    let mut report = TeardownReport::default();
    if let Some(channel) = channel {
        report.step(client, TeardownStep::CloseChannel, channel).await;
    }
    report.step(client, TeardownStep::CloseConnection, connection).await;
    report.step(client, TeardownStep::ReleaseConnection, connection).await;
    report
}

/// Holds a live connection (and channel) until teardown is claimed
#[derive(Debug)]
pub struct TeardownGuard {
    client: Arc<dyn DeviceClient>,
    connection: Option<Id>,
    channel: Option<Id>,
}

impl TeardownGuard {
    /// Guard a freshly established connection
    pub fn new(client: Arc<dyn DeviceClient>, connection: Id) -> Self {
        Self {
            client,
            connection: Some(connection),
            channel: None,
        }
    }

    /// Include an opened channel in the guarded teardown
    pub fn set_channel(&mut self, channel: Id) {
        self.channel = Some(channel);
    }

    /// Whether the guard would still tear down on drop
    pub fn is_armed(&self) -> bool {
        self.connection.is_some()
    }

    /// Take the ids and disarm; the caller now owns teardown
    pub fn disarm(&mut self) -> Option<(Option<Id>, Id)> {
        let connection = self.connection.take()?;
        Some((self.channel.take(), connection))
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some((channel, connection)) = self.disarm() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    "Session dropped before teardown, scheduling teardown of {}",
                    connection.short()
                );
                let client = Arc::clone(&self.client);
                handle.spawn(async move {
                    let report = ordered_teardown(client.as_ref(), channel.as_ref(), &connection).await;
                    debug!("Deferred teardown finished: {:?}", report);
                });
            }
            Err(_) => {
                warn!(
                    "Session dropped outside a runtime, connection {} was not torn down",
                    connection.short()
                );
            }
        }
    }
}
