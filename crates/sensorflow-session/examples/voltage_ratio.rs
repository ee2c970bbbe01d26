use std::sync::Arc;
use std::time::Duration;

use sensorflow_devices::clients::{SimulatedClient, SimulatedSettings};
use sensorflow_devices::Endpoint;
use sensorflow_session::{LoggingListener, SessionController, SessionSettings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    sensorflow_core::logging::init()?;

    // An in-process server standing in for a real device server on localhost:5661
    let client = Arc::new(SimulatedClient::new(SimulatedSettings::default()));

    let settings = SessionSettings {
        endpoint: Endpoint::new("simulated", "localhost", 5661),
        listen_duration: Duration::from_secs(5),
        ..SessionSettings::default()
    };
    let listener = LoggingListener::new(settings.label.clone());

    let summary = SessionController::new(client, settings)
        .run(listener, futures::future::pending::<()>())
        .await?;

    println!(
        "Received {} readings from {}, last {:?}",
        summary.listen.received, summary.endpoint, summary.last_reading
    );
    Ok(())
}
