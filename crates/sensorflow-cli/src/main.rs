//! `sensorflow`: open one sensor channel on a device server, print its
//! readings for a fixed time, then close everything down.
//!
//! Exit status: 0 when the session ran and was torn down (also after
//! Ctrl-C), 1 when connecting or opening the channel failed, 2 for
//! configuration and usage errors.
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use sensorflow_core::logging;
use sensorflow_devices::{ChangeEvent, ClientRegistry, Endpoint};
use sensorflow_session::{LoggingListener, SessionController, SessionError, SessionSettings};

mod cli;

use cli::Cli;

/// Exit status for configuration and usage errors
const EXIT_USAGE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("sensorflow: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Exit status for a failed run
fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<SessionError>() {
        Some(session) => session.exit_code(),
        None => EXIT_USAGE,
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let config = cli
        .config_builder()
        .context("invalid --endpoint")?
        .build()
        .context("failed to load configuration")?;

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    logging::init_from_config(&config.logging)?;

    let mut settings = SessionSettings::from_config(&config)?;
    settings.endpoint = endpoint_with_params(settings.endpoint, cli.endpoint()?);

    let registry = ClientRegistry::with_defaults();
    let client = registry
        .create_client(&settings.endpoint)
        .with_context(|| format!("no client for {}", settings.endpoint))?;
    info!(
        "Using {} client for {}, channel {}",
        client.name(),
        settings.endpoint,
        settings.address
    );

    let label = LoggingListener::new(settings.label.clone());
    let listener = move |event: &ChangeEvent| -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", label.format(event))?;
        Ok(())
    };

    let summary = SessionController::new(Arc::clone(&client), settings)
        .run(listener, shutdown_signal())
        .await?;

    info!(
        "Session finished ({}): {} readings, last {:?}",
        summary.listen.outcome, summary.listen.received, summary.last_reading
    );
    if !summary.teardown.is_clean() {
        warn!("Teardown reported {} failed steps", summary.teardown.failures.len());
    }
    Ok(())
}

/// Keep backend parameters from `--endpoint`; the target itself comes from config
fn endpoint_with_params(mut endpoint: Endpoint, given: Option<Endpoint>) -> Endpoint {
    if let Some(given) = given {
        if given.backend == endpoint.backend {
            endpoint.params = given.params;
        }
    }
    endpoint
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        futures::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use sensorflow_core::error::Error as CoreError;
    use sensorflow_devices::{ChannelAddress, ConnectError, OpenError};

    #[test]
    fn test_exit_codes() {
        let connect = anyhow::Error::from(SessionError::from(ConnectError::timeout(
            "localhost:5661",
            Duration::from_secs(5),
        )));
        assert_eq!(exit_code(&connect), 1);

        let open = anyhow::Error::from(SessionError::from(OpenError::already_bound(
            &ChannelAddress::new(0),
        )));
        assert_eq!(exit_code(&open), 1);

        let config = anyhow::Error::from(CoreError::config("server.port must be non-zero"))
            .context("failed to load configuration");
        assert_eq!(exit_code(&config), 2);

        let session_config = anyhow::Error::from(SessionError::from(CoreError::config("bad")));
        assert_eq!(exit_code(&session_config), 2);
    }

    #[test]
    fn test_endpoint_params_follow_matching_backend() {
        let configured = Endpoint::new("tcp", "10.0.0.2", 9999);
        let given = Endpoint::parse("tcp://host=10.0.0.2;port=8888;read_command=MEAS{index}").unwrap();

        let endpoint = endpoint_with_params(configured.clone(), Some(given));
        assert_eq!(endpoint.port, 9999);
        assert_eq!(endpoint.params.get("read_command").map(String::as_str), Some("MEAS{index}"));

        let other = Endpoint::parse("simulated://host=h;port=1;channels=2").unwrap();
        assert!(endpoint_with_params(configured, Some(other)).params.is_empty());
    }

    #[tokio::test]
    async fn test_simulated_session_end_to_end() {
        let cli = Cli::try_parse_from([
            "sensorflow",
            "--endpoint",
            "simulated://host=localhost;port=5661;latency_ms=0",
            "--duration-ms",
            "300",
        ])
        .unwrap();
        let config = cli.config_builder().unwrap().build().unwrap();
        let mut settings = SessionSettings::from_config(&config).unwrap();
        settings.endpoint = endpoint_with_params(settings.endpoint, cli.endpoint().unwrap());

        let client = ClientRegistry::with_defaults()
            .create_client(&settings.endpoint)
            .unwrap();
        let summary = SessionController::new(client, settings)
            .run(|_: &ChangeEvent| -> Result<()> { Ok(()) }, futures::future::pending::<()>())
            .await
            .unwrap();

        assert!(summary.teardown.is_clean());
        assert!(summary.listen.received >= 1);
    }

    #[tokio::test]
    async fn test_refused_connection_exits_with_one() {
        let cli = Cli::try_parse_from([
            "sensorflow",
            "--endpoint",
            "simulated://host=localhost;port=5661;refuse=true",
        ])
        .unwrap();

        let err = execute(cli).await.unwrap_err();
        assert_eq!(exit_code(&err), 1);
    }
}
