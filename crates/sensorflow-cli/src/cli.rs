//! Command line arguments and their mapping onto configuration keys.
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use sensorflow_core::config::ConfigBuilder;
use sensorflow_devices::{DeviceError, Endpoint};

#[derive(Debug, Parser)]
#[command(
    name = "sensorflow",
    author,
    version,
    about = "Open one sensor channel on a device server and log its readings",
    long_about = None
)]
pub struct Cli {
    #[arg(
        short,
        long,
        env = "SENSORFLOW_CONFIG",
        help = "TOML configuration file"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        help = "Connection string, e.g. tcp://host=10.0.0.2;port=8888;read_command=AI{index}R"
    )]
    pub endpoint: Option<String>,

    #[arg(long, help = "Client backend (simulated, tcp)")]
    pub backend: Option<String>,

    #[arg(long, help = "Device server host")]
    pub host: Option<String>,

    #[arg(short, long, help = "Device server port")]
    pub port: Option<u16>,

    #[arg(long = "channel", help = "Channel index on the device")]
    pub channel: Option<u32>,

    #[arg(long = "serial", allow_negative_numbers = true, help = "Device serial number, -1 for any")]
    pub serial: Option<i32>,

    #[arg(long = "hub-port", allow_negative_numbers = true, help = "Hub port, -1 for any")]
    pub hub_port: Option<i32>,

    #[arg(short, long = "duration-ms", help = "How long to listen, in milliseconds")]
    pub duration_ms: Option<u64>,

    #[arg(long = "log-level", help = "Log filter, e.g. info or sensorflow_session=debug")]
    pub log_level: Option<String>,

    #[arg(long = "json-logs", action = ArgAction::SetTrue, help = "Emit logs as JSON")]
    pub json_logs: bool,

    #[arg(
        long = "print-config",
        action = ArgAction::SetTrue,
        help = "Print the effective configuration as TOML and exit"
    )]
    pub print_config: bool,
}

impl Cli {
    /// Parsed `--endpoint`, if given
    pub fn endpoint(&self) -> Result<Option<Endpoint>, DeviceError> {
        self.endpoint.as_deref().map(Endpoint::parse).transpose()
    }

    /// Configuration keys set on the command line, in application order.
    /// Explicit `--backend`, `--host` and `--port` win over `--endpoint`.
    pub fn overrides(&self) -> Result<Vec<(&'static str, String)>, DeviceError> {
        let mut overrides = Vec::new();

        if let Some(endpoint) = self.endpoint()? {
            overrides.push(("server.backend", endpoint.backend));
            overrides.push(("server.host", endpoint.host));
            overrides.push(("server.port", endpoint.port.to_string()));
        }
        if let Some(backend) = &self.backend {
            overrides.push(("server.backend", backend.clone()));
        }
        if let Some(host) = &self.host {
            overrides.push(("server.host", host.clone()));
        }
        if let Some(port) = self.port {
            overrides.push(("server.port", port.to_string()));
        }
        if let Some(index) = self.channel {
            overrides.push(("channel.index", index.to_string()));
        }
        if let Some(serial) = self.serial {
            overrides.push(("channel.serial_number", serial.to_string()));
        }
        if let Some(hub_port) = self.hub_port {
            overrides.push(("channel.hub_port", hub_port.to_string()));
        }
        if let Some(duration) = self.duration_ms {
            overrides.push(("session.listen_duration_ms", duration.to_string()));
        }
        if let Some(level) = &self.log_level {
            overrides.push(("logging.level", level.clone()));
        }
        if self.json_logs {
            overrides.push(("logging.json_format", "true".to_string()));
        }

        Ok(overrides)
    }

    /// Layered configuration: defaults, file, environment, command line
    pub fn config_builder(&self) -> Result<ConfigBuilder, DeviceError> {
        let mut builder = ConfigBuilder::new().with_default_environment();
        if let Some(path) = &self.config {
            builder = builder.with_required_config_file(path);
        }
        for (key, value) in self.overrides()? {
            builder = builder.set_override(key, value);
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::CommandFactory;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sensorflow").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_arguments_no_overrides() {
        let cli = parse(&[]);
        assert!(cli.overrides().unwrap().is_empty());
        assert!(!cli.print_config);
    }

    #[test]
    fn test_flags_map_to_keys() {
        let cli = parse(&[
            "--host",
            "10.0.0.7",
            "--port",
            "5700",
            "--channel",
            "2",
            "--serial",
            "-1",
            "--hub-port",
            "3",
            "--duration-ms",
            "1500",
            "--json-logs",
        ]);
        let overrides = cli.overrides().unwrap();
        assert!(overrides.contains(&("server.host", "10.0.0.7".to_string())));
        assert!(overrides.contains(&("server.port", "5700".to_string())));
        assert!(overrides.contains(&("channel.index", "2".to_string())));
        assert!(overrides.contains(&("channel.serial_number", "-1".to_string())));
        assert!(overrides.contains(&("channel.hub_port", "3".to_string())));
        assert!(overrides.contains(&("session.listen_duration_ms", "1500".to_string())));
        assert!(overrides.contains(&("logging.json_format", "true".to_string())));
    }

    #[test]
    fn test_explicit_flags_win_over_endpoint() {
        let cli = parse(&["--endpoint", "tcp://host=10.0.0.2;port=8888", "--port", "9999"]);
        let config = cli.config_builder().unwrap().build().unwrap();
        assert_eq!(config.server.backend, "tcp");
        assert_eq!(config.server.host, "10.0.0.2");
        assert_eq!(config.server.port, 9999);
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        let cli = parse(&["--endpoint", "localhost:5661"]);
        assert!(matches!(cli.overrides(), Err(DeviceError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_file_then_command_line() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[server]\nhost = \"lab-server\"\nport = 5662\n\n[session]\nlisten_duration_ms = 250"
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let cli = parse(&["--config", &path, "--duration-ms", "750"]);
        let config = cli.config_builder().unwrap().build().unwrap();

        assert_eq!(config.server.host, "lab-server");
        assert_eq!(config.server.port, 5662);
        assert_eq!(config.session.listen_duration_ms, 750);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = parse(&["--config", "/nonexistent/sensorflow.toml"]);
        assert!(cli.config_builder().unwrap().build().is_err());
    }

    #[test]
    fn test_usage_errors() {
        assert!(Cli::try_parse_from(["sensorflow", "--port", "not-a-port"]).is_err());
        assert!(Cli::try_parse_from(["sensorflow", "--bogus"]).is_err());
    }
}
