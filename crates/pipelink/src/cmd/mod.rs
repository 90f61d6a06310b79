use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::{Args, Subcommand};
use pipelink_peer::{Endpoint, Event, ServerConfig};
use pipelink_transport::SOCKET_DIR_ENV;

use crate::exit::{transport_error, CliError, CliResult};
use crate::output::OutputFormat;

pub mod echo;
pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a server that writes every message back to its sender.
    Echo(EchoArgs),
    /// Send a single message.
    Send(SendArgs),
    /// Run a server and print received messages.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args).await,
        Command::Send(args) => send::run(args, format).await,
        Command::Listen(args) => listen::run(args, format).await,
        Command::Version(args) => version::run(args, format),
    }
}

#[derive(Args, Debug)]
pub struct EndpointArgs {
    /// Endpoint name shared by server and clients, or a socket path.
    #[arg(env = "PIPELINK_ENDPOINT")]
    pub endpoint: String,
    /// Directory holding socket files for bare endpoint names (Unix).
    #[arg(long, value_name = "DIR", env = SOCKET_DIR_ENV)]
    pub socket_dir: Option<PathBuf>,
}

impl EndpointArgs {
    pub fn resolve(&self) -> CliResult<Endpoint> {
        let endpoint = Endpoint::new(self.endpoint.as_str())
            .map_err(|err| transport_error("invalid endpoint", &err))?;
        Ok(match &self.socket_dir {
            Some(dir) => endpoint.in_directory(dir),
            None => endpoint,
        })
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Serve exactly one client, then exit when it disconnects.
    #[arg(long)]
    pub single: bool,
    /// Wait for a previous server on the endpoint to exit instead of failing.
    #[arg(long)]
    pub wait_free: bool,
}

impl ServeArgs {
    pub fn server_config(&self) -> CliResult<ServerConfig> {
        let endpoint = self.endpoint.resolve()?;
        let config = if self.single {
            ServerConfig::single_connection(endpoint)
        } else {
            ServerConfig::new(endpoint)
        };
        Ok(config.with_wait_free_endpoint(self.wait_free))
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Wait for one reply message and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the reply when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
    /// Maximum time to keep trying to reach the server.
    #[arg(long, default_value = "5s")]
    pub connect_timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    #[command(flatten)]
    pub serve: ServeArgs,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// True once a single-connection server has lost its only client.
pub fn session_over(single: bool, event: &Event<Bytes>) -> bool {
    single && matches!(event, Event::Disconnected { .. })
}

/// Parse `500ms`, `5s`, `2m` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::usage("duration must not be empty"));
    }

    let (number, scale): (&str, fn(u64) -> Duration) =
        if let Some(num) = input.strip_suffix("ms") {
            (num, Duration::from_millis)
        } else if let Some(num) = input.strip_suffix('s') {
            (num, Duration::from_secs)
        } else if let Some(num) = input.strip_suffix('m') {
            (num, |mins| Duration::from_secs(mins.saturating_mul(60)))
        } else {
            (input, Duration::from_secs)
        };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| CliError::usage(format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::usage("duration must be greater than zero"));
    }
    Ok(scale(value))
}
