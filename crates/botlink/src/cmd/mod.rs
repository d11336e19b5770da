use std::path::PathBuf;
use std::time::Duration;

use botlink_frame::{ChecksumKind, Framing};
use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a host and print messages received from robots.
    Serve(ServeArgs),
    /// Act as a robot: send one frame to a host.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen address, e.g. 0.0.0.0:5760. Overrides the config file.
    #[arg(long)]
    pub bind: Option<String>,
    /// JSON host configuration file.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Maximum simultaneously connected robots.
    #[arg(long)]
    pub max_clients: Option<usize>,
    /// Framing strategy: length-prefixed or delimited.
    #[arg(long)]
    pub framing: Option<Framing>,
    /// Trailer checksum: crc8 or xor.
    #[arg(long)]
    pub checksum: Option<ChecksumKind>,
    /// Send every received message back to its robot.
    #[arg(long)]
    pub echo: bool,
    /// Only process these type ids (comma-separated); others are blocked.
    #[arg(long, value_delimiter = ',', value_parser = parse_type_id)]
    pub allow: Option<Vec<u8>>,
    /// Exit after printing N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Host address, e.g. 127.0.0.1:5760.
    pub addr: String,
    /// Message type id (decimal or 0x-prefixed hex).
    #[arg(long = "type", short = 't', value_parser = parse_type_id, default_value = "0x01")]
    pub type_id: u8,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Framing strategy: length-prefixed or delimited.
    #[arg(long, default_value = "length-prefixed")]
    pub framing: Framing,
    /// Trailer checksum: crc8 or xor.
    #[arg(long, default_value = "crc8")]
    pub checksum: ChecksumKind,
    /// Wait for one reply of this type and print it.
    #[arg(long, value_parser = parse_type_id)]
    pub wait_type: Option<u8>,
    /// Maximum time to wait for the reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `16` or `0x10`.
pub fn parse_type_id(input: &str) -> Result<u8, String> {
    let input = input.trim();
    let parsed = match input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.map_err(|_| format!("invalid type id '{input}' (expected 0-255 or 0x00-0xff)"))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
