// heatlink -- command-line reader for heat pump controllers.
//
// Usage:
//   heatlink --port /dev/ttyUSB0 version
//   heatlink --port /dev/ttyUSB0 --schema-dir schemas sensors
//   heatlink --port /dev/ttyUSB0 --schema schemas/2.06.json request Sensors
//   heatlink --port /dev/ttyUSB0 --schema-dir schemas monitor --interval 60
//   heatlink --schema schemas/2.06.json schema
//   heatlink --schema schemas/2.06.json set ComfortTemp 21.5

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use heatlink_core::{DataType, DirectorySchemaProvider, Readings, Schema};
use heatlink_protocol::decoder::build_setting_message;
use heatlink_protocol::{Session, SessionBuilder};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// heatlink -- reads sensors, status and settings from a heat pump.
#[derive(Parser)]
#[command(name = "heatlink", version, about)]
struct Cli {
    /// Serial port path (e.g. /dev/ttyUSB0, COM3).
    /// Required for every command that talks to the device.
    #[arg(long)]
    port: Option<String>,

    /// Baud rate of the serial line.
    #[arg(short, long, default_value_t = 9600)]
    baud: u32,

    /// Schema file describing the device's requests (e.g. schemas/2.06.json).
    #[arg(long, conflicts_with = "schema_dir")]
    schema: Option<PathBuf>,

    /// Directory of schema files named `<version>.json`. The schema is
    /// chosen from the firmware version reported by the device.
    #[arg(long)]
    schema_dir: Option<PathBuf>,

    /// Pause between requests in milliseconds.
    #[arg(long, default_value_t = 1500)]
    delay_ms: u64,

    /// How many times a request is sent before giving up.
    #[arg(long, default_value_t = 10)]
    retries: u32,

    /// Handshake attempts per request.
    #[arg(long, default_value_t = 3)]
    handshake_attempts: u32,

    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the firmware version reported by the device.
    Version,
    /// Read all sensor values.
    Sensors,
    /// Read all status flags.
    Status,
    /// Read all settings.
    Settings,
    /// Run one schema request by name and print every decoded record.
    Request {
        /// Request name as it appears in the schema (case-insensitive).
        name: String,
    },
    /// Read sensors repeatedly until the duration elapses or Ctrl-C.
    Monitor {
        /// Seconds between two reads.
        #[arg(long, default_value_t = 60)]
        interval: u64,
        /// Total seconds to run (0 = until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },
    /// List the requests and records of the loaded schema.
    Schema,
    /// Print the SET message that would write a setting. Nothing is sent.
    Set {
        /// Setting record name.
        name: String,
        /// New value in display units.
        value: f64,
    },
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_schema_file(cli: &Cli) -> Result<Option<Schema>> {
    match &cli.schema {
        Some(path) => {
            let schema = Schema::from_json_file(path)
                .with_context(|| format!("failed to load schema {}", path.display()))?;
            Ok(Some(schema))
        }
        None => Ok(None),
    }
}

fn require_schema(cli: &Cli) -> Result<Schema> {
    load_schema_file(cli)?.context("--schema is required for this command")
}

async fn open_session(cli: &Cli) -> Result<Session> {
    let port = cli
        .port
        .as_deref()
        .context("--port is required for commands that talk to the device")?;

    info!(port, baud = cli.baud, "opening heat pump session");
    let mut builder = SessionBuilder::new()
        .serial_port(port)
        .baud_rate(cli.baud)
        .inter_request_delay(Duration::from_millis(cli.delay_ms))
        .request_retries(cli.retries)
        .handshake_attempts(cli.handshake_attempts);
    if let Some(schema) = load_schema_file(cli)? {
        builder = builder.schema(schema);
    }

    let mut session = builder
        .build()
        .await
        .with_context(|| format!("failed to open {port}"))?;

    if let Some(dir) = &cli.schema_dir {
        let provider = DirectorySchemaProvider::new(dir);
        let version = session
            .load_schema_for_device(&provider)
            .await
            .context("failed to select a schema for the device")?;
        println!("Firmware {version}, schema {}", dir.join(format!("{version}.json")).display());
    }

    Ok(session)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_readings(readings: &Readings) {
    if readings.is_empty() {
        println!("(no values)");
    }
    for (name, reading) in &readings.values {
        println!("{name:<32}  {:>14}  {}", reading.to_string(), reading.data_type);
    }
    for warning in &readings.warnings {
        eprintln!("[warning] {warning}");
    }
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

async fn cmd_version(session: &mut Session) -> Result<()> {
    let version = session.get_version().await.context("failed to read version")?;
    println!("Firmware version: {version}");
    Ok(())
}

async fn cmd_group(session: &mut Session, data_type: DataType) -> Result<()> {
    let readings = session
        .read_group(data_type)
        .await
        .with_context(|| format!("failed to read {data_type} values"))?;
    print_readings(&readings);
    Ok(())
}

async fn cmd_request(session: &mut Session, name: &str) -> Result<()> {
    let readings = session
        .read_request(name)
        .await
        .with_context(|| format!("request {name} failed"))?;
    print_readings(&readings);
    Ok(())
}

async fn cmd_monitor(session: &mut Session, interval_secs: u64, duration_secs: u64) -> Result<()> {
    if interval_secs == 0 {
        bail!("--interval must be at least 1 second");
    }
    println!("Monitoring sensors every {interval_secs}s (Ctrl-C to stop)...");

    let deadline = (duration_secs > 0).then(|| Instant::now() + Duration::from_secs(duration_secs));
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted.");
                break;
            }
            _ = ticker.tick() => {
                if deadline.is_some_and(|dl| Instant::now() >= dl) {
                    println!("Monitor duration elapsed.");
                    break;
                }
                match session.read_sensors().await {
                    Ok(readings) => {
                        println!("--- {} ---", unix_timestamp());
                        print_readings(&readings);
                    }
                    Err(e) if e.is_fatal() => return Err(e).context("monitoring stopped"),
                    Err(e) => eprintln!("[error] {e}"),
                }
            }
        }
    }
    Ok(())
}

/// Seconds since the Unix epoch, for monitor headers.
fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn cmd_schema(schema: &Schema) -> Result<()> {
    println!("Schema {}", schema.id());
    for request in schema.requests() {
        println!(
            "\n{} (0x{:02X}) {}",
            request.name, request.request_byte, request.description
        );
        for record in &request.record_definitions {
            let bit = record
                .bit_position
                .map(|b| format!(" bit {b}"))
                .unwrap_or_default();
            println!(
                "  {:<32}  @{:<3} len {}{bit:<7}  scale {:<6}  {}",
                record.name,
                record.position,
                record.length,
                record.scale,
                record.data_type
            );
        }
    }
    Ok(())
}

fn cmd_set(schema: &Schema, name: &str, value: f64) -> Result<()> {
    let (request, record) = schema
        .find_record(name)
        .with_context(|| format!("schema {} has no record {name}", schema.id()))?;
    let message = build_setting_message(request, record, value)
        .with_context(|| format!("cannot set {name}"))?;

    let hex: Vec<String> = message.iter().map(|b| format!("{b:02X}")).collect();
    println!("{} = {value} via {}: {}", record.name, request.name, hex.join(" "));
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Offline commands need only the schema file.
    match &cli.command {
        Command::Schema => return cmd_schema(&require_schema(&cli)?),
        Command::Set { name, value } => return cmd_set(&require_schema(&cli)?, name, *value),
        _ => {}
    }
    let mut session = open_session(&cli).await?;

    let result = match &cli.command {
        Command::Version => cmd_version(&mut session).await,
        Command::Sensors => cmd_group(&mut session, DataType::Sensor).await,
        Command::Status => cmd_group(&mut session, DataType::Status).await,
        Command::Settings => cmd_group(&mut session, DataType::Settings).await,
        Command::Request { name } => cmd_request(&mut session, name).await,
        Command::Monitor { interval, duration } => {
            cmd_monitor(&mut session, *interval, *duration).await
        }
        Command::Schema | Command::Set { .. } => Ok(()),
    };

    session.shutdown().await.ok();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_device_line() {
        let cli = Cli::parse_from(["heatlink", "--port", "/dev/ttyUSB0", "sensors"]);
        assert_eq!(cli.baud, 9600);
        assert_eq!(cli.delay_ms, 1500);
        assert_eq!(cli.retries, 10);
        assert!(matches!(cli.command, Command::Sensors));
    }

    #[test]
    fn schema_options_conflict() {
        let result = Cli::try_parse_from([
            "heatlink",
            "--schema",
            "a.json",
            "--schema-dir",
            "schemas",
            "version",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn set_parses_value() {
        let cli = Cli::parse_from(["heatlink", "--schema", "2.06.json", "set", "ComfortTemp", "21.5"]);
        match cli.command {
            Command::Set { name, value } => {
                assert_eq!(name, "ComfortTemp");
                assert_eq!(value, 21.5);
            }
            _ => panic!("expected set command"),
        }
        assert!(matches!(
            Cli::parse_from(["heatlink", "schema"]).command,
            Command::Schema
        ));
    }
}
