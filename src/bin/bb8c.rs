use bb8_controller::*;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// MAC address or platform id of the BB-8 to use
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Seconds to wait for a BB-8 to show up
    #[arg(short, long, global = true, default_value_t = 10)]
    timeout: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Cycle through a few colors
    Demo {
        /// Duration of each demo step in seconds
        #[arg(short, long, default_value_t = 2)]
        duration: u64,
    },
    /// Set to red color
    Red,
    /// Set to green color
    Green,
    /// Set to blue color
    Blue,
    /// Set to white color
    White,
    /// Turn the LEDs off
    Off,
    /// Set custom RGB color
    Color {
        /// Red value (0-255)
        #[arg(short, long, default_value_t = 255)]
        red: i64,
        /// Green value (0-255)
        #[arg(short, long, default_value_t = 255)]
        green: i64,
        /// Blue value (0-255)
        #[arg(short, long, default_value_t = 255)]
        blue: i64,
    },
    /// Send a raw command frame
    Raw {
        /// Virtual device id
        #[arg(short, long, value_parser = parse_cli_byte)]
        device_id: u8,
        /// Command id
        #[arg(short, long, value_parser = parse_cli_byte)]
        command_id: u8,
        /// Payload as hex, e.g. ff000000
        #[arg(short, long, default_value = "")]
        payload: String,
    },
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    // Initialize tracing with pretty colors
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("bb8_controller=info")),
        )
        .compact()
        .init();

    // Initialize color-eyre for pretty error reporting
    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    let chooser = BtleChooser {
        address: cli.address,
        timeout: Duration::from_secs(cli.timeout),
    };
    let device = chooser
        .choose(&DeviceConfig::default().service_uuids())
        .await?;
    let bb8 = Bb8::new(device);

    if let Err(e) = bb8.connect().await {
        error!("Failed to connect: {}", e);
        return Err(e.into());
    }

    match cli.command.unwrap_or(Commands::Demo { duration: 2 }) {
        Commands::Demo { duration } => run_demo(&bb8, duration).await?,
        Commands::Red => send(bb8.set_color(255, 0, 0)?).await?,
        Commands::Green => send(bb8.set_color(0, 255, 0)?).await?,
        Commands::Blue => send(bb8.set_color(0, 0, 255)?).await?,
        Commands::White => send(bb8.set_color(255, 255, 255)?).await?,
        Commands::Off => send(bb8.set_color(0, 0, 0)?).await?,
        Commands::Color { red, green, blue } => send(bb8.set_color(red, green, blue)?).await?,
        Commands::Raw {
            device_id,
            command_id,
            payload,
        } => {
            let payload = parse_hex(&payload)?;
            trace!("Raw payload: {:02x?}", payload);
            send(bb8.send_command(device_id, command_id, payload, Some("raw"))?).await?
        }
    }

    bb8.disconnect().await?;
    Ok(())
}

/// Waits for a queued command and reports how it went
async fn send(ticket: CommandTicket) -> Result<()> {
    let outcome = ticket.outcome().await?;
    match &outcome.error {
        None => {
            info!(
                "Command {} done in {}ms",
                outcome.sequence,
                outcome.elapsed().num_milliseconds()
            );
            Ok(())
        }
        Some(e) => {
            warn!("Command {} failed: {}", outcome.sequence, e);
            Err(eyre!("command {} failed: {}", outcome.sequence, e))
        }
    }
}

/// Parse a byte given as decimal or 0x-prefixed hex
fn parse_cli_byte(s: &str) -> std::result::Result<u8, String> {
    parse_byte(s).map_err(|e| e.to_string())
}

/// Sleep for specified number of seconds
#[instrument]
async fn sleep(seconds: u64) {
    trace!("Sleeping for {}s", seconds);
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    trace!("Sleep completed");
}

/// Run a demonstration of the LED colors
#[instrument(skip(bb8))]
async fn run_demo(bb8: &Bb8<BtleDevice>, duration: u64) -> Result<()> {
    info!("Running BB-8 color demo with {}s intervals", duration);

    let steps: [(&str, (u8, u8, u8)); 5] = [
        ("red", (255, 0, 0)),
        ("green", (0, 255, 0)),
        ("blue", (0, 0, 255)),
        ("white", (255, 255, 255)),
        ("off", (0, 0, 0)),
    ];

    for (name, (r, g, b)) in steps {
        info!("Setting color to {}", name);
        send(bb8.set_color(r, g, b)?).await?;
        sleep(duration).await;
    }

    info!("Demo completed!");
    Ok(())
}
