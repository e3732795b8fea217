use bb8_controller::*;
use color_eyre::eyre::Result;
use std::{env, io};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays a clean reply channel
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("bb8_controller=warn")),
        )
        .with_writer(io::stderr)
        .compact()
        .init();
    color_eyre::install()?;

    // Optional target id/mac address from command line arguments
    let usage = "Usage: bb8d [id/mac address]";
    let args: Vec<_> = env::args().collect();
    if args.get(1).is_some_and(|a| a == "-h" || a == "--help") {
        eprintln!("{usage}");
        std::process::exit(0);
    }

    let chooser = match args.get(1) {
        Some(addr) => BtleChooser::with_address(addr.as_str()),
        None => BtleChooser::default(),
    };
    let bb8 = Bb8::new(
        chooser
            .choose(&DeviceConfig::default().service_uuids())
            .await?,
    );

    // Report every command outcome, including ones queued before a connect
    let mut events = bb8.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Event::CommandCompleted(outcome)) => match outcome.error {
                    None => println!("DONE {}", outcome.sequence),
                    Some(e) => println!("FAIL {} {}", outcome.sequence, e),
                },
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!("Missed {} events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Inform about successful initialization
    println!("OK");

    // Mainloop: wait for user input, line by line
    let mut input = String::new();
    loop {
        input.clear();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }

        // Read command and execute it
        let mut cmd = input.trim().splitn(2, ':');
        let reply = match cmd.next() {
            Some("connect") => bb8.connect().await.map(|s| format!("OK {}", s.state)),
            Some("disconnect") => bb8.disconnect().await.map(|_| "OK".to_string()),
            Some("status") => {
                let status = bb8.status().await;
                Ok(format!("OK {} started={}", status.state, status.started))
            }
            Some("set_color") => parse_rgb(cmd.next().unwrap_or_default())
                .and_then(|(r, g, b)| bb8.set_color(r, g, b))
                .map(|ticket| format!("QUEUED {}", ticket.sequence())),
            Some("raw") => raw_command(&bb8, cmd.next().unwrap_or_default())
                .map(|ticket| format!("QUEUED {}", ticket.sequence())),
            Some("") | None => Err(Error::InvalidCommandInput("no command given".into())),
            Some(other) => Err(Error::InvalidCommandInput(format!(
                "unknown command: {other}"
            ))),
        };

        match reply {
            Ok(line) => println!("{line}"),
            Err(e) => {
                warn!("{}", e);
                println!("ERR {e}");
            }
        }
    }

    bb8.disconnect().await?;
    Ok(())
}

/// Handles `raw:DID,CID[,HEX]`
///
/// DID and CID are decimal unless `0x`-prefixed, matching `bb8c raw`.
fn raw_command(bb8: &Bb8<BtleDevice>, args: &str) -> bb8_controller::Result<CommandTicket> {
    let parts: Vec<&str> = args.split(',').collect();
    let (did, cid, hex) = match parts[..] {
        [did, cid] => (did, cid, ""),
        [did, cid, hex] => (did, cid, hex),
        _ => {
            return Err(Error::InvalidCommandInput(format!(
                "expected DID,CID,HEX but got {args:?}"
            )))
        }
    };

    bb8.send_command(parse_byte(did)?, parse_byte(cid)?, parse_hex(hex)?, Some("raw"))
}
