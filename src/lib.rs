/*!
 # BB-8 Bluetooth LE Controller Library

 A Rust library for driving a Sphero BB-8 over Bluetooth Low Energy.
 It performs the GATT handshake the toy expects, wakes it up, and then
 streams checksummed command frames to its control characteristic one
 write at a time.

 ## Features

 * Ordered GATT handshake (radio service, robot service, control characteristic)
 * Anti-DOS unlock, tx-power and CPU wake-up sequence
 * RGB LED control
 * Generic command frames with sequence numbers and checksums
 * Command outcomes and connection state as subscribable events

 ## Example

 ```no_run
 use bb8_controller::*;

 #[tokio::main]
 async fn main() -> Result<()> {
     // Initialize tracing for logs
     tracing_subscriber::fmt::init();

     // Pick a BB-8 and wrap it in the facade
     let device = BtleChooser::default().choose(&DeviceConfig::default().service_uuids()).await?;
     let bb8 = Bb8::new(device);

     // Commands may be queued before the connection is ready
     let ticket = bb8.set_color(255, 0, 0)?; // Red
     bb8.connect().await?;

     let outcome = ticket.outcome().await?;
     println!("sequence {} took {:?}", outcome.sequence, outcome.elapsed());
     Ok(())
 }
 ```
*/

use thiserror::Error;
use uuid::Uuid;

/// Custom error types for the BB-8 controller library
#[derive(Error, Debug)]
pub enum Error {
    /// No Bluetooth adapters found
    #[error("No Bluetooth adapters found")]
    NoBluetoothAdapters,

    /// The device chooser returned without a device
    #[error("No BB-8 was selected: {0}")]
    DeviceChooserCancelled(String),

    /// Opening the GATT session failed
    #[error("GATT connect failed: {0}")]
    GattConnectFailed(String),

    /// A primary service could not be resolved
    #[error("Could not resolve service {uuid}: {reason}")]
    ServiceResolutionFailed { uuid: Uuid, reason: String },

    /// A characteristic could not be resolved
    #[error("Could not resolve characteristic {uuid}: {reason}")]
    CharacteristicResolutionFailed { uuid: Uuid, reason: String },

    /// A characteristic write was not acknowledged
    #[error("Write to {uuid} failed: {reason}")]
    WriteFailed { uuid: Uuid, reason: String },

    /// Command input outside of its valid range
    #[error("Invalid command input: {0}")]
    InvalidCommandInput(String),

    /// The command dispatcher has shut down
    #[error("Command dispatcher is no longer running")]
    DispatcherClosed,

    /// BLE communication error
    #[error("BLE communication error: {0}")]
    BleError(String),

    /// Error from btleplug
    #[error(transparent)]
    BtlePlugError(#[from] btleplug::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod btle;
pub mod config;
pub mod context;
pub mod device;
pub mod dispatcher;
pub mod events;
pub mod frame;
pub mod gatt;
pub mod negotiator;

// Re-export key types
pub use btle::{BtleChooser, BtleDevice};
pub use config::DeviceConfig;
pub use context::{ConnectionContext, PowerCharacteristics};
pub use device::{parse_byte, parse_hex, parse_rgb, Bb8, LinkStatus};
pub use dispatcher::{CommandTicket, Dispatcher};
pub use events::{CommandOutcome, Event};
pub use frame::{Command, SequencedFrame};
pub use gatt::{DeviceChooser, GattDevice};
pub use negotiator::{NegotiationState, Negotiator};
