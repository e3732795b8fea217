//! Platform seams: the GATT primitives the handshake and dispatcher run on,
//! and the chooser that hands us a device to talk to.

use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::Result;

/// Asynchronous GATT client operations against one peripheral
///
/// Handles are cheap clones owned by the platform stack. Every call is
/// single-shot.
#[async_trait]
pub trait GattDevice: Send + Sync + 'static {
    /// An open GATT session
    type Session: Clone + fmt::Debug + Send + Sync + 'static;
    /// A resolved primary service
    type Service: Clone + fmt::Debug + Send + Sync + 'static;
    /// A resolved characteristic
    type Characteristic: Clone + fmt::Debug + Send + Sync + 'static;

    /// Opens a GATT session with the peripheral
    async fn connect(&self) -> Result<Self::Session>;

    /// Resolves a primary service on an open session
    async fn primary_service(&self, session: &Self::Session, uuid: Uuid) -> Result<Self::Service>;

    /// Resolves a characteristic on a service
    ///
    /// `Ok(None)` means the peripheral does not expose it; `Err` means the
    /// lookup itself failed.
    async fn characteristic(
        &self,
        service: &Self::Service,
        uuid: Uuid,
    ) -> Result<Option<Self::Characteristic>>;

    /// Writes a value and waits for the acknowledgement
    async fn write_value(&self, characteristic: &Self::Characteristic, value: &[u8]) -> Result<()>;

    /// Closes the session
    async fn disconnect(&self, session: &Self::Session) -> Result<()>;

    /// Whether the peripheral still holds the link for `session`
    ///
    /// The robot drops the link on its own when it sleeps or leaves range.
    async fn is_connected(&self, session: &Self::Session) -> Result<bool>;

    /// UUID of a characteristic handle, used for logging and errors
    fn characteristic_uuid(&self, characteristic: &Self::Characteristic) -> Uuid;
}

/// Picks the peripheral to drive, given the services it must advertise
#[async_trait]
pub trait DeviceChooser {
    type Device: GattDevice;

    async fn choose(&self, services: &[Uuid]) -> Result<Self::Device>;
}
