//! The resolved connection and the cell that publishes it to the dispatcher.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::gatt::GattDevice;

/// Characteristics written once during power-on
///
/// A peripheral may not expose all of them; absent ones are skipped.
pub struct PowerCharacteristics<G: GattDevice> {
    pub anti_dos: Option<G::Characteristic>,
    pub tx_power: Option<G::Characteristic>,
    pub wake_cpu: Option<G::Characteristic>,
}

/// Every handle needed to operate the robot
///
/// Only the negotiator builds one, and only after all handshake stages
/// succeeded.
pub struct ConnectionContext<G: GattDevice> {
    pub session: G::Session,
    pub radio_service: G::Service,
    pub robot_service: G::Service,
    pub control: G::Characteristic,
    pub power: PowerCharacteristics<G>,
}

impl<G: GattDevice> fmt::Debug for PowerCharacteristics<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerCharacteristics")
            .field("anti_dos", &self.anti_dos)
            .field("tx_power", &self.tx_power)
            .field("wake_cpu", &self.wake_cpu)
            .finish()
    }
}

impl<G: GattDevice> fmt::Debug for ConnectionContext<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("session", &self.session)
            .field("radio_service", &self.radio_service)
            .field("robot_service", &self.robot_service)
            .field("control", &self.control)
            .field("power", &self.power)
            .finish()
    }
}

/// A published context tagged with the version it was published under
pub struct Current<G: GattDevice> {
    pub version: u64,
    pub context: Arc<ConnectionContext<G>>,
}

impl<G: GattDevice> Clone for Current<G> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            context: Arc::clone(&self.context),
        }
    }
}

/// Holds the context the dispatcher should write through, if any
pub struct ContextCell<G: GattDevice> {
    tx: watch::Sender<Option<Current<G>>>,
    versions: AtomicU64,
}

impl<G: GattDevice> Default for ContextCell<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: GattDevice> ContextCell<G> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx,
            versions: AtomicU64::new(0),
        }
    }

    /// Makes `context` current and returns its version
    pub fn publish(&self, context: Arc<ConnectionContext<G>>) -> u64 {
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx.send_replace(Some(Current { version, context }));
        version
    }

    /// Drops the current context, returning it
    pub fn invalidate(&self) -> Option<Current<G>> {
        self.tx.send_replace(None)
    }

    pub fn current(&self) -> Option<Current<G>> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Current<G>>> {
        self.tx.subscribe()
    }
}
