//! [`GattDevice`] and [`DeviceChooser`] backed by btleplug.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::time;
use tracing::{debug, error, info, instrument, trace};
use uuid::Uuid;

use crate::config::DeviceConfig;
use crate::gatt::{DeviceChooser, GattDevice};
use crate::{Error, Result};

/// Advertised name prefix of BB-8 units
const NAME_PREFIX: &str = "BB-";

/// Gets the default Bluetooth adapter
#[instrument(skip(manager))]
async fn get_central(manager: &Manager) -> Result<Adapter> {
    debug!("Getting default Bluetooth adapter");
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| {
            error!("No Bluetooth adapters found");
            Error::NoBluetoothAdapters
        })?;

    debug!("Using Bluetooth adapter");
    Ok(adapter)
}

/// A BB-8 peripheral reachable through the local adapter
#[derive(Debug, Clone)]
pub struct BtleDevice {
    peripheral: Peripheral,
    /// Kept alive for as long as the peripheral is in use
    _central: Adapter,
}

impl BtleDevice {
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }
}

#[async_trait]
impl GattDevice for BtleDevice {
    type Session = Peripheral;
    type Service = Service;
    type Characteristic = Characteristic;

    #[instrument(skip(self))]
    async fn connect(&self) -> Result<Peripheral> {
        info!("Connecting to device...");
        if !self.peripheral.is_connected().await? {
            self.peripheral.connect().await?;
        }

        debug!("Discovering services...");
        self.peripheral.discover_services().await?;
        Ok(self.peripheral.clone())
    }

    async fn primary_service(&self, session: &Peripheral, uuid: Uuid) -> Result<Service> {
        session
            .services()
            .into_iter()
            .find(|s| s.primary && s.uuid == uuid)
            .ok_or_else(|| Error::BleError(format!("primary service {uuid} not found")))
    }

    async fn characteristic(&self, service: &Service, uuid: Uuid) -> Result<Option<Characteristic>> {
        let characteristic = service
            .characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned();

        if let Some(ref c) = characteristic {
            debug!("Found characteristic: {} ({:?})", c.uuid, c.properties);
        }
        Ok(characteristic)
    }

    async fn write_value(&self, characteristic: &Characteristic, value: &[u8]) -> Result<()> {
        // Prefer WriteWithResponse when supported
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        trace!("Writing {} bytes to {}", value.len(), characteristic.uuid);
        self.peripheral
            .write(characteristic, value, write_type)
            .await
            .map_err(|e| Error::WriteFailed {
                uuid: characteristic.uuid,
                reason: e.to_string(),
            })
    }

    #[instrument(skip(self))]
    async fn disconnect(&self, session: &Peripheral) -> Result<()> {
        if session.is_connected().await? {
            session.disconnect().await?;
        }
        info!("Disconnected");
        Ok(())
    }

    async fn is_connected(&self, session: &Peripheral) -> Result<bool> {
        Ok(session.is_connected().await?)
    }

    fn characteristic_uuid(&self, characteristic: &Characteristic) -> Uuid {
        characteristic.uuid
    }
}

/// Finds a BB-8 among the peripherals the adapter can see
///
/// A peripheral matches when it advertises one of the requested services or a
/// `BB-` name. With an address set, only that peripheral matches.
#[derive(Debug, Clone)]
pub struct BtleChooser {
    /// MAC address or platform id of the wanted peripheral
    pub address: Option<String>,
    /// How long to wait for a match before giving up
    pub timeout: Duration,
}

impl Default for BtleChooser {
    fn default() -> Self {
        Self {
            address: None,
            timeout: DeviceConfig::default().discovery_timeout,
        }
    }
}

impl BtleChooser {
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    async fn matches(&self, peripheral: &Peripheral, services: &[Uuid]) -> bool {
        let Ok(Some(props)) = peripheral.properties().await else {
            return false;
        };

        if let Some(addr) = &self.address {
            let addr = addr.to_lowercase();
            return peripheral.address().to_string().to_lowercase() == addr
                || peripheral.id().to_string().to_lowercase() == addr;
        }

        let name = props.local_name.unwrap_or_default();
        debug!("Found device: {} {:?}", name, props.services);
        props.services.iter().any(|s| services.contains(s)) || name.starts_with(NAME_PREFIX)
    }
}

#[async_trait]
impl DeviceChooser for BtleChooser {
    type Device = BtleDevice;

    #[instrument(skip(self))]
    async fn choose(&self, services: &[Uuid]) -> Result<BtleDevice> {
        info!("Initializing BLE controller");
        let manager = Manager::new().await?;
        let central = get_central(&manager).await?;

        // An address may belong to a peripheral that does not advertise the services
        let filter = match self.address {
            Some(_) => ScanFilter::default(),
            None => ScanFilter {
                services: services.to_vec(),
            },
        };
        info!("Looking for a BB-8...");
        central.start_scan(filter).await?;

        let start_time = time::Instant::now();
        let mut found = None;

        // Poll for devices until we find a compatible one or timeout
        while found.is_none() && start_time.elapsed() < self.timeout {
            let peripherals = central.peripherals().await?;
            debug!("Found {} BLE peripherals so far", peripherals.len());

            for p in peripherals {
                if self.matches(&p, services).await {
                    info!("Found BB-8: {}", p.id());
                    found = Some(p);
                    break;
                }
            }

            if found.is_none() {
                let remaining = self.timeout.saturating_sub(start_time.elapsed());
                info!(
                    "Still looking for a BB-8... ({} seconds remaining)",
                    remaining.as_secs()
                );
                time::sleep(Duration::from_millis(500)).await;
            }
        }

        central.stop_scan().await?;

        match found {
            Some(peripheral) => Ok(BtleDevice {
                peripheral,
                _central: central,
            }),
            None => {
                error!(
                    "No BB-8 found within {} seconds",
                    self.timeout.as_secs()
                );
                Err(Error::DeviceChooserCancelled(format!(
                    "nothing matched within {}s",
                    self.timeout.as_secs()
                )))
            }
        }
    }
}
