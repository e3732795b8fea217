/*!
 # BB-8 GATT layout and protocol constants

 The UUIDs are fixed by the firmware. Everything else here is a protocol
 constant that the handshake and the dispatcher read from [`DeviceConfig`].
*/

use std::time::Duration;
use uuid::Uuid;

/// Service holding the anti-DOS, tx-power and wake-CPU characteristics
pub const RADIO_SERVICE_UUID: Uuid = Uuid::from_u128(0x22bb746f_2bb0_7554_2d6f_726568705327);
/// Service holding the control characteristic
pub const ROBOT_SERVICE_UUID: Uuid = Uuid::from_u128(0x22bb746f_2ba0_7554_2d6f_726568705327);

/// Characteristic receiving every command frame
pub const CONTROL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x22bb746f_2ba1_7554_2d6f_726568705327);
pub const ANTI_DOS_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x22bb746f_2bbd_7554_2d6f_726568705327);
pub const TX_POWER_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x22bb746f_2bb2_7554_2d6f_726568705327);
pub const WAKE_CPU_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x22bb746f_2bbf_7554_2d6f_726568705327);

/// Unlock string written to the anti-DOS characteristic
pub const ANTI_DOS_UNLOCK: &[u8] = b"011i3";

/// Configuration for a BB-8 connection
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// UUID of the first primary service opened during the handshake
    pub radio_service_uuid: Uuid,
    /// UUID of the second primary service opened during the handshake
    pub robot_service_uuid: Uuid,
    /// UUID for the command write characteristic
    pub control_uuid: Uuid,
    /// UUID for the anti-DOS unlock characteristic
    pub anti_dos_uuid: Uuid,
    /// UUID for the tx-power characteristic
    pub tx_power_uuid: Uuid,
    /// UUID for the wake-CPU characteristic
    pub wake_cpu_uuid: Uuid,
    /// Bytes that disable the peripheral's denial-of-service protection
    pub anti_dos_unlock: &'static [u8],
    /// Radio transmit power level
    pub tx_power_level: u8,
    /// Value that wakes the robot CPU
    pub wake_cpu_value: u8,
    /// Minimum spacing between two control writes
    pub write_interval: Duration,
    /// How long the device chooser waits for a matching peripheral
    pub discovery_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            radio_service_uuid: RADIO_SERVICE_UUID,
            robot_service_uuid: ROBOT_SERVICE_UUID,
            control_uuid: CONTROL_CHARACTERISTIC_UUID,
            anti_dos_uuid: ANTI_DOS_CHARACTERISTIC_UUID,
            tx_power_uuid: TX_POWER_CHARACTERISTIC_UUID,
            wake_cpu_uuid: WAKE_CPU_CHARACTERISTIC_UUID,
            anti_dos_unlock: ANTI_DOS_UNLOCK,
            tx_power_level: 0x07,
            wake_cpu_value: 0x01,
            write_interval: Duration::from_millis(20),
            discovery_timeout: Duration::from_secs(10),
        }
    }
}

impl DeviceConfig {
    /// Service UUIDs handed to the device chooser, in handshake order
    pub fn service_uuids(&self) -> [Uuid; 2] {
        [self.radio_service_uuid, self.robot_service_uuid]
    }
}
