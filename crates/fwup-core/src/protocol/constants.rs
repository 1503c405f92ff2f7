//! Protocol constants for the firmware update GATT service.
//!
//! Values match the update service exposed by the device firmware.

use uuid::Uuid;

// ============================================================================
// Service & Characteristic Identities
// ============================================================================

/// Firmware update primary service.
pub const FWUPDATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x38f28386_3070_4f3b_ba38_27507e991760);

/// Control characteristic: write a chunk, read back the device offset.
pub const FWUPDATE_CONTROL_UUID: Uuid = Uuid::from_u128(0x38f28386_3070_4f3b_ba38_27507e991762);

/// Version characteristic: read the running firmware version.
pub const FWUPDATE_VERSION_UUID: Uuid = Uuid::from_u128(0x38f28386_3070_4f3b_ba38_27507e991764);

/// Boot notification characteristic.
pub const FWUPDATE_BOOT_NOTIFY_UUID: Uuid =
    Uuid::from_u128(0x38f28386_3070_4f3b_ba38_27507e991766);

/// GATT characteristic interface name, as reported by BlueZ.
pub const GATT_CHRC_IFACE: &str = "org.bluez.GattCharacteristic1";

/// Property key carrying the new characteristic value.
pub const VALUE_PROPERTY: &str = "Value";

// ============================================================================
// Size Constants
// ============================================================================

/// Firmware bytes carried by one chunk.
pub const CHUNK_SIZE: usize = 128;

/// Little-endian offset prefix on every chunk.
pub const CHUNK_HEADER_SIZE: usize = 4;

/// Largest write the device accepts on the control characteristic.
pub const MAX_PACKET_SIZE: usize = CHUNK_HEADER_SIZE + CHUNK_SIZE;

/// Size of an encoded offset or version value.
pub const U32_VALUE_SIZE: usize = 4;

// ============================================================================
// Defaults
// ============================================================================

/// Advertised name of the update target.
pub const DEFAULT_TARGET_NAME: &str = "nRF52_UPDATE";

/// Local HCI adapter.
pub const DEFAULT_ADAPTER: &str = "hci1";

/// Per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;
