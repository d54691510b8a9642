//! BLE Service and Characteristic UUIDs.
//!
//! Contains all UUID constants used for LOGITOW communication.

use uuid::Uuid;

// Block data service (LOGITOW custom, Nordic UART layout)
/// Block-state data service UUID.
pub const DATA_SERVICE_UUID: Uuid = Uuid::from_u128(0x6940_0001_b5a3_f393_e0a9_e50e24dcca99);
/// Block-state read characteristic UUID (Notify).
pub const DATA_READ_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6940_0003_b5a3_f393_e0a9_e50e24dcca99);

// Module driver service (battery)
/// Module driver service UUID, which carries battery status.
pub const MODULE_DRIVER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x7f51_0004_b5a3_f393_e0a9_e50e24dcca9e);
/// Module driver read/write characteristic UUID (Write, Notify).
///
/// Battery requests are written here and battery notifications arrive here.
pub const MODULE_DRIVER_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x7f51_0005_b5a3_f393_e0a9_e50e24dcca9e);

/// Advertised local name of every LOGITOW brick.
pub const LOGITOW_DEVICE_NAME: &str = "LOGITOW";
