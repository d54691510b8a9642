//! BLE communication module.
//!
//! This module provides the Bluetooth Low Energy vocabulary shared by the
//! rest of the crate: identifiers, advertisements, notification channels,
//! session states and the scan controller.

pub mod advertising;
pub mod characteristics;
pub mod connection;
pub mod scanner;
pub mod uuids;

pub use advertising::{Advertisement, AdvertisementDelta, DeviceId, PropertyValue};
pub use characteristics::{Channel, ChannelKind};
pub use connection::SessionState;
pub use scanner::ScanController;
pub use uuids::*;
