//! Advertisement data model.
//!
//! An [`Advertisement`] is what the watcher knows about a nearby peripheral
//! before any connection exists. Later [`AdvertisementDelta`]s refine it in
//! place, typically resolving the name a few packets after the first sighting.

use std::collections::HashMap;
use std::fmt;

/// Property key: the peripheral's Bluetooth address.
pub const PROPERTY_DEVICE_ADDRESS: &str = "device_address";
/// Property key: whether the OS reports an active link to the peripheral.
pub const PROPERTY_IS_CONNECTED: &str = "is_connected";
/// Property key: whether the advertisement is connectable.
pub const PROPERTY_IS_CONNECTABLE: &str = "is_connectable";
/// Property key: whether the peripheral is paired with this host.
pub const PROPERTY_IS_PAIRED: &str = "is_paired";
/// Property key: received signal strength in dBm.
pub const PROPERTY_RSSI: &str = "rssi";

/// Properties requested from the watcher on every scan.
pub const REQUESTED_PROPERTIES: &[&str] = &[
    PROPERTY_DEVICE_ADDRESS,
    PROPERTY_IS_CONNECTED,
    PROPERTY_IS_CONNECTABLE,
    PROPERTY_IS_PAIRED,
];

/// Stable identifier of a peripheral, as assigned by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A vendor property value attached to an advertisement.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PropertyValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Free-form text.
    Text(String),
}

impl PropertyValue {
    /// Interpret the value as a flag.
    ///
    /// Text values `"true"`/`"false"` are accepted since some platforms
    /// report flags as strings.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            Self::Text(s) => s.trim().parse::<bool>().ok(),
        }
    }

    /// Interpret the value as an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// An observed peripheral advertisement.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Advertisement {
    /// Peripheral identifier.
    pub id: DeviceId,
    /// Advertised local name, if resolved.
    pub name: Option<String>,
    /// Vendor properties keyed by the `PROPERTY_*` constants.
    pub properties: HashMap<String, PropertyValue>,
}

impl Advertisement {
    /// Create an advertisement with no name and no properties.
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            properties: HashMap::new(),
        }
    }

    /// Set the advertised name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set a property.
    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Set the connectable flag.
    pub fn with_connectable(self, connectable: bool) -> Self {
        self.with_property(PROPERTY_IS_CONNECTABLE, PropertyValue::Bool(connectable))
    }

    /// The name, or `None` while it is missing or empty.
    pub fn resolved_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|n| !n.is_empty())
    }

    /// Whether the connectable property is present and true.
    pub fn is_connectable(&self) -> bool {
        self.properties
            .get(PROPERTY_IS_CONNECTABLE)
            .and_then(PropertyValue::as_bool)
            .unwrap_or(false)
    }

    /// Signal strength in dBm, if reported.
    pub fn rssi(&self) -> Option<i16> {
        self.properties
            .get(PROPERTY_RSSI)
            .and_then(PropertyValue::as_int)
            .and_then(|v| i16::try_from(v).ok())
    }

    /// Merge an update into this advertisement.
    ///
    /// Deltas for a different identifier are ignored.
    pub fn apply(&mut self, delta: &AdvertisementDelta) {
        if delta.id != self.id {
            return;
        }
        if let Some(name) = &delta.name {
            self.name = Some(name.clone());
        }
        for (key, value) in &delta.properties {
            self.properties.insert(key.clone(), value.clone());
        }
    }
}

/// An incremental update for a previously seen advertisement.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisementDelta {
    /// Peripheral identifier.
    pub id: DeviceId,
    /// New name, or `None` when unchanged.
    pub name: Option<String>,
    /// Changed properties.
    pub properties: HashMap<String, PropertyValue>,
}

impl AdvertisementDelta {
    /// Create an empty delta.
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            properties: HashMap::new(),
        }
    }

    /// Set the resolved name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set a changed property.
    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Set the connectable flag.
    pub fn with_connectable(self, connectable: bool) -> Self {
        self.with_property(PROPERTY_IS_CONNECTABLE, PropertyValue::Bool(connectable))
    }
}

impl From<Advertisement> for AdvertisementDelta {
    fn from(advertisement: Advertisement) -> Self {
        Self {
            id: advertisement.id,
            name: advertisement.name,
            properties: advertisement.properties,
        }
    }
}
