use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use zbus::zvariant::{ObjectPath, OwnedValue, Value};

use crate::error::{DecodeError, EntityKind};

/// A flat property-name to loosely-typed value mapping, as delivered by
/// the bus. Values are flattened into plain Rust types here and nowhere
/// else; no code downstream of this module touches a wire value.
pub type PropMap = HashMap<String, OwnedValue>;

/// A local Bluetooth controller exposed by the management service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adapter {
    /// The object path of the adapter. Identity within the store.
    pub path: String,
    pub name: String,
    pub alias: String,
    pub address: String,
    pub powered: bool,
    pub discoverable: bool,
    pub pairable: bool,
    pub discovering: bool,
}

/// A remote Bluetooth peer known to an adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// The object path of the device. Identity within the store.
    pub path: String,
    pub name: String,
    pub alias: String,
    pub address: String,
    pub address_type: String,
    /// Object path of the owning adapter, flattened to a plain string.
    pub adapter: String,
    pub kind: DeviceKind,
    pub class: u32,
    pub rssi: i16,
    pub uuids: Vec<String>,
    /// Battery percentage. 0 when unknown or absent.
    pub battery: u8,
    pub paired: bool,
    pub bonded: bool,
    pub connected: bool,
    pub trusted: bool,
    pub blocked: bool,
    pub legacy_pairing: bool,
}

impl Device {
    /// Whether the device should be listed before plain devices.
    pub fn is_flagged(&self) -> bool {
        self.paired || self.trusted || self.blocked
    }
}

/// Human-readable device category, decoded from the class word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Computer,
    Phone,
    Modem,
    Network,
    Headset,
    Speakers,
    Headphones,
    Video,
    Audio,
    GamingInput,
    RemoteControl,
    Keyboard,
    Tablet,
    Mouse,
    Printer,
    Scanner,
    Camera,
    Monitor,
    Wearable,
    Toy,
    #[default]
    Unknown,
}

impl DeviceKind {
    /// Decodes the major/minor class fields of the class word.
    pub fn from_class(class: u32) -> Self {
        match (class & 0x1f00) >> 8 {
            0x01 => DeviceKind::Computer,
            0x02 => match (class & 0xfc) >> 2 {
                0x01 | 0x02 | 0x03 | 0x05 => DeviceKind::Phone,
                0x04 => DeviceKind::Modem,
                _ => DeviceKind::Unknown,
            },
            0x03 => DeviceKind::Network,
            0x04 => match (class & 0xfc) >> 2 {
                0x01 | 0x02 => DeviceKind::Headset,
                0x05 => DeviceKind::Speakers,
                0x06 => DeviceKind::Headphones,
                0x0b | 0x0c | 0x0d => DeviceKind::Video,
                _ => DeviceKind::Audio,
            },
            0x05 => match (class & 0xc0) >> 6 {
                0x00 => match (class & 0x1e) >> 2 {
                    0x01 | 0x02 => DeviceKind::GamingInput,
                    0x03 => DeviceKind::RemoteControl,
                    _ => DeviceKind::Unknown,
                },
                0x01 => DeviceKind::Keyboard,
                0x02 => match (class & 0x1e) >> 2 {
                    0x05 => DeviceKind::Tablet,
                    _ => DeviceKind::Mouse,
                },
                _ => DeviceKind::Unknown,
            },
            0x06 if class & 0x80 > 0 => DeviceKind::Printer,
            0x06 if class & 0x40 > 0 => DeviceKind::Scanner,
            0x06 if class & 0x20 > 0 => DeviceKind::Camera,
            0x06 if class & 0x10 > 0 => DeviceKind::Monitor,
            0x07 => DeviceKind::Wearable,
            0x08 => DeviceKind::Toy,
            _ => DeviceKind::Unknown,
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceKind::Computer => "Computer",
            DeviceKind::Phone => "Phone",
            DeviceKind::Modem => "Modem",
            DeviceKind::Network => "Network",
            DeviceKind::Headset => "Headset",
            DeviceKind::Speakers => "Speakers",
            DeviceKind::Headphones => "Headphones",
            DeviceKind::Video => "Video",
            DeviceKind::Audio => "Audio device",
            DeviceKind::GamingInput => "Gaming input",
            DeviceKind::RemoteControl => "Remote control",
            DeviceKind::Keyboard => "Keyboard",
            DeviceKind::Tablet => "Tablet",
            DeviceKind::Mouse => "Mouse",
            DeviceKind::Printer => "Printer",
            DeviceKind::Scanner => "Scanner",
            DeviceKind::Camera => "Camera",
            DeviceKind::Monitor => "Monitor",
            DeviceKind::Wearable => "Wearable",
            DeviceKind::Toy => "Toy",
            DeviceKind::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Transient playback state of a connected media endpoint. Read
/// through on demand, never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaState {
    pub status: String,
    pub position: u32,
    pub track: TrackInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackInfo {
    pub title: String,
    pub album: String,
    pub artist: String,
    pub duration: u32,
    pub track_number: u32,
    pub total_tracks: u32,
}

impl Adapter {
    /// Decodes an adapter record from its property map.
    ///
    /// # Errors
    /// - [`DecodeError`] if the address is absent or unusable.
    pub fn decode(path: &str, props: &PropMap) -> Result<Self, DecodeError> {
        let address = prop_str(props, "Address")
            .ok_or_else(|| DecodeError::new(EntityKind::Adapter, path, "Address"))?;

        let mut adapter = Adapter {
            path: path.to_owned(),
            address,
            ..Adapter::default()
        };
        adapter.merge(props);

        Ok(adapter)
    }

    /// Applies only the fields present in `props`, leaving the rest
    /// untouched.
    pub fn merge(&mut self, props: &PropMap) {
        merge_str(&mut self.name, props, "Name");
        merge_str(&mut self.alias, props, "Alias");
        merge_str(&mut self.address, props, "Address");
        merge_bool(&mut self.powered, props, "Powered");
        merge_bool(&mut self.discoverable, props, "Discoverable");
        merge_bool(&mut self.pairable, props, "Pairable");
        merge_bool(&mut self.discovering, props, "Discovering");
    }
}

impl Device {
    /// Decodes a device record from its property map.
    ///
    /// # Errors
    /// - [`DecodeError`] if the address is absent or unusable.
    pub fn decode(path: &str, props: &PropMap) -> Result<Self, DecodeError> {
        let address = prop_str(props, "Address")
            .ok_or_else(|| DecodeError::new(EntityKind::Device, path, "Address"))?;

        let mut device = Device {
            path: path.to_owned(),
            address,
            ..Device::default()
        };
        device.merge(props);

        Ok(device)
    }

    /// Applies only the fields present in `props`, leaving the rest
    /// untouched.
    pub fn merge(&mut self, props: &PropMap) {
        merge_str(&mut self.name, props, "Name");
        merge_str(&mut self.alias, props, "Alias");
        merge_str(&mut self.address, props, "Address");
        merge_str(&mut self.address_type, props, "AddressType");
        merge_bool(&mut self.paired, props, "Paired");
        merge_bool(&mut self.bonded, props, "Bonded");
        merge_bool(&mut self.connected, props, "Connected");
        merge_bool(&mut self.trusted, props, "Trusted");
        merge_bool(&mut self.blocked, props, "Blocked");
        merge_bool(&mut self.legacy_pairing, props, "LegacyPairing");

        if let Some(adapter) = prop_path(props, "Adapter") {
            self.adapter = adapter;
        }
        if let Some(rssi) = prop_i16(props, "RSSI") {
            self.rssi = rssi;
        }
        if let Some(class) = prop_u32(props, "Class") {
            self.class = class;
            self.kind = DeviceKind::from_class(class);
        }
        if let Some(uuids) = prop_str_array(props, "UUIDs") {
            self.uuids = uuids;
        }
    }

    /// Applies a co-located battery interface reading to the device.
    pub fn merge_battery(&mut self, props: &PropMap) {
        if let Some(percentage) = prop_u8(props, "Percentage") {
            self.battery = percentage;
        }
    }
}

impl MediaState {
    /// Decodes the playback state from a player property map. All
    /// fields are optional; absent ones default.
    pub fn decode(props: &PropMap) -> Self {
        MediaState {
            status: prop_str(props, "Status").unwrap_or_default(),
            position: prop_u32(props, "Position").unwrap_or_default(),
            track: props
                .get("Track")
                .and_then(TrackInfo::from_value)
                .unwrap_or_default(),
        }
    }
}

impl TrackInfo {
    fn from_value(value: &OwnedValue) -> Option<Self> {
        let Value::Dict(dict) = &**value else {
            return None;
        };

        let mut track = TrackInfo::default();
        for (key, value) in dict.iter() {
            let Ok(key) = key.downcast_ref::<&str>() else {
                continue;
            };

            match key {
                "Title" => track.title = string_value(value).unwrap_or_default(),
                "Album" => track.album = string_value(value).unwrap_or_default(),
                "Artist" => track.artist = string_value(value).unwrap_or_default(),
                "Duration" => track.duration = u32::try_from(value).unwrap_or_default(),
                "TrackNumber" => track.track_number = u32::try_from(value).unwrap_or_default(),
                "NumberOfTracks" => track.total_tracks = u32::try_from(value).unwrap_or_default(),
                _ => {}
            }
        }

        Some(track)
    }
}

fn string_value(value: &Value<'_>) -> Option<String> {
    value.downcast_ref::<&str>().ok().map(str::to_owned)
}

pub(crate) fn prop_str(props: &PropMap, key: &str) -> Option<String> {
    props
        .get(key)
        .and_then(|v| v.downcast_ref::<&str>().ok())
        .map(str::to_owned)
}

pub(crate) fn prop_bool(props: &PropMap, key: &str) -> Option<bool> {
    props.get(key).and_then(|v| bool::try_from(&**v).ok())
}

pub(crate) fn prop_u8(props: &PropMap, key: &str) -> Option<u8> {
    props.get(key).and_then(|v| u8::try_from(&**v).ok())
}

pub(crate) fn prop_i16(props: &PropMap, key: &str) -> Option<i16> {
    props.get(key).and_then(|v| i16::try_from(&**v).ok())
}

pub(crate) fn prop_u32(props: &PropMap, key: &str) -> Option<u32> {
    props.get(key).and_then(|v| u32::try_from(&**v).ok())
}

pub(crate) fn prop_u64(props: &PropMap, key: &str) -> Option<u64> {
    props.get(key).and_then(|v| u64::try_from(&**v).ok())
}

/// Flattens an object-path value into a plain string.
pub(crate) fn prop_path(props: &PropMap, key: &str) -> Option<String> {
    props
        .get(key)
        .and_then(|v| v.downcast_ref::<ObjectPath<'_>>().ok())
        .map(|p| p.to_string())
}

pub(crate) fn prop_str_array(props: &PropMap, key: &str) -> Option<Vec<String>> {
    let value = props.get(key)?;
    let Value::Array(array) = &**value else {
        return None;
    };

    Some(
        array
            .iter()
            .filter_map(|v| v.downcast_ref::<&str>().ok().map(str::to_owned))
            .collect(),
    )
}

fn merge_str(field: &mut String, props: &PropMap, key: &str) {
    if let Some(value) = prop_str(props, key) {
        *field = value;
    }
}

fn merge_bool(field: &mut bool, props: &PropMap, key: &str) {
    if let Some(value) = prop_bool(props, key) {
        *field = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(v: impl Into<Value<'static>>) -> OwnedValue {
        Value::try_to_owned(&v.into()).expect("owned value")
    }

    fn device_props(address: &str) -> PropMap {
        let mut props = PropMap::new();
        props.insert("Address".into(), value(address.to_owned()));
        props.insert("Name".into(), value("Keyboard K380"));
        props.insert("Paired".into(), value(true));
        props.insert("Class".into(), value(0x0005c0u32));
        props
    }

    #[test]
    fn decode_device_requires_address() {
        let mut props = device_props("AA:BB:CC:DD:EE:FF");
        props.remove("Address");

        let err = Device::decode("/org/bluez/hci0/dev_X", &props).unwrap_err();
        assert_eq!(err.kind, EntityKind::Device);
        assert_eq!(err.field, "Address");
    }

    #[test]
    fn decode_device_populates_known_fields() {
        let device = Device::decode("/org/bluez/hci0/dev_X", &device_props("AA:BB:CC:DD:EE:FF"))
            .expect("decode");

        assert_eq!(device.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(device.name, "Keyboard K380");
        assert!(device.paired);
        assert_eq!(device.kind, DeviceKind::Keyboard);
        assert_eq!(device.battery, 0);
    }

    #[test]
    fn merge_applies_only_changed_fields() {
        let mut device = Device::decode("/org/bluez/hci0/dev_X", &device_props("AA:BB:CC:DD:EE:FF"))
            .expect("decode");

        let mut changed = PropMap::new();
        changed.insert("Connected".into(), value(true));
        changed.insert("RSSI".into(), value(-42i16));
        device.merge(&changed);

        assert!(device.connected);
        assert_eq!(device.rssi, -42);
        assert_eq!(device.name, "Keyboard K380");
        assert!(device.paired);
    }

    #[test]
    fn adapter_reference_is_flattened() {
        let mut props = device_props("AA:BB:CC:DD:EE:FF");
        props.insert(
            "Adapter".into(),
            value(ObjectPath::try_from("/org/bluez/hci0").expect("path")),
        );

        let device = Device::decode("/org/bluez/hci0/dev_X", &props).expect("decode");
        assert_eq!(device.adapter, "/org/bluez/hci0");
    }

    #[test]
    fn class_decoding_matches_major_minor_fields() {
        assert_eq!(DeviceKind::from_class(0x000104), DeviceKind::Computer);
        assert_eq!(DeviceKind::from_class(0x000204), DeviceKind::Phone);
        assert_eq!(DeviceKind::from_class(0x240404), DeviceKind::Headset);
        assert_eq!(DeviceKind::from_class(0x240418), DeviceKind::Headphones);
        assert_eq!(DeviceKind::from_class(0x0005c0), DeviceKind::Keyboard);
        assert_eq!(DeviceKind::from_class(0x000000), DeviceKind::Unknown);
    }
}
