use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;
use zbus::{
    Connection,
    fdo::PropertiesProxy,
    names::InterfaceName,
    zvariant::{ObjectPath, OwnedValue, Value},
};

use crate::error::{Error, Result};

const NM_SERVICE: &str = "org.freedesktop.NetworkManager";
const NM_PATH: &str = "/org/freedesktop/NetworkManager";
const NM_INTERFACE: &str = "org.freedesktop.NetworkManager";

const SETTINGS_PATH: &str = "/org/freedesktop/NetworkManager/Settings";
const SETTINGS_INTERFACE: &str = "org.freedesktop.NetworkManager.Settings";
const SETTINGS_CONNECTION_INTERFACE: &str = "org.freedesktop.NetworkManager.Settings.Connection";

const NM_DEVICE_INTERFACE: &str = "org.freedesktop.NetworkManager.Device";
const NM_BLUETOOTH_INTERFACE: &str = "org.freedesktop.NetworkManager.Device.Bluetooth";
const NM_ACTIVE_INTERFACE: &str = "org.freedesktop.NetworkManager.Connection.Active";

const NM_DEVICE_TYPE_BLUETOOTH: u32 = 5;

/// The tethering profile kind of a Bluetooth network connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TetherKind {
    /// Personal area networking.
    Panu,
    /// Dial-up networking.
    Dun,
}

impl TetherKind {
    fn as_str(self) -> &'static str {
        match self {
            TetherKind::Panu => "panu",
            TetherKind::Dun => "dun",
        }
    }
}

/// Activates and deactivates Bluetooth tethering through the network
/// management service. Existing connection profiles are reused; a new
/// profile is created only when none matches the device.
pub struct NetworkClient {
    conn: Connection,
    /// Active connection path per device address. Guarded separately
    /// from every other lock in the crate.
    active: Mutex<HashMap<String, String>>,
}

impl NetworkClient {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Connects to the device's network interface.
    ///
    /// # Errors
    /// - [`Error::NetworkActive`] if a tethering connection for the
    ///   device is already active.
    /// - [`Error::NoNetworkDevice`] if the network service knows no
    ///   device with that address.
    pub async fn connect(&self, name: &str, kind: TetherKind, bdaddr: &str) -> Result<()> {
        if self.find_active_connection(bdaddr).await?.is_some() {
            return Err(Error::NetworkActive(bdaddr.to_owned()));
        }

        let device = self
            .device_for(bdaddr)
            .await?
            .ok_or_else(|| Error::NoNetworkDevice(bdaddr.to_owned()))?;

        let active_path = match self.existing_profile(kind, bdaddr).await? {
            Some(profile) => self.activate(&profile, &device).await?,
            None => self.add_and_activate(name, kind, bdaddr, &device).await?,
        };

        info!(%bdaddr, ?kind, "Activated tethering connection");
        self.active
            .lock()
            .insert(bdaddr.to_uppercase(), active_path);

        Ok(())
    }

    /// Deactivates the device's tethering connection.
    pub async fn disconnect(&self, bdaddr: &str) -> Result<()> {
        let known = self.active.lock().remove(&bdaddr.to_uppercase());
        let path = match known {
            Some(path) => Some(path),
            None => self.find_active_connection(bdaddr).await?,
        };

        let Some(path) = path else {
            debug!(%bdaddr, "No active tethering connection to deactivate");
            return Ok(());
        };

        self.conn
            .call_method(
                Some(NM_SERVICE),
                NM_PATH,
                Some(NM_INTERFACE),
                "DeactivateConnection",
                &(ObjectPath::try_from(path.as_str())?,),
            )
            .await?;

        info!(%bdaddr, "Deactivated tethering connection");
        Ok(())
    }

    /// Finds the network device backing the Bluetooth peer.
    async fn device_for(&self, bdaddr: &str) -> Result<Option<String>> {
        let devices = self.object_paths(NM_PATH, NM_INTERFACE, "Devices").await?;

        for device in devices {
            let device_type = self
                .get_property(&device, NM_DEVICE_INTERFACE, "DeviceType")
                .await?;
            if u32::try_from(&*device_type).ok() != Some(NM_DEVICE_TYPE_BLUETOOTH) {
                continue;
            }

            let address = self
                .get_property(&device, NM_BLUETOOTH_INTERFACE, "HwAddress")
                .await?;
            let matches = address
                .downcast_ref::<&str>()
                .map(|a| a.eq_ignore_ascii_case(bdaddr))
                .unwrap_or(false);
            if matches {
                return Ok(Some(device));
            }
        }

        Ok(None)
    }

    /// Finds an active bluetooth-type connection for the address.
    async fn find_active_connection(&self, bdaddr: &str) -> Result<Option<String>> {
        let active = self
            .object_paths(NM_PATH, NM_INTERFACE, "ActiveConnections")
            .await?;

        for path in active {
            let kind = self
                .get_property(&path, NM_ACTIVE_INTERFACE, "Type")
                .await?;
            if kind.downcast_ref::<&str>().ok() != Some("bluetooth") {
                continue;
            }

            let profile = self
                .get_property(&path, NM_ACTIVE_INTERFACE, "Connection")
                .await?;
            let Ok(profile) = profile.downcast_ref::<ObjectPath<'_>>() else {
                continue;
            };

            if self.profile_matches(profile.as_str(), None, bdaddr).await? {
                return Ok(Some(path));
            }
        }

        Ok(None)
    }

    /// Looks for a stored profile for this device and tether kind.
    async fn existing_profile(&self, kind: TetherKind, bdaddr: &str) -> Result<Option<String>> {
        let profiles = self
            .object_paths(SETTINGS_PATH, SETTINGS_INTERFACE, "Connections")
            .await?;

        for profile in profiles {
            if self.profile_matches(&profile, Some(kind), bdaddr).await? {
                return Ok(Some(profile));
            }
        }

        Ok(None)
    }

    async fn profile_matches(
        &self,
        profile_path: &str,
        kind: Option<TetherKind>,
        bdaddr: &str,
    ) -> Result<bool> {
        let reply = self
            .conn
            .call_method(
                Some(NM_SERVICE),
                profile_path,
                Some(SETTINGS_CONNECTION_INTERFACE),
                "GetSettings",
                &(),
            )
            .await?;
        let settings: HashMap<String, HashMap<String, OwnedValue>> = reply.body().deserialize()?;

        let Some(bluetooth) = settings.get("bluetooth") else {
            return Ok(false);
        };

        if let Some(kind) = kind {
            let tether = bluetooth
                .get("type")
                .and_then(|v| v.downcast_ref::<&str>().ok());
            if tether != Some(kind.as_str()) {
                return Ok(false);
            }
        }

        let stored = bluetooth.get("bdaddr").map(|v| bdaddr_bytes_of(v));
        Ok(stored == Some(parse_bdaddr(bdaddr)))
    }

    async fn activate(&self, profile_path: &str, device_path: &str) -> Result<String> {
        let reply = self
            .conn
            .call_method(
                Some(NM_SERVICE),
                NM_PATH,
                Some(NM_INTERFACE),
                "ActivateConnection",
                &(
                    ObjectPath::try_from(profile_path)?,
                    ObjectPath::try_from(device_path)?,
                    ObjectPath::try_from("/")?,
                ),
            )
            .await?;

        let path: zbus::zvariant::OwnedObjectPath = reply.body().deserialize()?;
        Ok(path.to_string())
    }

    async fn add_and_activate(
        &self,
        name: &str,
        kind: TetherKind,
        bdaddr: &str,
        device_path: &str,
    ) -> Result<String> {
        let id = format!("{} ({})", name, kind.as_str());
        let uuid = Uuid::new_v4().to_string();

        let mut connection = HashMap::new();
        connection.insert("id", Value::from(id.as_str()));
        connection.insert("type", Value::from("bluetooth"));
        connection.insert("uuid", Value::from(uuid.as_str()));

        let mut bluetooth = HashMap::new();
        bluetooth.insert("bdaddr", Value::from(parse_bdaddr(bdaddr)));
        bluetooth.insert("type", Value::from(kind.as_str()));

        let mut settings = HashMap::new();
        settings.insert("connection", connection);
        settings.insert("bluetooth", bluetooth);

        let reply = self
            .conn
            .call_method(
                Some(NM_SERVICE),
                NM_PATH,
                Some(NM_INTERFACE),
                "AddAndActivateConnection",
                &(
                    settings,
                    ObjectPath::try_from(device_path)?,
                    ObjectPath::try_from("/")?,
                ),
            )
            .await?;

        let (_profile, active): (
            zbus::zvariant::OwnedObjectPath,
            zbus::zvariant::OwnedObjectPath,
        ) = reply.body().deserialize()?;

        Ok(active.to_string())
    }

    async fn get_property(
        &self,
        path: &str,
        interface: &'static str,
        name: &str,
    ) -> Result<OwnedValue> {
        let proxy = PropertiesProxy::builder(&self.conn)
            .destination(NM_SERVICE)?
            .path(path.to_owned())?
            .build()
            .await?;

        Ok(proxy
            .get(InterfaceName::from_static_str(interface)?, name)
            .await?)
    }

    async fn object_paths(
        &self,
        path: &str,
        interface: &'static str,
        name: &str,
    ) -> Result<Vec<String>> {
        let value = self.get_property(path, interface, name).await?;

        let Value::Array(array) = &*value else {
            return Ok(Vec::new());
        };

        Ok(array
            .iter()
            .filter_map(|v| v.downcast_ref::<ObjectPath<'_>>().ok())
            .map(|p| p.to_string())
            .collect())
    }
}

/// Parses a colon-separated device address into its byte form, as the
/// network service stores it.
fn parse_bdaddr(bdaddr: &str) -> Vec<u8> {
    bdaddr
        .split(':')
        .filter_map(|part| u8::from_str_radix(part, 16).ok())
        .collect()
}

fn bdaddr_bytes_of(value: &OwnedValue) -> Vec<u8> {
    let Value::Array(array) = &**value else {
        return Vec::new();
    };

    array
        .iter()
        .filter_map(|v| u8::try_from(v).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::parse_bdaddr;

    #[test]
    fn address_parsing_matches_the_stored_byte_form() {
        assert_eq!(
            parse_bdaddr("2C:41:A1:49:37:CF"),
            vec![0x2c, 0x41, 0xa1, 0x49, 0x37, 0xcf]
        );
        assert_eq!(parse_bdaddr(""), Vec::<u8>::new());
    }
}
