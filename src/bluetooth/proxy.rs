use tracing::{debug, warn};
use zbus::{
    Connection,
    fdo::{ObjectManagerProxy, PropertiesProxy},
    names::InterfaceName,
    zvariant::{ObjectPath, Value},
};

use crate::bluetooth::entity::{Adapter, Device, MediaState, PropMap, prop_bool, prop_path};
use crate::bluetooth::router::{ADAPTER_INTERFACE, BATTERY_INTERFACE, DEVICE_INTERFACE};
use crate::bluetooth::store::Store;
use crate::configuration::Conf;
use crate::error::Result;

const MEDIA_CONTROL_INTERFACE: &str = "org.bluez.MediaControl1";
const MEDIA_PLAYER_INTERFACE: &str = "org.bluez.MediaPlayer1";

/// Synchronous call surface of the Bluetooth management service.
///
/// Every method issues one remote call and propagates its fault; no
/// call is retried and no local timeout is enforced.
#[derive(Debug, Clone)]
pub struct BluezProxy {
    conn: Connection,
}

impl BluezProxy {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Bulk-enumerates the remote object graph and rebuilds the store
    /// from it. A single undecodable entity is skipped with a warning;
    /// it never aborts synchronization of its siblings.
    pub async fn refresh_store(&self, store: &Store) -> Result<()> {
        let conf = Conf::instance();
        let proxy = ObjectManagerProxy::builder(&self.conn)
            .destination(conf.dbus.service.as_str())?
            .path("/")?
            .build()
            .await?;

        let objects = proxy.get_managed_objects().await?;
        store.reset();

        let mut paths: Vec<_> = objects.keys().cloned().collect();
        paths.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        for path in &paths {
            let interfaces = &objects[path];
            let Some(props) = interfaces.get(ADAPTER_INTERFACE) else {
                continue;
            };

            match Adapter::decode(path.as_str(), props) {
                Ok(adapter) => store.upsert_adapter(adapter),
                Err(e) => warn!(error = %e, "Skipping undecodable adapter in snapshot"),
            }
        }

        for path in &paths {
            let interfaces = &objects[path];
            let Some(props) = interfaces.get(DEVICE_INTERFACE) else {
                continue;
            };

            match Device::decode(path.as_str(), props) {
                Ok(mut device) => {
                    if let Some(battery) = interfaces.get(BATTERY_INTERFACE) {
                        device.merge_battery(battery);
                    }
                    store.upsert_device(device);
                }
                Err(e) => warn!(error = %e, "Skipping undecodable device in snapshot"),
            }
        }

        debug!(
            adapters = store.list_adapters().len(),
            "Rebuilt store from bulk snapshot"
        );

        Ok(())
    }

    /// Attempts to pair with a device that is in pairing mode.
    pub async fn pair(&self, device_path: &str) -> Result<()> {
        self.call_device(device_path, "Pair").await
    }

    /// Cancels an in-flight pairing attempt.
    pub async fn cancel_pairing(&self, device_path: &str) -> Result<()> {
        self.call_device(device_path, "CancelPairing").await
    }

    /// Connects an already paired device.
    pub async fn connect_device(&self, device_path: &str) -> Result<()> {
        self.call_device(device_path, "Connect").await
    }

    pub async fn disconnect_device(&self, device_path: &str) -> Result<()> {
        self.call_device(device_path, "Disconnect").await
    }

    /// Permanently removes the device from its adapter. It can only
    /// come back by being paired again.
    pub async fn remove_device(&self, adapter_path: &str, device_path: &str) -> Result<()> {
        let conf = Conf::instance();
        self.conn
            .call_method(
                Some(conf.dbus.service.as_str()),
                adapter_path,
                Some(ADAPTER_INTERFACE),
                "RemoveDevice",
                &(ObjectPath::try_from(device_path)?,),
            )
            .await?;

        Ok(())
    }

    /// Puts the adapter into discovering mode.
    pub async fn start_discovery(&self, adapter_path: &str) -> Result<()> {
        self.call_adapter(adapter_path, "StartDiscovery").await
    }

    pub async fn stop_discovery(&self, adapter_path: &str) -> Result<()> {
        self.call_adapter(adapter_path, "StopDiscovery").await
    }

    /// Sets the powered state of the adapter. Pairability follows the
    /// powered state.
    pub async fn set_powered(&self, adapter_path: &str, enable: bool) -> Result<()> {
        self.set_adapter_property(adapter_path, "Powered", Value::Bool(enable))
            .await?;
        self.set_adapter_property(adapter_path, "Pairable", Value::Bool(enable))
            .await
    }

    pub async fn set_discoverable(&self, adapter_path: &str, enable: bool) -> Result<()> {
        self.set_adapter_property(adapter_path, "Discoverable", Value::Bool(enable))
            .await
    }

    pub async fn set_pairable(&self, adapter_path: &str, enable: bool) -> Result<()> {
        self.set_adapter_property(adapter_path, "Pairable", Value::Bool(enable))
            .await
    }

    pub async fn set_trusted(&self, device_path: &str, enable: bool) -> Result<()> {
        self.set_device_property(device_path, "Trusted", Value::Bool(enable))
            .await
    }

    pub async fn set_blocked(&self, device_path: &str, enable: bool) -> Result<()> {
        self.set_device_property(device_path, "Blocked", Value::Bool(enable))
            .await
    }

    pub async fn set_adapter_property(
        &self,
        adapter_path: &str,
        key: &str,
        value: Value<'_>,
    ) -> Result<()> {
        let proxy = self.properties_proxy(adapter_path).await?;
        proxy
            .set(InterfaceName::from_static_str(ADAPTER_INTERFACE)?, key, value)
            .await?;

        Ok(())
    }

    pub async fn set_device_property(
        &self,
        device_path: &str,
        key: &str,
        value: Value<'_>,
    ) -> Result<()> {
        let proxy = self.properties_proxy(device_path).await?;
        proxy
            .set(InterfaceName::from_static_str(DEVICE_INTERFACE)?, key, value)
            .await?;

        Ok(())
    }

    /// Resolves the media player object attached to a connected device.
    pub async fn player_for_device(&self, device_path: &str) -> Result<Option<String>> {
        let proxy = self.properties_proxy(device_path).await?;
        let control: PropMap = proxy
            .get_all(InterfaceName::from_static_str(MEDIA_CONTROL_INTERFACE)?)
            .await?;

        if !prop_bool(&control, "Connected").unwrap_or(false) {
            return Ok(None);
        }

        Ok(prop_path(&control, "Player"))
    }

    /// Reads the playback state through to the remote player. Nothing
    /// is cached; repeated calls observe the live state.
    pub async fn media_state(&self, player_path: &str) -> Result<MediaState> {
        let proxy = self.properties_proxy(player_path).await?;
        let props: PropMap = proxy
            .get_all(InterfaceName::from_static_str(MEDIA_PLAYER_INTERFACE)?)
            .await?;

        Ok(MediaState::decode(&props))
    }

    pub async fn media_play(&self, player_path: &str) -> Result<()> {
        self.call_player(player_path, "Play").await
    }

    pub async fn media_pause(&self, player_path: &str) -> Result<()> {
        self.call_player(player_path, "Pause").await
    }

    /// Toggles between the playing and paused states.
    pub async fn media_toggle(&self, player_path: &str) -> Result<()> {
        let state = self.media_state(player_path).await?;
        match state.status.as_str() {
            "playing" => self.media_pause(player_path).await,
            "paused" => self.media_play(player_path).await,
            _ => Ok(()),
        }
    }

    pub async fn media_next(&self, player_path: &str) -> Result<()> {
        self.call_player(player_path, "Next").await
    }

    pub async fn media_previous(&self, player_path: &str) -> Result<()> {
        self.call_player(player_path, "Previous").await
    }

    pub async fn media_stop(&self, player_path: &str) -> Result<()> {
        self.call_player(player_path, "Stop").await
    }

    async fn call_device(&self, device_path: &str, method: &str) -> Result<()> {
        let conf = Conf::instance();
        self.conn
            .call_method(
                Some(conf.dbus.service.as_str()),
                device_path,
                Some(DEVICE_INTERFACE),
                method,
                &(),
            )
            .await?;

        Ok(())
    }

    async fn call_adapter(&self, adapter_path: &str, method: &str) -> Result<()> {
        let conf = Conf::instance();
        self.conn
            .call_method(
                Some(conf.dbus.service.as_str()),
                adapter_path,
                Some(ADAPTER_INTERFACE),
                method,
                &(),
            )
            .await?;

        Ok(())
    }

    async fn call_player(&self, player_path: &str, method: &str) -> Result<()> {
        let conf = Conf::instance();
        self.conn
            .call_method(
                Some(conf.dbus.service.as_str()),
                player_path,
                Some(MEDIA_PLAYER_INTERFACE),
                method,
                &(),
            )
            .await?;

        Ok(())
    }

    async fn properties_proxy(&self, path: &str) -> Result<PropertiesProxy<'_>> {
        let conf = Conf::instance();
        let proxy = PropertiesProxy::builder(&self.conn)
            .destination(conf.dbus.service.as_str())?
            .path(path.to_owned())?
            .build()
            .await?;

        Ok(proxy)
    }
}
