use std::collections::HashMap;

use zbus::{
    Connection,
    fdo::{ObjectManagerProxy, PropertiesProxy},
    names::InterfaceName,
    zvariant::{ObjectPath, Value},
};

use crate::bluetooth::entity::PropMap;
use crate::configuration::Conf;
use crate::error::Result;

pub const OBEX_PATH: &str = "/org/bluez/obex";

pub const CLIENT_INTERFACE: &str = "org.bluez.obex.Client1";
pub const SESSION_INTERFACE: &str = "org.bluez.obex.Session1";
pub const TRANSFER_INTERFACE: &str = "org.bluez.obex.Transfer1";
pub const OBJECT_PUSH_INTERFACE: &str = "org.bluez.obex.ObjectPush1";

/// Synchronous call surface of the file-transfer service, reached over
/// its own bus connection.
#[derive(Debug, Clone)]
pub struct ObexClient {
    conn: Connection,
}

impl ObexClient {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Creates an object-push session towards `address` and returns
    /// the session path.
    pub async fn create_session(&self, address: &str) -> Result<String> {
        let conf = Conf::instance();
        let mut args = HashMap::new();
        args.insert("Target", Value::from("opp"));

        let reply = self
            .conn
            .call_method(
                Some(conf.dbus.obex_service.as_str()),
                OBEX_PATH,
                Some(CLIENT_INTERFACE),
                "CreateSession",
                &(address, args),
            )
            .await?;

        let path: zbus::zvariant::OwnedObjectPath = reply.body().deserialize()?;
        Ok(path.to_string())
    }

    /// Removes the session and cancels any transfer still pending on it.
    pub async fn remove_session(&self, session_path: &str) -> Result<()> {
        let conf = Conf::instance();
        self.conn
            .call_method(
                Some(conf.dbus.obex_service.as_str()),
                OBEX_PATH,
                Some(CLIENT_INTERFACE),
                "RemoveSession",
                &(ObjectPath::try_from(session_path)?,),
            )
            .await?;

        Ok(())
    }

    /// Queues a file on the session. Returns the transfer path and the
    /// initial transfer properties.
    pub async fn send_file(&self, session_path: &str, file: &str) -> Result<(String, PropMap)> {
        let conf = Conf::instance();
        let reply = self
            .conn
            .call_method(
                Some(conf.dbus.obex_service.as_str()),
                session_path,
                Some(OBJECT_PUSH_INTERFACE),
                "SendFile",
                &(file,),
            )
            .await?;

        let (path, props): (zbus::zvariant::OwnedObjectPath, PropMap) =
            reply.body().deserialize()?;
        Ok((path.to_string(), props))
    }

    pub async fn suspend_transfer(&self, transfer_path: &str) -> Result<()> {
        self.call_transfer(transfer_path, "Suspend").await
    }

    pub async fn resume_transfer(&self, transfer_path: &str) -> Result<()> {
        self.call_transfer(transfer_path, "Resume").await
    }

    pub async fn cancel_transfer(&self, transfer_path: &str) -> Result<()> {
        self.call_transfer(transfer_path, "Cancel").await
    }

    pub async fn session_properties(&self, session_path: &str) -> Result<PropMap> {
        self.properties(session_path, SESSION_INTERFACE).await
    }

    pub async fn transfer_properties(&self, transfer_path: &str) -> Result<PropMap> {
        self.properties(transfer_path, TRANSFER_INTERFACE).await
    }

    /// Bulk-enumerates the transfer service's object graph.
    pub async fn managed_objects(&self) -> Result<zbus::fdo::ManagedObjects> {
        let conf = Conf::instance();
        let proxy = ObjectManagerProxy::builder(&self.conn)
            .destination(conf.dbus.obex_service.as_str())?
            .path("/")?
            .build()
            .await?;

        Ok(proxy.get_managed_objects().await?)
    }

    async fn call_transfer(&self, transfer_path: &str, method: &str) -> Result<()> {
        let conf = Conf::instance();
        self.conn
            .call_method(
                Some(conf.dbus.obex_service.as_str()),
                transfer_path,
                Some(TRANSFER_INTERFACE),
                method,
                &(),
            )
            .await?;

        Ok(())
    }

    async fn properties(&self, path: &str, interface: &'static str) -> Result<PropMap> {
        let conf = Conf::instance();
        let proxy = PropertiesProxy::builder(&self.conn)
            .destination(conf.dbus.obex_service.as_str())?
            .path(path.to_owned())?
            .build()
            .await?;

        Ok(proxy.get_all(InterfaceName::from_static_str(interface)?).await?)
    }
}
