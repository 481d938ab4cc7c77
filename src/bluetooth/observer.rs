use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::StreamExt;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, instrument, warn};
use zbus::{Connection, MatchRule, Message, MessageStream, message::Type, zvariant::OwnedObjectPath};

use crate::bluetooth::entity::PropMap;
use crate::bluetooth::router::{self, Event, Notification};
use crate::bluetooth::store::Store;
use crate::configuration::Conf;
use crate::error::Result;

const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

/// Consumes the management service's broadcast stream, applies each
/// notification to the store, and fans the resulting domain events out
/// to subscribers.
///
/// This task is the single mutation path for the store after startup;
/// within the subscription, events are applied in delivery order.
#[derive(Debug, Clone)]
pub struct BluetoothObserver {
    conn: Connection,
    store: Arc<Store>,
    sender: broadcast::Sender<Event>,
}

impl BluetoothObserver {
    pub fn new(conn: Connection, store: Arc<Store>) -> Self {
        let (sender, _) = broadcast::channel(64);

        Self {
            conn,
            store,
            sender,
        }
    }

    /// Subscribes to the typed event output.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Spawns the observer to run in a background task.
    #[instrument(skip(self))]
    pub fn listen(self) -> JoinHandle<()> {
        info!("Spawning Bluetooth observer task.");
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!("Bluetooth observer failed: {}", e);
            }
        })
    }

    #[instrument(skip_all)]
    async fn run(&self) -> Result<()> {
        let conf = Conf::instance();
        let rule = MatchRule::builder()
            .msg_type(Type::Signal)
            .sender(conf.dbus.service.as_str())?
            .build();
        let mut signals = MessageStream::for_match_rule(rule, &self.conn, Some(64)).await?;

        info!("Listening for Bluetooth broadcast notifications...");

        while let Some(msg) = signals.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "Failed to read broadcast message. skipping...");
                    continue;
                }
            };

            let Some(notification) = classify(&msg) else {
                continue;
            };

            let event = router::dispatch(&self.store, notification);
            if matches!(event, Event::NoOp) {
                continue;
            }

            debug!(?event, "Dispatched broadcast notification");
            if self.sender.send(event).is_err() {
                debug!("No subscribers to notify about the event.");
            }
        }

        Ok(())
    }
}

/// Decodes a raw bus message into a notification. Returns `None` for
/// anything malformed or out of scope; the listening loop never stops
/// over one bad message.
pub(crate) fn classify(msg: &Message) -> Option<Notification> {
    let header = msg.header();
    let interface = header.interface()?.to_string();
    let member = header.member()?.to_string();
    let body = msg.body();

    match (interface.as_str(), member.as_str()) {
        (PROPERTIES_INTERFACE, "PropertiesChanged") => {
            let path = header.path()?.to_string();
            let (interface, changed, _invalidated) =
                body.deserialize::<(String, PropMap, Vec<String>)>().ok()?;

            Some(Notification::PropertiesChanged {
                interface,
                path,
                changed,
            })
        }
        (OBJECT_MANAGER_INTERFACE, "InterfacesAdded") => {
            let (path, interfaces) = body
                .deserialize::<(OwnedObjectPath, HashMap<String, PropMap>)>()
                .ok()?;

            Some(Notification::InterfacesAdded {
                path: path.to_string(),
                interfaces,
            })
        }
        (OBJECT_MANAGER_INTERFACE, "InterfacesRemoved") => {
            let (path, interfaces) = body.deserialize::<(OwnedObjectPath, Vec<String>)>().ok()?;

            Some(Notification::InterfacesRemoved {
                path: path.to_string(),
                interfaces,
            })
        }
        _ => None,
    }
}
