use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use zbus::Connection;

use crate::bluetooth::{BluetoothObserver, BluezProxy, Store};
use crate::configuration::Conf;
use crate::error::{Error, Result};
use crate::network::{NetworkClient, TetherKind};
use crate::obex::{TransferCoordinator, TransferPrompt, agent};
use crate::operation::OperationCoordinator;

/// The shared context of one run: the store, the remote-service call
/// surfaces, and the coordinators. Created once and passed by
/// reference everywhere; nothing in the crate is a process-wide
/// mutable global apart from configuration and logging.
pub struct Session {
    pub store: Arc<Store>,
    pub bluez: BluezProxy,
    pub obex: Arc<TransferCoordinator>,
    pub operations: OperationCoordinator,
    pub network: NetworkClient,
    observer: BluetoothObserver,
    obex_conn: Connection,
    /// The media player currently attached, if any. Transient state;
    /// playback data itself is always read through.
    current_player: Mutex<Option<String>>,
}

impl Session {
    /// Connects both buses, bulk-populates the store, selects the
    /// initial adapter, and registers the object-push agent.
    ///
    /// # Errors
    /// - [`Error::Transport`] if either bus is unreachable.
    /// - [`Error::NoAdapters`] if no adapter is present.
    pub async fn connect(prompt: Arc<dyn TransferPrompt>) -> Result<Arc<Self>> {
        let conf = Conf::instance();

        let system_conn = Connection::system().await?;
        let session_conn = Connection::session().await?;

        let store = Arc::new(Store::new());
        let bluez = BluezProxy::new(system_conn.clone());
        bluez.refresh_store(&store).await?;
        store.select_adapter(conf.adapter.as_deref())?;

        let observer = BluetoothObserver::new(system_conn, Arc::clone(&store));
        let obex = Arc::new(TransferCoordinator::new(session_conn.clone(), prompt));
        agent::register_agent(&session_conn, Arc::clone(&obex)).await?;

        let network = NetworkClient::new(Connection::system().await?);

        Ok(Arc::new(Self {
            store,
            bluez,
            obex,
            operations: OperationCoordinator::new(),
            network,
            observer,
            obex_conn: session_conn,
            current_player: Mutex::new(None),
        }))
    }

    /// Spawns the broadcast listener task. Call once after connecting.
    pub fn listen(&self) -> JoinHandle<()> {
        self.observer.clone().listen()
    }

    /// Subscribes to the typed domain-event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<crate::bluetooth::Event> {
        self.observer.subscribe()
    }

    /// Re-enumerates the remote object graph into the store, keeping
    /// the current selection when it survives the resync.
    pub async fn resync(&self) -> Result<()> {
        let selected = self.store.current_adapter().map(|a| a.path);
        self.bluez.refresh_store(&self.store).await?;

        let survived = selected.filter(|path| self.store.get_adapter(path).is_some());
        self.store.select_adapter(survived.as_deref()).map(|_| ())
    }

    /// Pairs the device as a cancellable background operation. The
    /// compensating callback aborts the pairing attempt.
    pub fn pair_device(&self, device_path: &str) -> Result<JoinHandle<()>> {
        let bluez = self.bluez.clone();
        let path = device_path.to_owned();
        let cancel_bluez = self.bluez.clone();
        let cancel_path = device_path.to_owned();

        self.operations.start(
            async move {
                info!(device = %path, "Pairing device");
                if let Err(e) = bluez.pair(&path).await {
                    error!(device = %path, error = %e, "Pairing failed");
                }
            },
            move || {
                tokio::spawn(async move {
                    if let Err(e) = cancel_bluez.cancel_pairing(&cancel_path).await {
                        warn!(error = %e, "Could not cancel pairing");
                    }
                });
            },
        )
    }

    /// Connects the device as a cancellable background operation. The
    /// compensating callback issues a disconnect.
    pub fn connect_device(&self, device_path: &str) -> Result<JoinHandle<()>> {
        let bluez = self.bluez.clone();
        let path = device_path.to_owned();
        let cancel_bluez = self.bluez.clone();
        let cancel_path = device_path.to_owned();

        self.operations.start(
            async move {
                info!(device = %path, "Connecting device");
                if let Err(e) = bluez.connect_device(&path).await {
                    error!(device = %path, error = %e, "Connect failed");
                }
            },
            move || {
                tokio::spawn(async move {
                    if let Err(e) = cancel_bluez.disconnect_device(&cancel_path).await {
                        warn!(error = %e, "Could not disconnect after cancel");
                    }
                });
            },
        )
    }

    /// Removes a device from the adapter that owns it. For a device
    /// the cache no longer tracks, the owning adapter is derived from
    /// the device path itself.
    pub async fn remove_device(&self, device_path: &str) -> Result<()> {
        let adapter = match self.store.get_device(device_path) {
            Some(device) => device.adapter,
            None => crate::obex::parent_path(device_path).to_owned(),
        };
        self.bluez.remove_device(&adapter, device_path).await
    }

    /// Sends files to a device over one object-push session, as a
    /// cancellable background operation. The per-adapter advisory send
    /// lock is held for the whole session; a second send on the same
    /// adapter fails immediately instead of queueing.
    pub fn send_files(
        self: &Arc<Self>,
        device_address: &str,
        files: Vec<PathBuf>,
    ) -> Result<JoinHandle<()>> {
        let adapter = self.store.current_adapter().ok_or(Error::NoAdapters)?;
        let permit = self.operations.try_acquire_send(&adapter.path)?;

        let session = Arc::clone(self);
        let address = device_address.to_owned();

        self.operations.start(
            async move {
                // The permit lives for the duration of the send flow.
                let _permit = permit;

                let obex_session = match session.obex.create_session(&address).await {
                    Ok(obex_session) => obex_session,
                    Err(e) => {
                        error!(%address, error = %e, "Could not create transfer session");
                        return;
                    }
                };

                for file in &files {
                    let transfer = match session
                        .obex
                        .send_file(&obex_session.path, &file.to_string_lossy())
                        .await
                    {
                        Ok(transfer) => transfer,
                        Err(e) => {
                            error!(file = %file.display(), error = %e, "Could not queue file");
                            continue;
                        }
                    };

                    let status = session.obex.watch(&transfer.path).await;
                    if !matches!(status, crate::obex::TransferStatus::Complete) {
                        warn!(file = %file.display(), ?status, "Transfer did not complete");
                        break;
                    }
                }

                if let Err(e) = session.obex.remove_session(&obex_session.path).await {
                    warn!(error = %e, "Could not remove transfer session");
                }
            },
            || {
                // The in-flight session setup is not aborted; the user
                // is only told the send was abandoned.
                info!("Send operation cancelled");
            },
        )
    }

    /// Connects the device's network tethering profile as a
    /// background operation.
    pub fn network_connect(
        self: &Arc<Self>,
        device_path: &str,
        kind: TetherKind,
    ) -> Result<JoinHandle<()>> {
        let device = self
            .store
            .get_device(device_path)
            .ok_or_else(|| Error::NoNetworkDevice(device_path.to_owned()))?;

        let session = Arc::clone(self);
        let cancel_session = Arc::clone(self);
        let cancel_address = device.address.clone();

        self.operations.start(
            async move {
                if let Err(e) = session
                    .network
                    .connect(&device.name, kind, &device.address)
                    .await
                {
                    error!(error = %e, "Network connect failed");
                }
            },
            move || {
                tokio::spawn(async move {
                    if let Err(e) = cancel_session.network.disconnect(&cancel_address).await {
                        warn!(error = %e, "Could not disconnect network after cancel");
                    }
                });
            },
        )
    }

    /// Attaches the media player of a connected device for subsequent
    /// media calls.
    pub async fn attach_player(&self, device_path: &str) -> Result<bool> {
        let player = self.bluez.player_for_device(device_path).await?;
        let attached = player.is_some();
        *self.current_player.lock() = player;

        Ok(attached)
    }

    pub fn current_player(&self) -> Option<String> {
        self.current_player.lock().clone()
    }

    /// Unregisters the push agent before shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        agent::unregister_agent(&self.obex_conn).await
    }
}
