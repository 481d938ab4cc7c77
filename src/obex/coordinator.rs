use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, instrument, warn};
use zbus::{Connection, MatchRule, MessageStream, message::Type};

use crate::bluetooth::observer::classify;
use crate::bluetooth::router::Notification;
use crate::configuration::Conf;
use crate::error::{Error, Result};
use crate::obex::client::{ObexClient, SESSION_INTERFACE, TRANSFER_INTERFACE};
use crate::obex::entity::{SessionInfo, Transfer, TransferDirection, TransferStatus};
use crate::obex::registry::TransferRegistry;

/// Decision returned by the incoming-transfer prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    /// Accept, and accept everything from this device from now on.
    AcceptAlways,
    Reject,
}

/// An incoming transfer awaiting user confirmation.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub name: String,
    pub size: u64,
    pub address: String,
}

/// The front end's confirmation seam for incoming transfers. The
/// coordinator blocks on it for devices not on the always-accept list.
#[async_trait]
pub trait TransferPrompt: Send + Sync {
    async fn confirm(&self, request: &IncomingRequest) -> Decision;
}

/// A prompt that rejects every unknown device. Useful as a default
/// until a front end installs an interactive one.
#[derive(Debug, Default)]
pub struct RejectingPrompt;

#[async_trait]
impl TransferPrompt for RejectingPrompt {
    async fn confirm(&self, request: &IncomingRequest) -> Decision {
        info!(
            name = %request.name,
            address = %request.address,
            "No prompt handler installed. Rejecting incoming transfer."
        );
        Decision::Reject
    }
}

/// Progress update for one transfer, for incremental display.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub path: String,
    pub name: String,
    pub status: TransferStatus,
    pub size: u64,
    pub transferred: u64,
}

impl TransferEvent {
    fn from_transfer(transfer: &Transfer) -> Self {
        Self {
            path: transfer.path.clone(),
            name: transfer.name.clone(),
            status: transfer.status,
            size: transfer.size,
            transferred: transfer.transferred,
        }
    }
}

/// Coordinates object-exchange session and transfer lifecycle.
///
/// Progress arrives on the transfer service's broadcast stream, scoped
/// per transfer path. The always-accept list and the registry each
/// carry their own lock so a long transfer never serializes unrelated
/// reads.
pub struct TransferCoordinator {
    conn: Connection,
    client: ObexClient,
    registry: TransferRegistry,
    allow_list: Mutex<Vec<String>>,
    prompt: Arc<dyn TransferPrompt>,
    sender: broadcast::Sender<TransferEvent>,
}

impl TransferCoordinator {
    pub fn new(conn: Connection, prompt: Arc<dyn TransferPrompt>) -> Self {
        let (sender, _) = broadcast::channel(64);

        Self {
            client: ObexClient::new(conn.clone()),
            conn,
            registry: TransferRegistry::new(),
            allow_list: Mutex::new(Vec::new()),
            prompt,
            sender,
        }
    }

    /// Subscribes to per-transfer progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.sender.subscribe()
    }

    /// Creates an object-push session towards `address`.
    pub async fn create_session(&self, address: &str) -> Result<SessionInfo> {
        let path = self.client.create_session(address).await?;
        let props = self.client.session_properties(&path).await?;
        let session = SessionInfo::decode(&path, &props)?;

        self.registry.insert_session(session.clone());
        info!(session = %session.path, %address, "Created object-exchange session");

        Ok(session)
    }

    /// Removes the session and forgets its transfers.
    pub async fn remove_session(&self, session_path: &str) -> Result<()> {
        self.registry.remove_session(session_path);
        self.client.remove_session(session_path).await
    }

    /// Queues a file on the session and registers the resulting
    /// sending transfer.
    pub async fn send_file(&self, session_path: &str, file: &str) -> Result<Transfer> {
        let (path, props) = self.client.send_file(session_path, file).await?;
        let transfer = Transfer::decode(&path, &props, TransferDirection::Sending)?;

        self.registry.insert_transfer(transfer.clone());
        let _ = self.sender.send(TransferEvent::from_transfer(&transfer));

        Ok(transfer)
    }

    /// Suspends a sending transfer.
    ///
    /// # Errors
    /// - [`Error::UnsupportedOperation`] for a receiving transfer.
    pub async fn suspend(&self, transfer_path: &str) -> Result<()> {
        match self.registry.controllable(transfer_path)? {
            Some(_) => self.client.suspend_transfer(transfer_path).await,
            None => Ok(()),
        }
    }

    /// Resumes a suspended sending transfer. Byte accounting continues
    /// from the last reported count.
    pub async fn resume(&self, transfer_path: &str) -> Result<()> {
        match self.registry.controllable(transfer_path)? {
            Some(_) => self.client.resume_transfer(transfer_path).await,
            None => Ok(()),
        }
    }

    /// Cancels a sending transfer.
    pub async fn cancel(&self, transfer_path: &str) -> Result<()> {
        match self.registry.controllable(transfer_path)? {
            Some(_) => {
                self.client.cancel_transfer(transfer_path).await?;
                if let Some(transfer) = self.registry.mark_cancelled(transfer_path) {
                    let _ = self.sender.send(TransferEvent::from_transfer(&transfer));
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Authorizes an incoming transfer and returns it together with
    /// the staging path the remote service will write to.
    ///
    /// Devices on the always-accept list skip the prompt; otherwise
    /// this blocks until the user decides, and an "always" reply adds
    /// the device to the list for the rest of the process lifetime.
    #[instrument(skip(self))]
    pub async fn authorize_incoming(
        &self,
        session_path: &str,
        transfer_path: &str,
    ) -> Result<(Transfer, PathBuf)> {
        let objects = self.client.managed_objects().await?;

        let session_props = objects
            .get(&zbus::zvariant::ObjectPath::try_from(session_path)?)
            .and_then(|ifaces| ifaces.get(SESSION_INTERFACE))
            .ok_or(Error::Rejected)?;
        let session = SessionInfo::decode(session_path, session_props)?;

        let transfer_props = objects
            .get(&zbus::zvariant::ObjectPath::try_from(transfer_path)?)
            .and_then(|ifaces| ifaces.get(TRANSFER_INTERFACE))
            .ok_or(Error::Rejected)?;
        let transfer =
            Transfer::decode(transfer_path, transfer_props, TransferDirection::Receiving)?;
        if transfer.status == TransferStatus::Error {
            return Err(Error::Rejected);
        }

        if !self.is_always_accepted(&session.destination) {
            let request = IncomingRequest {
                name: transfer.name.clone(),
                size: transfer.size,
                address: session.destination.clone(),
            };

            match self.prompt.confirm(&request).await {
                Decision::Accept => {}
                Decision::AcceptAlways => self.accept_always(&session.destination),
                Decision::Reject => return Err(Error::Rejected),
            }
        }

        let staging = Path::new(&session.root).join(&transfer.name);
        self.registry.insert_session(session);
        self.registry.insert_transfer(transfer.clone());

        Ok((transfer, staging))
    }

    /// Follows one transfer's progress until a terminal condition and
    /// returns the final status. The per-transfer subscription is
    /// released exactly once, whether the transfer completes, fails,
    /// is cancelled, or the stream closes under it.
    pub async fn watch(&self, transfer_path: &str) -> TransferStatus {
        if !self.registry.begin_watch(transfer_path) {
            warn!(transfer = %transfer_path, "Transfer is already being watched");
            return self
                .registry
                .get(transfer_path)
                .map(|t| t.status)
                .unwrap_or(TransferStatus::Error);
        }

        let final_status = match self.watch_stream(transfer_path).await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Transfer progress subscription failed");
                TransferStatus::Error
            }
        };

        if self.registry.release(transfer_path) {
            debug!(transfer = %transfer_path, ?final_status, "Released transfer subscription");
        }

        final_status
    }

    async fn watch_stream(&self, transfer_path: &str) -> Result<TransferStatus> {
        let conf = Conf::instance();
        let rule = MatchRule::builder()
            .msg_type(Type::Signal)
            .sender(conf.dbus.obex_service.as_str())?
            .path(transfer_path.to_owned())?
            .build();
        let mut signals = MessageStream::for_match_rule(rule, &self.conn, Some(16)).await?;

        while let Some(msg) = signals.next().await {
            let Ok(msg) = msg else { continue };
            let Some(Notification::PropertiesChanged {
                interface,
                path,
                changed,
            }) = classify(&msg)
            else {
                continue;
            };

            if interface != TRANSFER_INTERFACE || path != transfer_path {
                continue;
            }

            let Some(transfer) = self.registry.merge(&path, &changed) else {
                continue;
            };

            let _ = self.sender.send(TransferEvent::from_transfer(&transfer));

            if transfer.status.is_terminal() {
                return Ok(transfer.status);
            }
        }

        // The stream closed under the transfer. Record it as failed.
        if let Some(mut transfer) = self.registry.get(transfer_path) {
            transfer.status = TransferStatus::Error;
            let _ = self.sender.send(TransferEvent::from_transfer(&transfer));
        }

        Ok(TransferStatus::Error)
    }

    /// Moves a completed received file from the remote service's
    /// staging location into the receive directory, creating the
    /// directory on demand. Anything other than a complete receiving
    /// transfer is left untouched.
    pub async fn finish(&self, transfer: &Transfer, staging: &Path) -> Result<Option<PathBuf>> {
        save_received(transfer, staging, &receive_dir()?).await
    }

    /// Watches an authorized incoming transfer in the background,
    /// saving the file and tearing the session down once it ends.
    pub fn track_incoming(self: Arc<Self>, transfer: Transfer, staging: PathBuf) -> JoinHandle<()> {
        tokio::spawn(async move {
            let status = self.watch(&transfer.path).await;

            let finished = Transfer {
                status,
                ..transfer.clone()
            };
            if let Err(e) = self.finish(&finished, &staging).await {
                warn!(error = %e, "Could not save received file");
            }

            if let Err(e) = self.remove_session(&transfer.session).await {
                debug!(error = %e, "Could not remove incoming session");
            }
        })
    }

    fn is_always_accepted(&self, address: &str) -> bool {
        self.allow_list.lock().iter().any(|a| a == address)
    }

    /// Adds a device to the always-accept list. The list only ever
    /// grows and lives for the process lifetime.
    fn accept_always(&self, address: &str) {
        let mut list = self.allow_list.lock();
        if !list.iter().any(|a| a == address) {
            list.push(address.to_owned());
        }
    }
}

async fn save_received(
    transfer: &Transfer,
    staging: &Path,
    target_dir: &Path,
) -> Result<Option<PathBuf>> {
    if transfer.direction != TransferDirection::Receiving
        || transfer.status != TransferStatus::Complete
    {
        return Ok(None);
    }

    tokio::fs::create_dir_all(target_dir).await?;

    let file_name = staging
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"))?;
    let target = target_dir.join(file_name);
    tokio::fs::rename(staging, &target).await?;

    info!(file = %target.display(), "Saved received file");
    Ok(Some(target))
}

/// The directory received files are moved into. Configurable, with a
/// fixed home sub-directory as the default.
fn receive_dir() -> Result<PathBuf> {
    let conf = Conf::instance();
    if let Some(dir) = &conf.receive_dir {
        return Ok(PathBuf::from(dir));
    }

    dirs::home_dir()
        .map(|home| home.join("bluetooth-tui"))
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "cannot determine home directory",
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(name: &str, status: TransferStatus) -> Transfer {
        Transfer {
            path: "/org/bluez/obex/session0/transfer0".to_owned(),
            session: "/org/bluez/obex/session0".to_owned(),
            name: name.to_owned(),
            mime_type: String::new(),
            filename: String::new(),
            status,
            size: 5,
            transferred: 5,
            direction: TransferDirection::Receiving,
        }
    }

    #[tokio::test]
    async fn save_ignores_sending_and_unfinished_transfers() {
        let staging_dir = tempfile::tempdir().expect("tempdir");
        let target_dir = tempfile::tempdir().expect("tempdir");
        let staging = staging_dir.path().join("notes.txt");
        tokio::fs::write(&staging, b"hello").await.expect("write");

        let sending = Transfer {
            direction: TransferDirection::Sending,
            ..received("notes.txt", TransferStatus::Complete)
        };
        assert!(matches!(
            save_received(&sending, &staging, target_dir.path()).await,
            Ok(None)
        ));

        let unfinished = received("notes.txt", TransferStatus::Active);
        assert!(matches!(
            save_received(&unfinished, &staging, target_dir.path()).await,
            Ok(None)
        ));

        assert!(staging.exists());
    }

    #[tokio::test]
    async fn save_moves_a_complete_received_file() {
        let staging_dir = tempfile::tempdir().expect("tempdir");
        let target_root = tempfile::tempdir().expect("tempdir");
        // The receive directory is created on demand.
        let target_dir = target_root.path().join("incoming");

        let staging = staging_dir.path().join("notes.txt");
        tokio::fs::write(&staging, b"hello").await.expect("write");

        let transfer = received("notes.txt", TransferStatus::Complete);
        let moved = save_received(&transfer, &staging, &target_dir)
            .await
            .expect("save")
            .expect("moved");

        assert!(!staging.exists());
        assert_eq!(moved, target_dir.join("notes.txt"));
        assert_eq!(
            tokio::fs::read(&moved).await.expect("read moved file"),
            b"hello"
        );
    }
}
