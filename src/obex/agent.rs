use std::sync::Arc;

use tracing::{info, warn};
use zbus::{Connection, zvariant::{ObjectPath, OwnedObjectPath}};

use crate::configuration::Conf;
use crate::error::Result;
use crate::obex::coordinator::TransferCoordinator;
use crate::obex::parent_path;

pub const AGENT_PATH: &str = "/org/bluez/obex/agent/bluetooth_tui";

const AGENT_MANAGER_INTERFACE: &str = "org.bluez.obex.AgentManager1";
const AGENT_MANAGER_PATH: &str = "/org/bluez/obex";

/// The push agent the transfer service asks before delivering an
/// incoming file. Authorization is delegated to the coordinator, which
/// consults the always-accept list and the user prompt.
pub struct ObexAgent {
    coordinator: Arc<TransferCoordinator>,
}

#[zbus::interface(name = "org.bluez.obex.Agent1")]
impl ObexAgent {
    /// Called by the remote service for each incoming transfer. The
    /// returned path is where the service stages the file.
    async fn authorize_push(&self, transfer: OwnedObjectPath) -> zbus::fdo::Result<String> {
        let transfer_path = transfer.as_str();
        let session_path = parent_path(transfer_path);

        match self
            .coordinator
            .authorize_incoming(session_path, transfer_path)
            .await
        {
            Ok((transfer, staging)) => {
                let reply = staging.to_string_lossy().into_owned();
                Arc::clone(&self.coordinator).track_incoming(transfer, staging);
                Ok(reply)
            }
            Err(e) => {
                warn!(error = %e, "Incoming transfer not authorized");
                Err(zbus::fdo::Error::Failed(e.to_string()))
            }
        }
    }

    /// Called when the remote service abandons an authorization request.
    fn cancel(&self) {}

    /// Called when the agent is unregistered.
    fn release(&self) {}
}

/// Serves the agent on the transfer service bus and registers it with
/// the agent manager.
pub async fn register_agent(conn: &Connection, coordinator: Arc<TransferCoordinator>) -> Result<()> {
    conn.object_server()
        .at(AGENT_PATH, ObexAgent { coordinator })
        .await?;

    call_agent_manager(conn, "RegisterAgent").await?;
    info!(path = AGENT_PATH, "Registered object-push agent");

    Ok(())
}

/// Unregisters and removes the agent.
pub async fn unregister_agent(conn: &Connection) -> Result<()> {
    call_agent_manager(conn, "UnregisterAgent").await?;
    conn.object_server().remove::<ObexAgent, _>(AGENT_PATH).await?;

    Ok(())
}

async fn call_agent_manager(conn: &Connection, method: &str) -> Result<()> {
    let conf = Conf::instance();
    conn.call_method(
        Some(conf.dbus.obex_service.as_str()),
        AGENT_MANAGER_PATH,
        Some(AGENT_MANAGER_INTERFACE),
        method,
        &(ObjectPath::try_from(AGENT_PATH)?,),
    )
    .await?;

    Ok(())
}
