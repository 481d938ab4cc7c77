use serde::{Deserialize, Serialize};

use crate::bluetooth::entity::{PropMap, prop_path, prop_str, prop_u64};
use crate::error::{DecodeError, EntityKind};

/// How a transfer came to exist. Sending transfers are created
/// locally, receiving ones by the remote peer; only sending transfers
/// are locally controllable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Sending,
    Receiving,
}

/// Lifecycle of a transfer:
/// `Queued -> Active -> {Complete, Error, Cancelled}`, with
/// `Active <-> Suspended` for sending transfers only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Queued,
    Active,
    Suspended,
    Complete,
    Error,
    Cancelled,
}

impl TransferStatus {
    /// Maps the remote service's status string. Unknown strings map to
    /// `None` so a malformed update never corrupts local state.
    pub fn from_wire(status: &str) -> Option<Self> {
        match status {
            "queued" => Some(TransferStatus::Queued),
            "active" => Some(TransferStatus::Active),
            "suspended" => Some(TransferStatus::Suspended),
            "complete" => Some(TransferStatus::Complete),
            "error" => Some(TransferStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Complete | TransferStatus::Error | TransferStatus::Cancelled
        )
    }
}

/// Properties of an object-exchange session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub path: String,
    /// Staging directory of the remote service; received files land
    /// here until [`finish`](crate::obex::TransferCoordinator::finish)
    /// moves them.
    pub root: String,
    pub source: String,
    /// Address of the peer. Identity for the always-accept list.
    pub destination: String,
    pub target: String,
}

impl SessionInfo {
    pub fn decode(path: &str, props: &PropMap) -> Result<Self, DecodeError> {
        let destination = prop_str(props, "Destination")
            .ok_or_else(|| DecodeError::new(EntityKind::Session, path, "Destination"))?;

        Ok(SessionInfo {
            path: path.to_owned(),
            root: prop_str(props, "Root").unwrap_or_default(),
            source: prop_str(props, "Source").unwrap_or_default(),
            destination,
            target: prop_str(props, "Target").unwrap_or_default(),
        })
    }
}

/// An in-flight object-exchange transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub path: String,
    /// Object path of the owning session, flattened to a string.
    pub session: String,
    pub name: String,
    pub mime_type: String,
    pub filename: String,
    pub status: TransferStatus,
    pub size: u64,
    pub transferred: u64,
    pub direction: TransferDirection,
}

impl Transfer {
    /// Decodes a transfer record. The direction is supplied by the
    /// caller since it follows from how the transfer was created, not
    /// from a property.
    pub fn decode(
        path: &str,
        props: &PropMap,
        direction: TransferDirection,
    ) -> Result<Self, DecodeError> {
        let session = prop_path(props, "Session")
            .ok_or_else(|| DecodeError::new(EntityKind::Transfer, path, "Session"))?;
        let status = prop_str(props, "Status")
            .as_deref()
            .and_then(TransferStatus::from_wire)
            .ok_or_else(|| DecodeError::new(EntityKind::Transfer, path, "Status"))?;

        Ok(Transfer {
            path: path.to_owned(),
            session,
            name: prop_str(props, "Name").unwrap_or_default(),
            mime_type: prop_str(props, "Type").unwrap_or_default(),
            filename: prop_str(props, "Filename").unwrap_or_default(),
            status,
            size: prop_u64(props, "Size").unwrap_or_default(),
            transferred: prop_u64(props, "Transferred").unwrap_or_default(),
            direction,
        })
    }

    /// Applies only the fields present in `props`. Byte accounting is
    /// never reset by an update that omits it.
    pub fn merge(&mut self, props: &PropMap) {
        if let Some(status) = prop_str(props, "Status")
            .as_deref()
            .and_then(TransferStatus::from_wire)
        {
            self.status = status;
        }
        if let Some(transferred) = prop_u64(props, "Transferred") {
            self.transferred = transferred;
        }
        if let Some(filename) = prop_str(props, "Filename") {
            self.filename = filename;
        }
        if let Some(size) = prop_u64(props, "Size") {
            self.size = size;
        }
    }
}
