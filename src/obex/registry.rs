use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::bluetooth::entity::PropMap;
use crate::error::{Error, Result};
use crate::obex::entity::{SessionInfo, Transfer, TransferDirection, TransferStatus};

/// In-memory registry of object-exchange sessions and transfers.
///
/// The registry has its own lock; it is never held across a remote
/// call and is independent of the Bluetooth store's lock.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<String, SessionInfo>,
    transfers: Vec<Transfer>,
    watched: HashSet<String>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_session(&self, session: SessionInfo) {
        let mut inner = self.inner.lock();
        inner.sessions.insert(session.path.clone(), session);
    }

    pub fn session(&self, path: &str) -> Option<SessionInfo> {
        self.inner.lock().sessions.get(path).cloned()
    }

    /// Drops the session and every transfer that belongs to it.
    pub fn remove_session(&self, path: &str) -> Option<SessionInfo> {
        let mut inner = self.inner.lock();
        inner.transfers.retain(|t| t.session != path);
        inner.sessions.remove(path)
    }

    pub fn insert_transfer(&self, transfer: Transfer) {
        let mut inner = self.inner.lock();
        match inner.transfers.iter_mut().find(|t| t.path == transfer.path) {
            Some(existing) => *existing = transfer,
            None => inner.transfers.push(transfer),
        }
    }

    pub fn get(&self, path: &str) -> Option<Transfer> {
        self.inner.lock().transfers.iter().find(|t| t.path == path).cloned()
    }

    /// Merges changed properties into the transfer at `path` and
    /// returns the updated record, or `None` when it is not tracked.
    pub fn merge(&self, path: &str, props: &PropMap) -> Option<Transfer> {
        let mut inner = self.inner.lock();
        let transfer = inner.transfers.iter_mut().find(|t| t.path == path)?;
        transfer.merge(props);
        Some(transfer.clone())
    }

    /// Looks up the transfer for a suspend, resume or cancel request.
    ///
    /// Returns `Ok(None)` for an untracked path (the request is
    /// silently dropped as stale).
    ///
    /// # Errors
    /// - [`Error::UnsupportedOperation`] for a receiving transfer; the
    ///   remote receiving flow is not locally controllable, and a
    ///   silent no-op would mislead the user.
    pub fn controllable(&self, path: &str) -> Result<Option<Transfer>> {
        let inner = self.inner.lock();
        let Some(transfer) = inner.transfers.iter().find(|t| t.path == path) else {
            return Ok(None);
        };

        if transfer.direction == TransferDirection::Receiving {
            return Err(Error::UnsupportedOperation);
        }

        Ok(Some(transfer.clone()))
    }

    /// Records a locally requested cancellation.
    pub fn mark_cancelled(&self, path: &str) -> Option<Transfer> {
        let mut inner = self.inner.lock();
        let transfer = inner.transfers.iter_mut().find(|t| t.path == path)?;
        transfer.status = TransferStatus::Cancelled;
        Some(transfer.clone())
    }

    /// Claims the per-transfer progress subscription. Returns `false`
    /// if the transfer is already being watched.
    pub fn begin_watch(&self, path: &str) -> bool {
        self.inner.lock().watched.insert(path.to_owned())
    }

    /// Releases the per-transfer subscription and drops the transfer
    /// record. Returns `true` only for the call that actually released
    /// it, so a release can happen exactly once no matter which
    /// terminal condition triggered it.
    pub fn release(&self, path: &str) -> bool {
        let mut inner = self.inner.lock();
        let released = inner.watched.remove(path);
        if released {
            inner.transfers.retain(|t| t.path != path);
        }

        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbus::zvariant::{OwnedValue, Value};

    fn transfer(path: &str, direction: TransferDirection) -> Transfer {
        Transfer {
            path: path.to_owned(),
            session: "/org/bluez/obex/client/session0".to_owned(),
            name: "photo.jpg".to_owned(),
            mime_type: "image/jpeg".to_owned(),
            filename: String::new(),
            status: TransferStatus::Queued,
            size: 4096,
            transferred: 0,
            direction,
        }
    }

    fn value(v: impl Into<Value<'static>>) -> OwnedValue {
        Value::try_to_owned(&v.into()).expect("owned value")
    }

    fn status_update(status: &str) -> PropMap {
        let mut props = PropMap::new();
        props.insert("Status".into(), value(status.to_owned()));
        props
    }

    const PATH: &str = "/org/bluez/obex/client/session0/transfer0";

    #[test]
    fn receiving_transfers_are_not_controllable() {
        let registry = TransferRegistry::new();
        registry.insert_transfer(transfer(PATH, TransferDirection::Receiving));

        assert!(matches!(
            registry.controllable(PATH),
            Err(Error::UnsupportedOperation)
        ));
    }

    #[test]
    fn sending_transfers_are_controllable_and_unknown_paths_are_stale() {
        let registry = TransferRegistry::new();
        registry.insert_transfer(transfer(PATH, TransferDirection::Sending));

        assert!(matches!(registry.controllable(PATH), Ok(Some(_))));
        assert!(matches!(registry.controllable("/nope"), Ok(None)));
    }

    #[test]
    fn resume_continues_byte_accounting() {
        let registry = TransferRegistry::new();
        registry.insert_transfer(transfer(PATH, TransferDirection::Sending));

        let mut progress = status_update("active");
        progress.insert("Transferred".into(), value(2048u64));
        registry.merge(PATH, &progress);

        registry.merge(PATH, &status_update("suspended"));
        let resumed = registry.merge(PATH, &status_update("active")).expect("tracked");

        assert_eq!(resumed.status, TransferStatus::Active);
        assert_eq!(resumed.transferred, 2048);
    }

    #[test]
    fn unknown_status_strings_leave_state_untouched() {
        let registry = TransferRegistry::new();
        registry.insert_transfer(transfer(PATH, TransferDirection::Sending));

        let merged = registry.merge(PATH, &status_update("warp-speed")).expect("tracked");
        assert_eq!(merged.status, TransferStatus::Queued);
    }

    #[test]
    fn release_happens_exactly_once() {
        let registry = TransferRegistry::new();
        registry.insert_transfer(transfer(PATH, TransferDirection::Sending));

        assert!(registry.begin_watch(PATH));
        assert!(!registry.begin_watch(PATH));

        assert!(registry.release(PATH));
        assert!(!registry.release(PATH));
        assert!(registry.get(PATH).is_none());
    }

    #[test]
    fn removing_a_session_drops_its_transfers_only() {
        let registry = TransferRegistry::new();
        let mut other = transfer("/org/bluez/obex/client/session1/transfer0", TransferDirection::Sending);
        other.session = "/org/bluez/obex/client/session1".to_owned();

        registry.insert_transfer(transfer(PATH, TransferDirection::Sending));
        registry.insert_transfer(other.clone());
        registry.remove_session("/org/bluez/obex/client/session0");

        assert!(registry.get(PATH).is_none());
        assert!(registry.get(&other.path).is_some());
    }
}
