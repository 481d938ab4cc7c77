use parking_lot::Mutex;
use tracing::debug;

use crate::bluetooth::entity::{Adapter, Device};
use crate::error::{Error, Result};

/// Concurrency-safe cache of adapters and their devices.
///
/// Entities are kept in insertion order, keyed by object path. All
/// reads and writes go through one cache-wide lock, so a reader never
/// observes a half-updated record. The current adapter is held as an
/// owned path and resolved against the cache on read, never as a copy
/// that could silently diverge.
#[derive(Debug, Default)]
pub struct Store {
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    adapters: Vec<Adapter>,
    devices: Vec<Device>,
    current_adapter: Option<String>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all cached entities and the current-adapter selection.
    /// Used before re-populating from a bulk snapshot.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.adapters.clear();
        inner.devices.clear();
        inner.current_adapter = None;
    }

    /// Returns the currently selected adapter, if any.
    pub fn current_adapter(&self) -> Option<Adapter> {
        let inner = self.inner.lock();
        let path = inner.current_adapter.as_deref()?;
        inner.adapters.iter().find(|a| a.path == path).cloned()
    }

    /// Selects `path` as the current adapter, or, when `path` is
    /// `None`, the adapter with the lexicographically smallest path so
    /// the choice is stable across runs.
    ///
    /// # Errors
    /// - [`Error::NoAdapters`] if the cache holds no adapters.
    pub fn select_adapter(&self, path: Option<&str>) -> Result<Adapter> {
        let mut inner = self.inner.lock();

        let selected = match path {
            Some(path) => inner.adapters.iter().find(|a| a.path == path),
            None => inner.adapters.iter().min_by(|a, b| a.path.cmp(&b.path)),
        }
        .cloned()
        .ok_or(Error::NoAdapters)?;

        debug!(adapter = %selected.path, "Selected current adapter");
        inner.current_adapter = Some(selected.path.clone());

        Ok(selected)
    }

    pub fn list_adapters(&self) -> Vec<Adapter> {
        self.inner.lock().adapters.clone()
    }

    pub fn get_adapter(&self, path: &str) -> Option<Adapter> {
        let inner = self.inner.lock();
        inner.adapters.iter().find(|a| a.path == path).cloned()
    }

    /// Lists the devices belonging to `adapter_path`, with paired,
    /// trusted or blocked devices before all others. Relative insertion
    /// order is preserved within each of the two groups; the front end
    /// relies on this ordering being exact.
    pub fn list_devices(&self, adapter_path: &str) -> Vec<Device> {
        let inner = self.inner.lock();

        if !inner.adapters.iter().any(|a| a.path == adapter_path) {
            return Vec::new();
        }

        let (mut flagged, plain): (Vec<Device>, Vec<Device>) = inner
            .devices
            .iter()
            .filter(|d| d.adapter == adapter_path)
            .cloned()
            .partition(Device::is_flagged);

        flagged.extend(plain);
        flagged
    }

    pub fn get_device(&self, path: &str) -> Option<Device> {
        let inner = self.inner.lock();
        inner.devices.iter().find(|d| d.path == path).cloned()
    }

    /// Inserts the adapter, or replaces the entry sharing its path.
    pub fn upsert_adapter(&self, adapter: Adapter) {
        let mut inner = self.inner.lock();
        match inner.adapters.iter_mut().find(|a| a.path == adapter.path) {
            Some(existing) => *existing = adapter,
            None => inner.adapters.push(adapter),
        }
    }

    /// Inserts the device, or replaces the entry sharing its path. A
    /// device whose adapter is not cached is still stored; it simply
    /// never shows up in a per-adapter listing until its adapter does.
    pub fn upsert_device(&self, device: Device) {
        let mut inner = self.inner.lock();
        match inner.devices.iter_mut().find(|d| d.path == device.path) {
            Some(existing) => *existing = device,
            None => inner.devices.push(device),
        }
    }

    /// Runs `apply` on the adapter at `path` under the cache lock and
    /// returns the updated record. Returns `None` without calling
    /// `apply` when the adapter is not tracked.
    pub fn with_adapter_mut(
        &self,
        path: &str,
        apply: impl FnOnce(&mut Adapter),
    ) -> Option<Adapter> {
        let mut inner = self.inner.lock();
        let adapter = inner.adapters.iter_mut().find(|a| a.path == path)?;
        apply(adapter);
        Some(adapter.clone())
    }

    /// Runs `apply` on the device at `path` under the cache lock and
    /// returns the updated record. Returns `None` without calling
    /// `apply` when the device is not tracked.
    pub fn with_device_mut(&self, path: &str, apply: impl FnOnce(&mut Device)) -> Option<Device> {
        let mut inner = self.inner.lock();
        let device = inner.devices.iter_mut().find(|d| d.path == path)?;
        apply(device);
        Some(device.clone())
    }

    /// Removes the adapter at `path` and every device whose adapter
    /// field equals that path, and only those. Returns `(removed,
    /// was_current)`; a removed current adapter also clears the
    /// selection, leaving reselection to the caller.
    pub fn remove_adapter(&self, path: &str) -> (bool, bool) {
        let mut inner = self.inner.lock();

        let before = inner.adapters.len();
        inner.adapters.retain(|a| a.path != path);
        let removed = inner.adapters.len() != before;
        if !removed {
            return (false, false);
        }

        inner.devices.retain(|d| d.adapter != path);

        let was_current = inner.current_adapter.as_deref() == Some(path);
        if was_current {
            inner.current_adapter = None;
        }

        (true, was_current)
    }

    /// Removes the device at `path`. Returns whether it was tracked.
    pub fn remove_device(&self, path: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.devices.len();
        inner.devices.retain(|d| d.path != path);
        inner.devices.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(path: &str) -> Adapter {
        Adapter {
            path: path.to_owned(),
            address: "00:11:22:33:44:55".to_owned(),
            ..Adapter::default()
        }
    }

    fn device(path: &str, adapter: &str) -> Device {
        Device {
            path: path.to_owned(),
            adapter: adapter.to_owned(),
            address: "AA:BB:CC:DD:EE:FF".to_owned(),
            ..Device::default()
        }
    }

    #[test]
    fn select_without_argument_is_deterministic() {
        let store = Store::new();
        store.upsert_adapter(adapter("/org/bluez/hci1"));
        store.upsert_adapter(adapter("/org/bluez/hci0"));

        let selected = store.select_adapter(None).expect("select");
        assert_eq!(selected.path, "/org/bluez/hci0");
        assert_eq!(store.current_adapter().expect("current").path, selected.path);
    }

    #[test]
    fn select_on_empty_cache_fails() {
        let store = Store::new();
        assert!(matches!(store.select_adapter(None), Err(Error::NoAdapters)));
        assert!(store.current_adapter().is_none());
    }

    #[test]
    fn current_adapter_reflects_later_mutation() {
        let store = Store::new();
        store.upsert_adapter(adapter("/org/bluez/hci0"));
        store.select_adapter(None).expect("select");

        store.with_adapter_mut("/org/bluez/hci0", |a| a.powered = true);
        assert!(store.current_adapter().expect("current").powered);
    }

    #[test]
    fn flagged_devices_precede_plain_devices_in_insertion_order() {
        let store = Store::new();
        store.upsert_adapter(adapter("/org/bluez/hci0"));

        let mut paired = device("/org/bluez/hci0/dev_1", "/org/bluez/hci0");
        paired.paired = true;
        let plain_a = device("/org/bluez/hci0/dev_2", "/org/bluez/hci0");
        let mut trusted = device("/org/bluez/hci0/dev_3", "/org/bluez/hci0");
        trusted.trusted = true;
        let plain_b = device("/org/bluez/hci0/dev_4", "/org/bluez/hci0");

        for d in [plain_a, paired, plain_b, trusted] {
            store.upsert_device(d);
        }

        let listed: Vec<String> = store
            .list_devices("/org/bluez/hci0")
            .into_iter()
            .map(|d| d.path)
            .collect();
        assert_eq!(
            listed,
            vec![
                "/org/bluez/hci0/dev_1",
                "/org/bluez/hci0/dev_3",
                "/org/bluez/hci0/dev_2",
                "/org/bluez/hci0/dev_4",
            ]
        );
    }

    #[test]
    fn promoting_a_device_keeps_its_listing_position() {
        let store = Store::new();
        store.upsert_adapter(adapter("/org/bluez/hci0"));

        let mut first = device("/org/bluez/hci0/dev_1", "/org/bluez/hci0");
        first.paired = false;
        store.upsert_device(first);

        let listed = store.list_devices("/org/bluez/hci0");
        assert_eq!(listed.len(), 1);

        store.with_device_mut("/org/bluez/hci0/dev_1", |d| d.paired = true);
        store.upsert_device(device("/org/bluez/hci0/dev_2", "/org/bluez/hci0"));

        let listed: Vec<String> = store
            .list_devices("/org/bluez/hci0")
            .into_iter()
            .map(|d| d.path)
            .collect();
        assert_eq!(listed, vec!["/org/bluez/hci0/dev_1", "/org/bluez/hci0/dev_2"]);
        assert!(
            store
                .get_device("/org/bluez/hci0/dev_1")
                .expect("device")
                .paired
        );
    }

    #[test]
    fn removing_an_adapter_cascades_to_exactly_its_devices() {
        let store = Store::new();
        store.upsert_adapter(adapter("/org/bluez/hci0"));
        store.upsert_adapter(adapter("/org/bluez/hci1"));
        store.upsert_device(device("/org/bluez/hci0/dev_1", "/org/bluez/hci0"));
        store.upsert_device(device("/org/bluez/hci1/dev_2", "/org/bluez/hci1"));

        let (removed, was_current) = store.remove_adapter("/org/bluez/hci0");
        assert!(removed);
        assert!(!was_current);

        assert!(store.get_device("/org/bluez/hci0/dev_1").is_none());
        assert!(store.get_device("/org/bluez/hci1/dev_2").is_some());
    }

    #[test]
    fn removing_the_current_adapter_clears_the_selection() {
        let store = Store::new();
        store.upsert_adapter(adapter("/org/bluez/hci0"));
        store.select_adapter(None).expect("select");

        let (removed, was_current) = store.remove_adapter("/org/bluez/hci0");
        assert!(removed && was_current);
        assert!(store.current_adapter().is_none());
    }

    #[test]
    fn orphan_devices_are_stored_but_not_listed() {
        let store = Store::new();
        store.upsert_device(device("/org/bluez/hci9/dev_1", "/org/bluez/hci9"));

        assert!(store.get_device("/org/bluez/hci9/dev_1").is_some());
        assert!(store.list_devices("/org/bluez/hci9").is_empty());

        store.upsert_adapter(adapter("/org/bluez/hci9"));
        assert_eq!(store.list_devices("/org/bluez/hci9").len(), 1);
    }
}
