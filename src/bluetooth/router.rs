use std::collections::HashMap;

use tracing::{debug, warn};

use crate::bluetooth::entity::{Adapter, Device, MediaState, PropMap};
use crate::bluetooth::store::Store;

pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub const BATTERY_INTERFACE: &str = "org.bluez.Battery1";
pub const MEDIA_PLAYER_INTERFACE: &str = "org.bluez.MediaPlayer1";

/// A decoded broadcast notification, detached from its wire form.
#[derive(Debug)]
pub enum Notification {
    /// A subset of one entity's properties changed.
    PropertiesChanged {
        interface: String,
        path: String,
        changed: PropMap,
    },
    /// One or more interfaces appeared at a path. A device and a
    /// co-located battery reading both contribute to the same record.
    InterfacesAdded {
        path: String,
        interfaces: HashMap<String, PropMap>,
    },
    /// Interfaces disappeared from a path.
    InterfacesRemoved {
        path: String,
        interfaces: Vec<String>,
    },
}

/// The domain event produced by one dispatch, for incremental refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    AdapterChanged(Adapter),
    AdapterRemoved(String),
    /// The removed adapter was the current one. Reselection is the
    /// caller's decision; the router never picks a replacement.
    CurrentAdapterRemoved(String),
    DeviceChanged(Device),
    DevicesAdded(Vec<Device>),
    DeviceRemoved(String),
    MediaChanged(MediaState),
    NoOp,
}

/// Applies one notification to the store and reports what changed.
///
/// Notifications for untracked paths and unrecognized interface kinds
/// resolve to [`Event::NoOp`]; nothing here may interrupt the
/// listening loop.
pub fn dispatch(store: &Store, notification: Notification) -> Event {
    match notification {
        Notification::PropertiesChanged {
            interface,
            path,
            changed,
        } => properties_changed(store, &interface, &path, &changed),
        Notification::InterfacesAdded { path, interfaces } => {
            interfaces_added(store, &path, interfaces)
        }
        Notification::InterfacesRemoved { path, interfaces } => {
            interfaces_removed(store, &path, &interfaces)
        }
    }
}

fn properties_changed(store: &Store, interface: &str, path: &str, changed: &PropMap) -> Event {
    match interface {
        ADAPTER_INTERFACE => match store.with_adapter_mut(path, |a| a.merge(changed)) {
            Some(adapter) => Event::AdapterChanged(adapter),
            None => stale(path),
        },
        DEVICE_INTERFACE => match store.with_device_mut(path, |d| d.merge(changed)) {
            Some(device) => Event::DeviceChanged(device),
            None => stale(path),
        },
        BATTERY_INTERFACE => match store.with_device_mut(path, |d| d.merge_battery(changed)) {
            Some(device) => Event::DeviceChanged(device),
            None => stale(path),
        },
        MEDIA_PLAYER_INTERFACE => Event::MediaChanged(MediaState::decode(changed)),
        _ => Event::NoOp,
    }
}

fn interfaces_added(store: &Store, path: &str, interfaces: HashMap<String, PropMap>) -> Event {
    if let Some(props) = interfaces.get(ADAPTER_INTERFACE) {
        return match Adapter::decode(path, props) {
            Ok(adapter) => {
                store.upsert_adapter(adapter.clone());
                Event::AdapterChanged(adapter)
            }
            Err(e) => {
                warn!(error = %e, "Skipping undecodable adapter");
                Event::NoOp
            }
        };
    }

    if let Some(props) = interfaces.get(DEVICE_INTERFACE) {
        return match Device::decode(path, props) {
            Ok(mut device) => {
                if let Some(battery) = interfaces.get(BATTERY_INTERFACE) {
                    device.merge_battery(battery);
                }
                store.upsert_device(device.clone());
                Event::DevicesAdded(vec![device])
            }
            Err(e) => {
                warn!(error = %e, "Skipping undecodable device");
                Event::NoOp
            }
        };
    }

    if let Some(props) = interfaces.get(BATTERY_INTERFACE) {
        return match store.with_device_mut(path, |d| d.merge_battery(props)) {
            Some(device) => Event::DeviceChanged(device),
            None => stale(path),
        };
    }

    Event::NoOp
}

fn interfaces_removed(store: &Store, path: &str, interfaces: &[String]) -> Event {
    for interface in interfaces {
        match interface.as_str() {
            ADAPTER_INTERFACE => {
                let (removed, was_current) = store.remove_adapter(path);
                if !removed {
                    return stale(path);
                }
                return if was_current {
                    Event::CurrentAdapterRemoved(path.to_owned())
                } else {
                    Event::AdapterRemoved(path.to_owned())
                };
            }
            DEVICE_INTERFACE => {
                if !store.remove_device(path) {
                    return stale(path);
                }
                return Event::DeviceRemoved(path.to_owned());
            }
            BATTERY_INTERFACE => {
                // The reading is gone, not the device.
                if let Some(device) = store.with_device_mut(path, |d| d.battery = 0) {
                    return Event::DeviceChanged(device);
                }
            }
            _ => {}
        }
    }

    Event::NoOp
}

fn stale(path: &str) -> Event {
    debug!(path, "Dropping notification for untracked path");
    Event::NoOp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::entity::PropMap;
    use zbus::zvariant::{OwnedValue, Value};

    fn value(v: impl Into<Value<'static>>) -> OwnedValue {
        Value::try_to_owned(&v.into()).expect("owned value")
    }

    fn adapter_props(address: &str, powered: bool) -> PropMap {
        let mut props = PropMap::new();
        props.insert("Address".into(), value(address.to_owned()));
        props.insert("Powered".into(), value(powered));
        props
    }

    fn device_props(address: &str, adapter: &str, paired: bool) -> PropMap {
        let mut props = PropMap::new();
        props.insert("Address".into(), value(address.to_owned()));
        props.insert(
            "Adapter".into(),
            value(zbus::zvariant::ObjectPath::try_from(adapter.to_owned()).expect("path")),
        );
        props.insert("Paired".into(), value(paired));
        props
    }

    fn added(path: &str, interface: &str, props: PropMap) -> Notification {
        Notification::InterfacesAdded {
            path: path.to_owned(),
            interfaces: HashMap::from([(interface.to_owned(), props)]),
        }
    }

    fn removed(path: &str, interface: &str) -> Notification {
        Notification::InterfacesRemoved {
            path: path.to_owned(),
            interfaces: vec![interface.to_owned()],
        }
    }

    fn changed(path: &str, interface: &str, props: PropMap) -> Notification {
        Notification::PropertiesChanged {
            interface: interface.to_owned(),
            path: path.to_owned(),
            changed: props,
        }
    }

    const HCI0: &str = "/org/bluez/hci0";
    const DEV1: &str = "/org/bluez/hci0/dev_1";
    const DEV2: &str = "/org/bluez/hci0/dev_2";

    #[test]
    fn replayed_events_converge_with_a_bulk_built_store() {
        // Build one store from a replay and one directly.
        let replayed = Store::new();
        dispatch(
            &replayed,
            added(HCI0, ADAPTER_INTERFACE, adapter_props("00:00:00:00:00:01", false)),
        );
        dispatch(
            &replayed,
            added(DEV1, DEVICE_INTERFACE, device_props("AA:00:00:00:00:01", HCI0, false)),
        );
        dispatch(
            &replayed,
            changed(HCI0, ADAPTER_INTERFACE, {
                let mut p = PropMap::new();
                p.insert("Powered".into(), value(true));
                p
            }),
        );
        dispatch(
            &replayed,
            added(DEV2, DEVICE_INTERFACE, device_props("AA:00:00:00:00:02", HCI0, true)),
        );
        dispatch(&replayed, removed(DEV1, DEVICE_INTERFACE));

        let direct = Store::new();
        direct.upsert_adapter(
            Adapter::decode(HCI0, &adapter_props("00:00:00:00:00:01", true)).expect("adapter"),
        );
        direct.upsert_device(
            Device::decode(DEV2, &device_props("AA:00:00:00:00:02", HCI0, true)).expect("device"),
        );

        assert_eq!(replayed.list_adapters(), direct.list_adapters());
        assert_eq!(replayed.list_devices(HCI0), direct.list_devices(HCI0));
    }

    #[test]
    fn scenario_pairing_then_adding_keeps_listing_order() {
        let store = Store::new();
        dispatch(
            &store,
            added(HCI0, ADAPTER_INTERFACE, adapter_props("00:00:00:00:00:01", true)),
        );
        dispatch(
            &store,
            added(DEV1, DEVICE_INTERFACE, device_props("AA:00:00:00:00:01", HCI0, false)),
        );
        assert_eq!(store.list_devices(HCI0).len(), 1);

        let mut paired = PropMap::new();
        paired.insert("Paired".into(), value(true));
        let event = dispatch(&store, changed(DEV1, DEVICE_INTERFACE, paired));
        assert!(matches!(event, Event::DeviceChanged(ref d) if d.paired));

        dispatch(
            &store,
            added(DEV2, DEVICE_INTERFACE, device_props("AA:00:00:00:00:02", HCI0, false)),
        );

        let listed: Vec<String> = store.list_devices(HCI0).into_iter().map(|d| d.path).collect();
        assert_eq!(listed, vec![DEV1.to_owned(), DEV2.to_owned()]);
    }

    #[test]
    fn change_for_untracked_path_is_dropped() {
        let store = Store::new();
        let mut props = PropMap::new();
        props.insert("Connected".into(), value(true));

        let event = dispatch(&store, changed(DEV1, DEVICE_INTERFACE, props));
        assert_eq!(event, Event::NoOp);
        assert!(store.get_device(DEV1).is_none());
    }

    #[test]
    fn unknown_interface_is_a_noop() {
        let store = Store::new();
        let event = dispatch(
            &store,
            changed(DEV1, "org.bluez.GattService1", PropMap::new()),
        );
        assert_eq!(event, Event::NoOp);
    }

    #[test]
    fn undecodable_device_is_skipped_without_insert() {
        let store = Store::new();
        let event = dispatch(&store, added(DEV1, DEVICE_INTERFACE, PropMap::new()));
        assert_eq!(event, Event::NoOp);
        assert!(store.get_device(DEV1).is_none());
    }

    #[test]
    fn removing_the_current_adapter_is_a_distinct_event() {
        let store = Store::new();
        dispatch(
            &store,
            added(HCI0, ADAPTER_INTERFACE, adapter_props("00:00:00:00:00:01", true)),
        );
        store.select_adapter(None).expect("select");

        let event = dispatch(&store, removed(HCI0, ADAPTER_INTERFACE));
        assert_eq!(event, Event::CurrentAdapterRemoved(HCI0.to_owned()));
        assert!(store.current_adapter().is_none());
    }

    #[test]
    fn battery_interface_merges_into_the_device() {
        let store = Store::new();
        dispatch(
            &store,
            added(HCI0, ADAPTER_INTERFACE, adapter_props("00:00:00:00:00:01", true)),
        );

        let mut interfaces = HashMap::new();
        interfaces.insert(
            DEVICE_INTERFACE.to_owned(),
            device_props("AA:00:00:00:00:01", HCI0, true),
        );
        let mut battery = PropMap::new();
        battery.insert("Percentage".into(), value(80u8));
        interfaces.insert(BATTERY_INTERFACE.to_owned(), battery);

        let event = dispatch(
            &store,
            Notification::InterfacesAdded {
                path: DEV1.to_owned(),
                interfaces,
            },
        );
        assert!(matches!(event, Event::DevicesAdded(ref devices) if devices[0].battery == 80));

        // Losing the battery interface resets the reading only.
        let event = dispatch(&store, removed(DEV1, BATTERY_INTERFACE));
        assert!(matches!(event, Event::DeviceChanged(ref d) if d.battery == 0));
        assert!(store.get_device(DEV1).is_some());
    }
}
