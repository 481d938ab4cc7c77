pub mod entity;
pub mod observer;
pub mod proxy;
pub mod router;
pub mod store;

pub use entity::{Adapter, Device, DeviceKind, MediaState, TrackInfo};
pub use observer::BluetoothObserver;
pub use proxy::BluezProxy;
pub use router::{Event, Notification};
pub use store::Store;
