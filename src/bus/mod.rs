// boltd - Thunderbolt/USB4 device authorization daemon
//
// The exported-object framework: the bus-facing half of spec.md §4.10,
// built on `zbus`. `zbus::interface` supplies the declarative method/
// property surface the original's own reflection layer provided by hand;
// what's left to build here is the two-phase dispatch (authorize, then
// handle), wire-type conversion, and property-change coalescing.

pub mod coalesce;
pub mod device_iface;
pub mod domain_iface;
pub mod manager_iface;
pub mod policy;
pub mod wire;

pub const BUS_NAME: &str = "org.freedesktop.bolt";
pub const MANAGER_PATH: &str = "/org/freedesktop/bolt";
pub const DEVICES_PATH_PREFIX: &str = "/org/freedesktop/bolt/devices";
pub const DOMAINS_PATH_PREFIX: &str = "/org/freedesktop/bolt/domains";

pub fn device_object_path(uid: &crate::types::Uid) -> zbus::zvariant::OwnedObjectPath {
    zbus::zvariant::ObjectPath::try_from(format!(
        "{DEVICES_PATH_PREFIX}/{}",
        uid.object_path_segment()
    ))
    .expect("uid-derived object path segment is always valid")
    .into()
}

pub fn domain_object_path(id: &str) -> zbus::zvariant::OwnedObjectPath {
    zbus::zvariant::ObjectPath::try_from(format!("{DOMAINS_PATH_PREFIX}/{id}"))
        .expect("domain id is always a valid object path segment")
        .into()
}
