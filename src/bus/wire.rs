// boltd - Thunderbolt/USB4 device authorization daemon
//
// Wire-type conversions for the exported-object framework: the
// `WireConv` enum/nick and structured-type mappings of spec.md §4.10,
// plus the `Error` -> `zbus::fdo::Error` namespace-prefixed conversion of
// spec.md §7 "User-visible failure". Kept out of `error.rs` so that core
// type stays free of D-Bus concerns, the same way the teacher's
// `Kind`/`SecurityLevel` `Display` impls never touch CLI or JSON concerns.

use std::collections::HashMap;

use crate::error::Error;
use crate::sysfs::LinkSpeed;

const ERROR_NAMESPACE: &str = "org.freedesktop.bolt.Error";

/// Maps a daemon [`Error`] to a `zbus` method-reply error, namespacing the
/// short wire-visible kind name (e.g. `bad_state` -> `...Error.BadState`).
pub fn to_fdo_error(err: &Error) -> zbus::fdo::Error {
    let name = format!("{ERROR_NAMESPACE}.{}", to_camel(err.kind()));
    zbus::fdo::Error::Failed(format!("{name}: {err}"))
}

fn to_camel(kind: &str) -> String {
    kind.split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// `LinkSpeed` <-> the `a{su}` dictionary the Device interface's
/// `LinkSpeed` property uses on the wire: `rx.speed`, `rx.lanes`,
/// `tx.speed`, `tx.lanes`, each present only if known.
pub fn link_speed_to_dict(speed: &LinkSpeed) -> HashMap<String, u32> {
    let mut dict = HashMap::new();
    if let Some(v) = speed.rx.speed {
        dict.insert("rx.speed".to_string(), v);
    }
    if let Some(v) = speed.rx.lanes {
        dict.insert("rx.lanes".to_string(), v);
    }
    if let Some(v) = speed.tx.speed {
        dict.insert("tx.speed".to_string(), v);
    }
    if let Some(v) = speed.tx.lanes {
        dict.insert("tx.lanes".to_string(), v);
    }
    dict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::LinkSide;
    use crate::types::Uid;

    #[test]
    fn error_kind_is_namespaced_and_camel_cased() {
        let err = Error::BadState {
            uid: Uid::new("uid-a"),
            state: "authorizing",
        };
        let fdo = to_fdo_error(&err);
        let zbus::fdo::Error::Failed(msg) = fdo else {
            panic!("expected Failed variant");
        };
        assert!(msg.starts_with("org.freedesktop.bolt.Error.BadState:"));
    }

    #[test]
    fn link_speed_dict_omits_unknown_sides() {
        let speed = LinkSpeed {
            rx: LinkSide { speed: Some(20), lanes: Some(2) },
            tx: LinkSide::default(),
        };
        let dict = link_speed_to_dict(&speed);
        assert_eq!(dict.get("rx.speed"), Some(&20));
        assert_eq!(dict.get("rx.lanes"), Some(&2));
        assert!(!dict.contains_key("tx.speed"));
    }
}
