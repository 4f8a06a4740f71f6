// boltd - Thunderbolt/USB4 device authorization daemon
//
// End-to-end flows through `Manager`, driven by a `ScriptedEventSource`
// and `FakeAuthBackend` instead of a real kernel. Complements the
// smaller-grained unit tests inside `manager.rs` itself.

use std::path::PathBuf;
use std::sync::Arc;

use boltd::auth::FakeAuthBackend;
use boltd::config::Config;
use boltd::events::ScriptedEventSource;
use boltd::journal::Journal;
use boltd::manager::{Manager, Notification};
use boltd::power::Power;
use boltd::store::Store;
use boltd::sysfs::DeviceSnapshot;
use boltd::types::{AuthFlags, KeyState, Policy, SecurityLevel, Uid};
use boltd::udev_events::{Action, Event};

fn domain_snapshot(id: &str, security: SecurityLevel) -> DeviceSnapshot {
    DeviceSnapshot {
        syspath: PathBuf::from(format!("/sys/bus/thunderbolt/devices/{id}")),
        is_domain: true,
        uid: Some(Uid::new(format!("{id}-uid"))),
        name: None,
        vendor: None,
        authorized_state: None,
        key_state: KeyState::Missing,
        security,
        boot_acl: Some(vec![None, None]),
        iommu: false,
        domain_sort_key: Some(0),
        link_speed: None,
        parent_domain_sysname: None,
    }
}

fn device_snapshot(uid: &str, domain_id: &str, authorized_state: u8) -> DeviceSnapshot {
    DeviceSnapshot {
        syspath: PathBuf::from(format!("/sys/bus/thunderbolt/devices/{domain_id}-1")),
        is_domain: false,
        uid: Some(Uid::new(uid)),
        name: Some("Dock".into()),
        vendor: Some("Acme".into()),
        authorized_state: Some(authorized_state),
        key_state: KeyState::Missing,
        security: SecurityLevel::Unknown,
        boot_acl: None,
        iommu: false,
        domain_sort_key: None,
        link_speed: None,
        parent_domain_sysname: Some(domain_id.to_string()),
    }
}

fn now() -> std::time::Duration {
    std::time::Duration::from_micros(boltd::util::now_usec())
}

fn manager_with(events: ScriptedEventSource) -> (tempfile::TempDir, Manager) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("store")).unwrap();
    let journal = Journal::open(dir.path().join("journal")).unwrap();
    let power = Power::new(dir.path().join("force_power"), dir.path().join("guards"));
    let config = Config::default();
    let manager = Manager::start(store, journal, power, config, &events, Arc::new(FakeAuthBackend)).unwrap();
    (dir, manager)
}

#[tokio::test]
async fn secure_authorize_persists_a_freshly_generated_key() {
    let enumeration = vec![
        Event { action: Action::Add, device: domain_snapshot("domain0", SecurityLevel::Secure) },
        Event { action: Action::Add, device: device_snapshot("dev-a", "domain0", 0) },
    ];
    let events = ScriptedEventSource::new(enumeration, vec![]);
    let (_dir, mut manager) = manager_with(events);

    manager.authorize("dev-a", AuthFlags::SECURE).await.unwrap();

    let device = manager.get_device(&Uid::new("dev-a")).unwrap();
    assert!(device.status.is_authorized());
    assert_eq!(device.keystate, KeyState::New);
}

#[tokio::test]
async fn disconnect_then_reconnect_of_a_stored_device_keeps_its_policy() {
    let enumeration = vec![
        Event { action: Action::Add, device: domain_snapshot("domain0", SecurityLevel::Secure) },
        Event { action: Action::Add, device: device_snapshot("dev-a", "domain0", 0) },
    ];
    let events = ScriptedEventSource::new(enumeration, vec![]);
    let (_dir, mut manager) = manager_with(events);

    manager.enroll_device("dev-a", Policy::Auto, AuthFlags::empty()).await.unwrap();
    assert!(manager.get_device(&Uid::new("dev-a")).unwrap().stored);

    manager
        .apply_event(
            Event { action: Action::Remove, device: device_snapshot("dev-a", "domain0", 0) },
            now(),
        )
        .unwrap();
    let disconnected = manager.get_device(&Uid::new("dev-a")).unwrap();
    assert!(disconnected.stored);
    assert!(!disconnected.is_connected());

    let notifications = manager
        .apply_event(
            Event { action: Action::Add, device: device_snapshot("dev-a", "domain0", 0) },
            now(),
        )
        .unwrap();
    let reconnected = manager.get_device(&Uid::new("dev-a")).unwrap();
    assert!(reconnected.stored);
    assert_eq!(reconnected.policy, Policy::Auto);
    assert!(notifications.contains(&Notification::AutoAuthorize(Uid::new("dev-a"))));

    manager.authorize("dev-a", AuthFlags::SECURE).await.unwrap();
    let authorized = manager.get_device(&Uid::new("dev-a")).unwrap();
    assert!(authorized.status.is_authorized());
    assert_eq!(authorized.keystate, KeyState::New);
}

#[tokio::test]
async fn domain_boot_acl_is_reconciled_from_the_kernel_snapshot() {
    let mut domain = domain_snapshot("domain0", SecurityLevel::User);
    domain.boot_acl = Some(vec![Some(Uid::new("dev-a")), None]);
    let events = ScriptedEventSource::new(vec![Event { action: Action::Add, device: domain }], vec![]);
    let (_dir, manager) = manager_with(events);

    let acl = manager.domain_bootacl("domain0");
    assert_eq!(acl, vec![Some(Uid::new("dev-a")), None]);
}

#[test]
fn domain_removal_drops_its_boot_acl() {
    let enumeration = vec![Event { action: Action::Add, device: domain_snapshot("domain0", SecurityLevel::User) }];
    let events = ScriptedEventSource::new(enumeration, vec![]);
    let (_dir, mut manager) = manager_with(events);
    assert!(manager.get_domain("domain0").is_some());

    manager
        .apply_event(
            Event { action: Action::Remove, device: domain_snapshot("domain0", SecurityLevel::User) },
            now(),
        )
        .unwrap();

    assert!(manager.get_domain("domain0").is_none());
    assert!(manager.domain_bootacl("domain0").is_empty());
}
