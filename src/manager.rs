// boltd - Thunderbolt/USB4 device authorization daemon
//
// The central actor: owns every piece of daemon state behind one
// `tokio::sync::Mutex` (see spec.md §4.11 and §5's "single `Mutex` already
// serializes all state mutation"). `bus::manager_iface`/`device_iface`/
// `domain_iface` are thin adapters over these methods; the hotplug event
// loop and periodic reaper tick live in `bin/boltd.rs` and call back in
// here with already-received events so the lock is never held across an
// indefinite `.await` on the next kernel event.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::auth::{AuthBackend, AuthRequest, AuthTask};
use crate::config::Config;
use crate::device::{Device, DeviceEvent};
use crate::domain::{Domain, Domains};
use crate::error::{Error, Result};
use crate::guard::Guard;
use crate::journal::{Journal, Op};
use crate::key::Key;
use crate::power::Power;
use crate::reaper::Reaper;
use crate::store::Store;
use crate::sysfs::DeviceSnapshot;
use crate::types::{AuthFlags, KeyState, Policy, SecurityLevel, Status, Uid};
use crate::udev_events::{Action, Event};

/// A state change callers should reflect on the bus: export/unexport an
/// object, or re-emit its changed properties via a [`crate::bus::coalesce::Coalescer`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Notification {
    DeviceAdded(Uid),
    DeviceChanged(Uid),
    DeviceRemoved(Uid),
    DomainAdded(String),
    DomainChanged(String),
    DomainRemoved(String),
    /// A `policy = auto` device just reached `connected` on add/reconnect
    /// and should be authorized at the strongest supported level without
    /// waiting for a client to call `Authorize` (spec.md §3 "authorize on
    /// sight"). Carries no status change of its own; the caller is
    /// expected to call `Manager::authorize` and then reflect the
    /// resulting `DeviceChanged`.
    AutoAuthorize(Uid),
}

pub struct Manager {
    store: Store,
    journal: Journal,
    power: Power,
    config: Config,
    domains: Domains,
    bootacls: HashMap<String, Vec<Option<Uid>>>,
    devices: HashMap<Uid, Device>,
    auth_backend: Arc<dyn AuthBackend>,
    reaper: Reaper,
    guards: HashMap<String, Guard>,
    probing: bool,
}

fn now() -> Duration {
    Duration::from_micros(crate::util::now_usec())
}

fn sysname_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl Manager {
    /// Builds a `Manager` from persisted state plus one synchronous
    /// enumeration pass of `events`. Stored devices come back `disconnected`
    /// until the enumeration (or a later hotplug `add`) proves otherwise —
    /// spec.md §4.4's startup reconciliation.
    pub fn start(
        store: Store,
        journal: Journal,
        power: Power,
        config: Config,
        events: &dyn crate::events::EventSource,
        auth_backend: Arc<dyn AuthBackend>,
    ) -> Result<Self> {
        let mut manager = Self {
            store,
            journal,
            power,
            config,
            domains: Domains::new(),
            bootacls: HashMap::new(),
            devices: HashMap::new(),
            auth_backend,
            reaper: Reaper::new(),
            guards: HashMap::new(),
            probing: true,
        };

        for guard in manager.power.recover()? {
            manager.reaper.watch(guard.pid, guard.id.clone());
            manager.guards.insert(guard.id.clone(), guard);
        }

        for uid in manager.store.list_uids()? {
            let stored = manager.store.get_device(&uid)?;
            let mut device = Device::new(stored.uid.clone(), stored.name, stored.vendor);
            device.policy = stored.policy;
            device.label = stored.label;
            device.keystate = manager.store.key_state(&uid);
            device.stored = true;
            manager.devices.insert(uid, device);
        }

        let t0 = now();
        for event in events.enumerate()? {
            manager.apply_event(event, t0)?;
        }

        manager.probing = false;
        Ok(manager)
    }

    /// Applies one already-received hotplug event, mutating device/domain
    /// state and returning the bus-visible effects of doing so.
    pub fn apply_event(&mut self, event: Event, now: Duration) -> Result<Vec<Notification>> {
        if event.device.is_domain {
            self.apply_domain_event(event.action, event.device, now)
        } else {
            self.apply_device_event(event.action, event.device, now)
        }
    }

    fn apply_domain_event(
        &mut self,
        action: Action,
        snapshot: DeviceSnapshot,
        _now: Duration,
    ) -> Result<Vec<Notification>> {
        let id = sysname_of(&snapshot.syspath);

        match action {
            Action::Add => {
                let uid = snapshot.uid.clone().unwrap_or_else(|| Uid::new(id.clone()));
                let bootacl = snapshot
                    .boot_acl
                    .clone()
                    .or_else(|| self.store.get_domain_bootacl(&uid).ok())
                    .unwrap_or_default();

                self.domains.insert(Domain {
                    uid,
                    id: id.clone(),
                    syspath: Some(snapshot.syspath),
                    security: snapshot.security,
                    iommu: snapshot.iommu,
                    sort_key: snapshot.domain_sort_key.unwrap_or(0),
                });
                self.bootacls.insert(id.clone(), bootacl);
                info!(domain = %id, "domain added");
                Ok(vec![Notification::DomainAdded(id)])
            }
            Action::Change => {
                if let Some(domain) = self.domains.find_id(&id) {
                    let uid = domain.uid.clone();
                    if let Some(domain) = self.domains.find_uid_mut(&uid) {
                        domain.security = snapshot.security;
                        domain.iommu = snapshot.iommu;
                    }
                }
                Ok(vec![Notification::DomainChanged(id)])
            }
            Action::Remove => {
                self.domains.remove(&id);
                self.bootacls.remove(&id);
                info!(domain = %id, "domain removed");
                Ok(vec![Notification::DomainRemoved(id)])
            }
        }
    }

    fn apply_device_event(
        &mut self,
        action: Action,
        snapshot: DeviceSnapshot,
        now: Duration,
    ) -> Result<Vec<Notification>> {
        let Some(uid) = snapshot.uid.clone() else {
            warn!(syspath = %snapshot.syspath.display(), "device event with no unique_id, ignoring");
            return Ok(Vec::new());
        };

        match action {
            Action::Add => {
                let device = self
                    .devices
                    .entry(uid.clone())
                    .or_insert_with(|| Device::new(uid.clone(), String::new(), String::new()));
                device.name = snapshot.name.unwrap_or_default();
                device.vendor = snapshot.vendor.unwrap_or_default();
                device.syspath = Some(snapshot.syspath);
                device.domain_id = snapshot.parent_domain_sysname;
                device.linkspeed = snapshot.link_speed;
                if device.keystate == KeyState::Missing {
                    device.keystate = snapshot.key_state;
                }
                device.apply(
                    DeviceEvent::Added {
                        authorized_state: snapshot.authorized_state,
                    },
                    now,
                )?;
                self.journal.put(&uid, Op::Add)?;

                let mut notifications = vec![Notification::DeviceAdded(uid.clone())];
                if device.policy == Policy::Auto
                    && device.status == Status::Connected
                    && self.config.auth_mode == crate::config::AuthMode::Enabled
                {
                    notifications.push(Notification::AutoAuthorize(uid));
                }
                Ok(notifications)
            }
            Action::Change => {
                if let Some(device) = self.devices.get_mut(&uid) {
                    device.linkspeed = snapshot.link_speed;
                    device.apply(
                        DeviceEvent::Changed {
                            authorized_state: snapshot.authorized_state,
                        },
                        now,
                    )?;
                }
                Ok(vec![Notification::DeviceChanged(uid)])
            }
            Action::Remove => {
                match self.devices.get_mut(&uid) {
                    Some(device) if device.stored => {
                        device.apply(DeviceEvent::Removed, now)?;
                        Ok(vec![Notification::DeviceChanged(uid)])
                    }
                    Some(_) => {
                        self.devices.remove(&uid);
                        Ok(vec![Notification::DeviceRemoved(uid)])
                    }
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    /// Authorizes a connected, not-yet-authorized device, negotiating the
    /// requested level down to its domain's security level. Blocks (from
    /// the caller's perspective, i.e. this `await` doesn't return) until
    /// the sysfs write sequence completes — spec.md §5 lists "task
    /// completion" as a suspension point of the same cooperative loop that
    /// serializes every other state mutation via this `Manager`'s lock.
    pub async fn authorize(&mut self, uid: &str, authflags: AuthFlags) -> Result<()> {
        let uid = Uid::new(uid);
        let device = self
            .devices
            .get(&uid)
            .ok_or_else(|| Error::NotFound(uid.to_string()))?;

        if device.status.is_authorized() {
            return Err(Error::BadState {
                uid: uid.clone(),
                state: "already authorized",
            });
        }
        let syspath = device
            .syspath
            .clone()
            .ok_or_else(|| Error::BadState { uid: uid.clone(), state: "disconnected" })?;

        let domain_security = device
            .domain_id
            .as_ref()
            .and_then(|id| self.domains.find_id(id))
            .map(|d| d.security)
            .unwrap_or(SecurityLevel::Unknown);
        let requested = if authflags.contains(AuthFlags::SECURE) {
            SecurityLevel::Secure
        } else {
            SecurityLevel::User
        };
        let level = Device::negotiate_level(requested, domain_security);
        let domain_permits_pcie = !matches!(domain_security, SecurityLevel::DpOnly | SecurityLevel::UsbOnly);

        let key = if level == SecurityLevel::Secure {
            Some(match self.store.get_key(&uid) {
                Ok(key) => key,
                Err(_) => Key::generate()?.0,
            })
        } else {
            None
        };
        let key_hex = key.as_ref().map(Key::to_hex);

        self.devices
            .get_mut(&uid)
            .expect("checked above")
            .apply(DeviceEvent::AuthorizeRequested, now())?;

        let request = AuthRequest {
            uid: uid.clone(),
            level,
            key,
            domain_permits_pcie,
        };

        // spec.md §4.6: force-power is held for the duration of the
        // authorization, not just while a client-held guard says so.
        let power_guard = if self.power.is_supported() {
            self.acquire_power_guard(format!("authorize:{uid}"), std::process::id() as i32)
                .ok()
                .map(|(id, _read_fd, _write_fd)| id)
        } else {
            None
        };

        let task = AuthTask::spawn(request, syspath, self.auth_backend.clone());
        let outcome = task.join().await;
        let applied_at = now();

        if let Some(id) = power_guard {
            if let Err(e) = self.release_power_guard(&id) {
                warn!(error = %e, "failed to release authorization power guard");
            }
        }

        match outcome {
            Ok(outcome) => {
                if outcome.key_was_new {
                    if let Some(hex) = key_hex {
                        let key = Key::from_hex(&uid, &hex)?;
                        self.store.save_key(&uid, &key)?;
                    }
                }
                self.devices
                    .get_mut(&uid)
                    .expect("device still present")
                    .apply(DeviceEvent::AuthorizeSucceeded(outcome), applied_at)?;
                self.journal.put(&uid, Op::Replace)?;
                Ok(())
            }
            Err(e) => {
                if let Some(device) = self.devices.get_mut(&uid) {
                    let _ = device.apply(DeviceEvent::AuthorizeFailed, applied_at);
                }
                Err(e)
            }
        }
    }

    /// Enrolls a currently-connected, not-yet-stored device: persists its
    /// record (and, for `secure`-flagged enrollment, a freshly generated
    /// key) and marks it stored. Does not itself authorize the device.
    pub async fn enroll_device(
        &mut self,
        uid: &str,
        policy: Policy,
        authflags: AuthFlags,
    ) -> Result<Uid> {
        let uid = Uid::new(uid);
        let device = self
            .devices
            .get_mut(&uid)
            .ok_or_else(|| Error::NotFound(uid.to_string()))?;
        if device.stored {
            return Err(Error::Exists(uid.to_string()));
        }

        device.policy = policy;
        device.stored = true;
        device.storetime = Some(now());

        let key = if authflags.contains(AuthFlags::SECURE) {
            Some(Key::generate()?.0)
        } else {
            None
        };

        self.store.put_device(
            &uid,
            &device.name,
            &device.vendor,
            policy,
            device.label.as_deref(),
            key.as_ref(),
        )?;
        self.journal.put(&uid, Op::Add)?;
        Ok(uid)
    }

    /// Forgets a device: deletes its stored record and key. A currently
    /// connected device stays in the in-memory table (now transient, as if
    /// it had never been enrolled); a disconnected one is dropped entirely.
    pub fn forget_device(&mut self, uid: &str) -> Result<()> {
        let uid = Uid::new(uid);
        self.store.delete_device(&uid)?;
        self.store.delete_key(&uid)?;
        self.journal.put(&uid, Op::Remove)?;

        match self.devices.get_mut(&uid) {
            Some(device) if device.is_connected() => {
                device.stored = false;
                device.policy = Policy::Default;
                device.label = None;
            }
            _ => {
                self.devices.remove(&uid);
            }
        }
        Ok(())
    }

    pub fn set_device_label(&mut self, uid: &Uid, label: String) -> Result<()> {
        let device = self
            .devices
            .get_mut(uid)
            .ok_or_else(|| Error::NotFound(uid.to_string()))?;
        device.label = Some(label.clone());
        if device.stored {
            self.store
                .put_device(uid, &device.name, &device.vendor, device.policy, Some(&label), None)?;
        }
        Ok(())
    }

    pub fn set_domain_bootacl(&mut self, id: &str, acl: Vec<String>) -> Result<()> {
        let uid = self
            .domains
            .find_id(id)
            .map(|d| d.uid.clone())
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let slots: Vec<Option<Uid>> = acl
            .into_iter()
            .map(|s| if s.is_empty() { None } else { Some(Uid::new(s)) })
            .collect();
        self.store.put_domain_bootacl(&uid, &slots)?;
        self.bootacls.insert(id.to_string(), slots);
        Ok(())
    }

    /// One periodic tick: reaps dead-PID power guards whose owner never
    /// released their FIFO. See spec.md §4.6; driven by the main loop on a
    /// fixed timer, only while the reaper has anything watched. Each
    /// returned `(pid, guard_id)` pair should be passed to
    /// [`Manager::release_power_guard`] to drop it from the live set and
    /// clean up its state file.
    pub fn tick_reaper(&mut self) -> Vec<(i32, String)> {
        self.reaper.tick()
    }

    /// `true` while at least one power guard is outstanding; the main loop
    /// only needs to keep ticking the reaper while this holds.
    pub fn has_pending_guards(&self) -> bool {
        !self.reaper.is_empty()
    }

    /// Acquires a force-power guard on behalf of `who` (a free-form
    /// requester label, e.g. a bus name), running under `pid`. Watches the
    /// pid for the reaper and tracks the guard by its own id, not the
    /// label, so [`Manager::release_power_guard`] and reaping both
    /// address the same guard unambiguously. Fails if this domain exposes
    /// no `force_power` attribute.
    pub fn acquire_power_guard(
        &mut self,
        who: impl Into<String>,
        pid: i32,
    ) -> Result<(String, tokio::io::unix::AsyncFd<std::fs::File>, std::os::fd::OwnedFd)> {
        let (guard, read_fd, write_fd) = self.power.acquire(who, pid)?;
        let id = guard.id.clone();
        self.reaper.watch(pid, id.clone());
        self.guards.insert(id.clone(), guard);
        Ok((id, read_fd, write_fd))
    }

    /// Releases a guard by id: drops it from `Power`'s live set (de-asserting
    /// force-power once the set empties), unwatches its pid, and unlinks its
    /// state file and FIFO.
    pub fn release_power_guard(&mut self, id: &str) -> Result<()> {
        self.power.release(id)?;
        if let Some(guard) = self.guards.remove(id) {
            self.reaper.unwatch(guard.pid);
            guard.unlink();
        }
        Ok(())
    }

    pub fn get_device(&self, uid: &Uid) -> Option<&Device> {
        self.devices.get(uid)
    }

    pub fn get_domain(&self, id: &str) -> Option<&Domain> {
        self.domains.find_id(id)
    }

    pub fn domain_bootacl(&self, id: &str) -> Vec<Option<Uid>> {
        self.bootacls.get(id).cloned().unwrap_or_default()
    }

    pub fn list_device_uids(&self) -> Vec<Uid> {
        let mut uids: Vec<Uid> = self.devices.keys().cloned().collect();
        uids.sort();
        uids
    }

    pub fn list_domain_ids(&self) -> Vec<String> {
        self.domains.iter().map(|d| d.id.clone()).collect()
    }

    pub fn find_device_uid(&self, uid: &str) -> Option<Uid> {
        self.devices.get(&Uid::new(uid)).map(|d| d.uid.clone())
    }

    pub fn is_probing(&self) -> bool {
        self.probing
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The weakest, i.e. safest to assume, security level across every
    /// known domain. Domains with differing levels are not expected in
    /// practice (a host normally has exactly one root domain per
    /// controller) but the manager's `SecurityLevel` property must report
    /// something even with zero or several domains present.
    pub fn default_domain_security(&self) -> SecurityLevel {
        self.domains
            .iter()
            .map(|d| d.security)
            .fold(SecurityLevel::Unknown, SecurityLevel::min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::FakeAuthBackend;
    use crate::events::ScriptedEventSource;
    use crate::sysfs::DeviceSnapshot;
    use std::path::PathBuf;

    fn manager_with(events: ScriptedEventSource) -> (tempfile::TempDir, Manager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let journal = Journal::open(dir.path().join("journal")).unwrap();
        let power = Power::new(dir.path().join("force_power"), dir.path().join("guards"));
        let config = Config::default();
        let manager = Manager::start(store, journal, power, config, &events, Arc::new(FakeAuthBackend)).unwrap();
        (dir, manager)
    }

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

    #[test]
    fn enumeration_populates_domain_and_device() {
        let enumeration = vec![
            Event { action: Action::Add, device: domain_snapshot("domain0", SecurityLevel::User) },
            Event { action: Action::Add, device: device_snapshot("dev-a", "domain0", 0) },
        ];
        let events = ScriptedEventSource::new(enumeration, vec![]);
        let (_dir, manager) = manager_with(events);

        assert!(manager.get_domain("domain0").is_some());
        assert_eq!(manager.list_device_uids(), vec![Uid::new("dev-a")]);
        assert_eq!(manager.get_device(&Uid::new("dev-a")).unwrap().status, Status::Connected);
    }

    #[tokio::test]
    async fn authorize_connected_device_reaches_authorized() {
        let enumeration = vec![
            Event { action: Action::Add, device: domain_snapshot("domain0", SecurityLevel::User) },
            Event { action: Action::Add, device: device_snapshot("dev-a", "domain0", 0) },
        ];
        let events = ScriptedEventSource::new(enumeration, vec![]);
        let (_dir, mut manager) = manager_with(events);

        manager.authorize("dev-a", AuthFlags::empty()).await.unwrap();
        assert!(manager.get_device(&Uid::new("dev-a")).unwrap().status.is_authorized());
    }

    #[tokio::test]
    async fn authorize_already_authorized_device_is_bad_state() {
        let enumeration = vec![
            Event { action: Action::Add, device: domain_snapshot("domain0", SecurityLevel::User) },
            Event { action: Action::Add, device: device_snapshot("dev-a", "domain0", 1) },
        ];
        let events = ScriptedEventSource::new(enumeration, vec![]);
        let (_dir, mut manager) = manager_with(events);

        let err = manager.authorize("dev-a", AuthFlags::empty()).await.unwrap_err();
        assert!(err.is_bad_state());
    }

    #[tokio::test]
    async fn enroll_then_forget_round_trips_store_state() {
        let enumeration = vec![
            Event { action: Action::Add, device: domain_snapshot("domain0", SecurityLevel::User) },
            Event { action: Action::Add, device: device_snapshot("dev-a", "domain0", 0) },
        ];
        let events = ScriptedEventSource::new(enumeration, vec![]);
        let (_dir, mut manager) = manager_with(events);

        manager.enroll_device("dev-a", Policy::Auto, AuthFlags::empty()).await.unwrap();
        assert!(manager.get_device(&Uid::new("dev-a")).unwrap().stored);

        manager.forget_device("dev-a").unwrap();
        assert!(!manager.get_device(&Uid::new("dev-a")).unwrap().stored);
    }

    #[test]
    fn remove_of_unstored_device_drops_it_entirely() {
        let enumeration = vec![
            Event { action: Action::Add, device: domain_snapshot("domain0", SecurityLevel::User) },
            Event { action: Action::Add, device: device_snapshot("dev-a", "domain0", 0) },
        ];
        let events = ScriptedEventSource::new(enumeration, vec![]);
        let (_dir, mut manager) = manager_with(events);

        let notifications = manager
            .apply_event(
                Event { action: Action::Remove, device: device_snapshot("dev-a", "domain0", 0) },
                now(),
            )
            .unwrap();
        assert_eq!(notifications, vec![Notification::DeviceRemoved(Uid::new("dev-a"))]);
        assert!(manager.get_device(&Uid::new("dev-a")).is_none());
    }
}
