// boltd - Thunderbolt/USB4 device authorization daemon
//
// `org.freedesktop.bolt1.Manager`, exported at `/org/freedesktop/bolt`.
// See spec.md §4.11 and §6 "Remote bus (exposed)".

use std::sync::Arc;

use tokio::sync::Mutex;
use zbus::interface;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::OwnedObjectPath;

use crate::bus::{device_object_path, domain_object_path};
use crate::bus::policy::{Action, PolicyCheck};
use crate::bus::wire::to_fdo_error;
use crate::guard::Guard;
use crate::manager::Manager;
use crate::types::{AuthFlags, Policy};

pub struct ManagerIface {
    pub manager: Arc<Mutex<Manager>>,
    pub policy: Arc<dyn PolicyCheck>,
}

#[interface(name = "org.freedesktop.bolt1.Manager")]
impl ManagerIface {
    async fn list_devices(&self) -> zbus::fdo::Result<Vec<OwnedObjectPath>> {
        let manager = self.manager.lock().await;
        Ok(manager
            .list_device_uids()
            .iter()
            .map(device_object_path)
            .collect())
    }

    async fn device_by_uid(&self, uid: &str) -> zbus::fdo::Result<OwnedObjectPath> {
        let manager = self.manager.lock().await;
        manager
            .find_device_uid(uid)
            .map(|uid| device_object_path(&uid))
            .ok_or_else(|| to_fdo_error(&crate::error::Error::NotFound(uid.to_string())))
    }

    async fn enroll_device(
        &self,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
        uid: &str,
        policy: &str,
        authflags: &str,
    ) -> zbus::fdo::Result<OwnedObjectPath> {
        let caller = hdr.sender().map(|s| s.to_string()).unwrap_or_default();
        self.policy
            .check(
                &caller,
                Action::Method {
                    interface: "org.freedesktop.bolt1.Manager",
                    member: "EnrollDevice",
                },
            )
            .await
            .map_err(|e| to_fdo_error(&e))?;

        let mut manager = self.manager.lock().await;
        let uid = manager
            .enroll_device(uid, Policy::from(policy), AuthFlags::from_nicks(authflags))
            .await
            .map_err(|e| to_fdo_error(&e))?;
        Ok(device_object_path(&uid))
    }

    async fn authorize(
        &self,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
        uid: &str,
        authflags: &str,
    ) -> zbus::fdo::Result<()> {
        let caller = hdr.sender().map(|s| s.to_string()).unwrap_or_default();
        self.policy
            .check(
                &caller,
                Action::Method {
                    interface: "org.freedesktop.bolt1.Manager",
                    member: "Authorize",
                },
            )
            .await
            .map_err(|e| to_fdo_error(&e))?;

        let mut manager = self.manager.lock().await;
        manager
            .authorize(uid, AuthFlags::from_nicks(authflags))
            .await
            .map_err(|e| to_fdo_error(&e))
    }

    async fn forget_device(
        &self,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
        uid: &str,
    ) -> zbus::fdo::Result<()> {
        let caller = hdr.sender().map(|s| s.to_string()).unwrap_or_default();
        self.policy
            .check(
                &caller,
                Action::Method {
                    interface: "org.freedesktop.bolt1.Manager",
                    member: "ForgetDevice",
                },
            )
            .await
            .map_err(|e| to_fdo_error(&e))?;

        let mut manager = self.manager.lock().await;
        manager.forget_device(uid).map_err(|e| to_fdo_error(&e))
    }

    /// Acquires a force-power guard on behalf of the caller and hands back
    /// its id plus a FIFO write end: the caller holds the guard for as
    /// long as that fd stays open, per spec.md §4.6. Closing it (including
    /// the caller's process dying) releases the guard on the next reaper
    /// tick at the latest.
    async fn acquire_force_power(
        &self,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
        who: &str,
    ) -> zbus::fdo::Result<(String, zbus::zvariant::OwnedFd)> {
        let caller = hdr.sender().map(|s| s.to_string()).unwrap_or_default();
        self.policy
            .check(
                &caller,
                Action::Method {
                    interface: "org.freedesktop.bolt1.Manager",
                    member: "AcquireForcePower",
                },
            )
            .await
            .map_err(|e| to_fdo_error(&e))?;

        let sender = hdr
            .sender()
            .ok_or_else(|| zbus::fdo::Error::Failed("request has no unique bus name".into()))?;
        let dbus = zbus::fdo::DBusProxy::new(connection)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let pid = dbus
            .get_connection_unix_process_id(sender.clone().into())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        let (id, read_fd, write_fd) = {
            let mut manager = self.manager.lock().await;
            manager
                .acquire_power_guard(who, pid as i32)
                .map_err(|e| to_fdo_error(&e))?
        };

        let manager = self.manager.clone();
        let released_id = id.clone();
        tokio::spawn(async move {
            if Guard::wait_released(&read_fd).await.is_ok() {
                let mut manager = manager.lock().await;
                if let Err(e) = manager.release_power_guard(&released_id) {
                    tracing::warn!(error = %e, "failed to release power guard after client disconnect");
                }
            }
        });

        Ok((id, write_fd))
    }

    async fn list_domains(&self) -> zbus::fdo::Result<Vec<OwnedObjectPath>> {
        let manager = self.manager.lock().await;
        Ok(manager
            .list_domain_ids()
            .iter()
            .map(|id| domain_object_path(id))
            .collect())
    }

    #[zbus(signal)]
    pub async fn device_added(emitter: &SignalEmitter<'_>, device: OwnedObjectPath) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn device_removed(emitter: &SignalEmitter<'_>, device: OwnedObjectPath) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn domain_added(emitter: &SignalEmitter<'_>, domain: OwnedObjectPath) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn domain_removed(emitter: &SignalEmitter<'_>, domain: OwnedObjectPath) -> zbus::Result<()>;

    #[zbus(property)]
    async fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    #[zbus(property)]
    async fn probing(&self) -> bool {
        self.manager.lock().await.is_probing()
    }

    #[zbus(property)]
    async fn default_policy(&self) -> String {
        self.manager.lock().await.config().default_policy.to_string()
    }

    #[zbus(property)]
    async fn security_level(&self) -> String {
        self.manager
            .lock()
            .await
            .default_domain_security()
            .to_string()
    }

    #[zbus(property)]
    async fn auth_mode(&self) -> String {
        self.manager.lock().await.config().auth_mode.to_string()
    }
}
