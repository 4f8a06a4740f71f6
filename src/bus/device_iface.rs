// boltd - Thunderbolt/USB4 device authorization daemon
//
// `org.freedesktop.bolt1.Device`, exported at
// `/org/freedesktop/bolt/devices/<uid>`. See spec.md §6 "Device interface
// properties".

use std::sync::Arc;

use tokio::sync::Mutex;
use zbus::interface;

use crate::bus::policy::{Action, PolicyCheck};
use crate::bus::wire::{link_speed_to_dict, to_fdo_error};
use crate::manager::Manager;
use crate::types::Uid;

pub struct DeviceIface {
    pub manager: Arc<Mutex<Manager>>,
    pub uid: Uid,
    pub policy: Arc<dyn PolicyCheck>,
}

#[interface(name = "org.freedesktop.bolt1.Device")]
impl DeviceIface {
    #[zbus(property)]
    async fn uid(&self) -> String {
        self.uid.to_string()
    }

    #[zbus(property)]
    async fn name(&self) -> String {
        self.with_device(|d| d.name.clone()).await.unwrap_or_default()
    }

    #[zbus(property)]
    async fn vendor(&self) -> String {
        self.with_device(|d| d.vendor.clone()).await.unwrap_or_default()
    }

    #[zbus(property, name = "Type")]
    async fn kind(&self) -> String {
        self.with_device(|d| {
            if d.parent_uid.is_none() {
                "host".to_string()
            } else {
                "peripheral".to_string()
            }
        })
        .await
        .unwrap_or_else(|| "peripheral".to_string())
    }

    #[zbus(property)]
    async fn status(&self) -> String {
        self.with_device(|d| d.status.to_string()).await.unwrap_or_else(|| "unknown".to_string())
    }

    #[zbus(property)]
    async fn auth_flags(&self) -> String {
        self.with_device(|d| d.authflags.to_nicks()).await.unwrap_or_default()
    }

    #[zbus(property)]
    async fn parent(&self) -> String {
        self.with_device(|d| d.parent_uid.as_ref().map(Uid::to_string).unwrap_or_default())
            .await
            .unwrap_or_default()
    }

    #[zbus(property)]
    async fn sysfs_path(&self) -> String {
        self.with_device(|d| {
            d.syspath
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .await
        .unwrap_or_default()
    }

    #[zbus(property)]
    async fn domain(&self) -> String {
        self.with_device(|d| d.domain_id.clone().unwrap_or_default()).await.unwrap_or_default()
    }

    #[zbus(property)]
    async fn connect_time(&self) -> u64 {
        self.with_device(|d| d.conntime.map(|t| t.as_secs()).unwrap_or(0))
            .await
            .unwrap_or(0)
    }

    #[zbus(property)]
    async fn authorize_time(&self) -> u64 {
        self.with_device(|d| d.authtime.map(|t| t.as_secs()).unwrap_or(0))
            .await
            .unwrap_or(0)
    }

    #[zbus(property)]
    async fn store_time(&self) -> u64 {
        self.with_device(|d| d.storetime.map(|t| t.as_secs()).unwrap_or(0))
            .await
            .unwrap_or(0)
    }

    #[zbus(property)]
    async fn stored(&self) -> bool {
        self.with_device(|d| d.stored).await.unwrap_or(false)
    }

    #[zbus(property)]
    async fn policy(&self) -> String {
        self.with_device(|d| d.policy.to_string()).await.unwrap_or_else(|| "default".to_string())
    }

    #[zbus(property)]
    async fn key(&self) -> String {
        self.with_device(|d| d.keystate.to_string()).await.unwrap_or_else(|| "missing".to_string())
    }

    #[zbus(property)]
    async fn label(&self) -> String {
        self.with_device(|d| d.label.clone().unwrap_or_default()).await.unwrap_or_default()
    }

    #[zbus(property)]
    async fn set_label(
        &mut self,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
        value: String,
    ) -> zbus::Result<()> {
        let caller = hdr.sender().map(|s| s.to_string()).unwrap_or_default();
        self.policy
            .check(
                &caller,
                Action::PropertyWrite {
                    interface: "org.freedesktop.bolt1.Device",
                    property: "Label",
                },
            )
            .await
            .map_err(|e| to_fdo_error(&e))?;

        let mut manager = self.manager.lock().await;
        manager
            .set_device_label(&self.uid, value)
            .map_err(|e| to_fdo_error(&e).into())
    }

    #[zbus(property)]
    async fn link_speed(&self) -> std::collections::HashMap<String, u32> {
        self.with_device(|d| d.linkspeed.as_ref().map(link_speed_to_dict))
            .await
            .flatten()
            .unwrap_or_default()
    }
}

impl DeviceIface {
    async fn with_device<T>(&self, f: impl FnOnce(&crate::device::Device) -> T) -> Option<T> {
        let manager = self.manager.lock().await;
        manager.get_device(&self.uid).map(f)
    }
}
