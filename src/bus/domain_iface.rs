// boltd - Thunderbolt/USB4 device authorization daemon
//
// `org.freedesktop.bolt1.Domain`, exported at
// `/org/freedesktop/bolt/domains/<id>`. See spec.md §6 "Domain interface
// properties" and §4.7 for the boot-ACL semantics exposed here.

use std::sync::Arc;

use tokio::sync::Mutex;
use zbus::interface;

use crate::bus::policy::{Action, PolicyCheck};
use crate::bus::wire::to_fdo_error;
use crate::manager::Manager;

pub struct DomainIface {
    pub manager: Arc<Mutex<Manager>>,
    pub id: String,
    pub policy: Arc<dyn PolicyCheck>,
}

#[interface(name = "org.freedesktop.bolt1.Domain")]
impl DomainIface {
    #[zbus(property)]
    async fn uid(&self) -> String {
        self.with_domain(|d| d.uid.to_string()).await.unwrap_or_default()
    }

    #[zbus(property)]
    async fn id(&self) -> String {
        self.id.clone()
    }

    #[zbus(property)]
    async fn syspath(&self) -> String {
        self.with_domain(|d| {
            d.syspath
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .await
        .unwrap_or_default()
    }

    #[zbus(property)]
    async fn security(&self) -> String {
        self.with_domain(|d| d.security.to_string())
            .await
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[zbus(property)]
    async fn iommu(&self) -> bool {
        self.with_domain(|d| d.iommu).await.unwrap_or(false)
    }

    #[zbus(property)]
    async fn bootacl(&self) -> Vec<String> {
        let manager = self.manager.lock().await;
        manager
            .domain_bootacl(&self.id)
            .into_iter()
            .map(|slot| slot.map(|uid| uid.to_string()).unwrap_or_default())
            .collect()
    }

    #[zbus(property)]
    async fn set_bootacl(
        &mut self,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
        acl: Vec<String>,
    ) -> zbus::Result<()> {
        let caller = hdr.sender().map(|s| s.to_string()).unwrap_or_default();
        self.policy
            .check(
                &caller,
                Action::PropertyWrite {
                    interface: "org.freedesktop.bolt1.Domain",
                    property: "BootACL",
                },
            )
            .await
            .map_err(|e| to_fdo_error(&e))?;

        let mut manager = self.manager.lock().await;
        manager
            .set_domain_bootacl(&self.id, acl)
            .map_err(|e| to_fdo_error(&e).into())
    }
}

impl DomainIface {
    async fn with_domain<T>(&self, f: impl FnOnce(&crate::domain::Domain) -> T) -> Option<T> {
        let manager = self.manager.lock().await;
        manager.get_domain(&self.id).map(f)
    }
}
