// boltd - Thunderbolt/USB4 device authorization daemon
//
// The daemon binary: wires every library component into a running
// process. See spec.md §5 for the concurrency model this wiring realizes
// and SPEC_FULL.md §2's module table for where each piece lives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use zbus::object_server::SignalEmitter;

use boltd::auth::UdevAuthBackend;
use boltd::bus::device_iface::DeviceIface;
use boltd::bus::domain_iface::DomainIface;
use boltd::bus::manager_iface::ManagerIface;
use boltd::bus::policy::AllowAllPolicy;
use boltd::bus::{self, device_object_path, domain_object_path};
use boltd::config::{Config, SdNotify};
use boltd::journal::Journal;
use boltd::manager::{Manager, Notification};
use boltd::power::Power;
use boltd::reaper;
use boltd::store::Store;
use boltd::types::AuthFlags;
use boltd::udev_events::EventSource;

#[derive(Parser, Debug)]
#[command(name = "boltd", about = "Thunderbolt/USB4 device authorization daemon")]
struct Cli {
    /// Root directory for persisted state (devices, keys, domains, config).
    #[arg(long, default_value = "/var/lib/boltd")]
    store_root: PathBuf,

    /// Connect to the session bus instead of the system bus (for testing).
    #[arg(long)]
    session: bool,
}

fn discover_force_power_attr() -> PathBuf {
    let fallback = PathBuf::from("/sys/bus/thunderbolt/devices/domain0/force_power");
    let Ok(mut enumerator) = udev::Enumerator::new() else {
        return fallback;
    };
    if enumerator.match_subsystem("thunderbolt").is_err() {
        return fallback;
    }
    let Ok(devices) = enumerator.scan_devices() else {
        return fallback;
    };
    for device in devices {
        let candidate = device.syspath().join("force_power");
        if candidate.exists() {
            return candidate;
        }
    }
    fallback
}

async fn export_device(
    connection: &zbus::Connection,
    manager: &Arc<Mutex<Manager>>,
    uid: &boltd::types::Uid,
    policy: &Arc<dyn boltd::bus::policy::PolicyCheck>,
) -> zbus::Result<()> {
    let path = device_object_path(uid);
    connection
        .object_server()
        .at(
            path,
            DeviceIface {
                manager: manager.clone(),
                uid: uid.clone(),
                policy: policy.clone(),
            },
        )
        .await?;
    Ok(())
}

async fn export_domain(
    connection: &zbus::Connection,
    manager: &Arc<Mutex<Manager>>,
    id: &str,
    policy: &Arc<dyn boltd::bus::policy::PolicyCheck>,
) -> zbus::Result<()> {
    let path = domain_object_path(id);
    connection
        .object_server()
        .at(
            path,
            DomainIface {
                manager: manager.clone(),
                id: id.to_string(),
                policy: policy.clone(),
            },
        )
        .await?;
    Ok(())
}

/// Reflects one [`Notification`] from `Manager::apply_event` onto the bus:
/// export/unexport the affected object and emit its `*Added`/`*Removed`
/// signal. Property-level changes (`*Changed`) are folded into a
/// `PropertiesChanged` emission on the object itself.
async fn reflect_notification(
    connection: &zbus::Connection,
    manager: &Arc<Mutex<Manager>>,
    policy: &Arc<dyn boltd::bus::policy::PolicyCheck>,
    notification: Notification,
) {
    let result: zbus::Result<()> = async {
        match notification {
            Notification::DeviceAdded(uid) => {
                export_device(connection, manager, &uid, policy).await?;
                let emitter = SignalEmitter::new(connection, bus::MANAGER_PATH)?;
                ManagerIface::device_added(&emitter, device_object_path(&uid)).await?;
            }
            Notification::DeviceRemoved(uid) => {
                let path = device_object_path(&uid);
                connection.object_server().remove::<DeviceIface, _>(&path).await?;
                let emitter = SignalEmitter::new(connection, bus::MANAGER_PATH)?;
                ManagerIface::device_removed(&emitter, path).await?;
            }
            Notification::DeviceChanged(uid) => {
                let path = device_object_path(&uid);
                let emitter = SignalEmitter::new(connection, path.as_ref())?;
                let mut changed = std::collections::HashMap::new();
                {
                    let mgr = manager.lock().await;
                    if let Some(device) = mgr.get_device(&uid) {
                        changed.insert("Status", zbus::zvariant::Value::from(device.status.to_string()));
                        changed.insert("AuthFlags", zbus::zvariant::Value::from(device.authflags.to_nicks()));
                    }
                }
                let invalidated: Vec<&str> = Vec::new();
                zbus::fdo::Properties::properties_changed(
                    &emitter,
                    "org.freedesktop.bolt1.Device",
                    &changed,
                    &invalidated,
                )
                .await?;
            }
            Notification::DomainAdded(id) => {
                export_domain(connection, manager, &id, policy).await?;
                let emitter = SignalEmitter::new(connection, bus::MANAGER_PATH)?;
                ManagerIface::domain_added(&emitter, domain_object_path(&id)).await?;
            }
            Notification::DomainRemoved(id) => {
                let path = domain_object_path(&id);
                connection.object_server().remove::<DomainIface, _>(&path).await?;
                let emitter = SignalEmitter::new(connection, bus::MANAGER_PATH)?;
                ManagerIface::domain_removed(&emitter, path).await?;
            }
            Notification::AutoAuthorize(uid) => {
                let outcome = {
                    let mut mgr = manager.lock().await;
                    mgr.authorize(uid.as_str(), AuthFlags::SECURE).await
                };
                if let Err(e) = outcome {
                    warn!(uid = %uid, error = %e, "automatic authorization of auto-policy device failed");
                }
                Box::pin(reflect_notification(
                    connection,
                    manager,
                    policy,
                    Notification::DeviceChanged(uid),
                ))
                .await;
            }
            Notification::DomainChanged(id) => {
                let path = domain_object_path(&id);
                let emitter = SignalEmitter::new(connection, path.as_ref())?;
                let mut changed = std::collections::HashMap::new();
                {
                    let mgr = manager.lock().await;
                    if let Some(domain) = mgr.get_domain(&id) {
                        changed.insert("Security", zbus::zvariant::Value::from(domain.security.to_string()));
                    }
                }
                let invalidated: Vec<&str> = Vec::new();
                zbus::fdo::Properties::properties_changed(
                    &emitter,
                    "org.freedesktop.bolt1.Domain",
                    &changed,
                    &invalidated,
                )
                .await?;
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        warn!(error = %e, "failed to reflect manager notification on the bus");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let store = Store::open(cli.store_root.clone())?;
    let journal = Journal::open(cli.store_root.join("journal"))?;
    let config = match store.config_text()? {
        Some(text) => Config::parse(&text),
        None => Config::default(),
    };
    let power = Power::new(discover_force_power_attr(), cli.store_root.join("guards"));

    let mut events = EventSource::new()?;
    let manager = Manager::start(store, journal, power, config, &events, Arc::new(UdevAuthBackend))?;
    let manager = Arc::new(Mutex::new(manager));

    let policy: Arc<dyn boltd::bus::policy::PolicyCheck> = Arc::new(AllowAllPolicy);
    let manager_iface = ManagerIface {
        manager: manager.clone(),
        policy: policy.clone(),
    };

    let builder = if cli.session {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let connection = builder
        .name(bus::BUS_NAME)?
        .serve_at(bus::MANAGER_PATH, manager_iface)?
        .build()
        .await?;

    {
        let mgr = manager.lock().await;
        for uid in mgr.list_device_uids() {
            export_device(&connection, &manager, &uid, &policy).await?;
        }
        for id in mgr.list_domain_ids() {
            export_domain(&connection, &manager, &id, &policy).await?;
        }
    }

    let notify = SdNotify::from_env();
    notify.ready();
    info!(bus = bus::BUS_NAME, "boltd ready");

    let watchdog_interval = notify.watchdog_interval;
    let mut watchdog_task = tokio::spawn(async move {
        let Some(interval) = watchdog_interval else {
            std::future::pending::<()>().await;
            unreachable!();
        };
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            notify.watchdog_ping();
        }
    });

    let reaper_manager = manager.clone();
    let mut reaper_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reaper::DEFAULT_INTERVAL);
        loop {
            ticker.tick().await;
            let mut mgr = reaper_manager.lock().await;
            if !mgr.has_pending_guards() {
                continue;
            }
            for (pid, guard_id) in mgr.tick_reaper() {
                warn!(pid, guard_id = %guard_id, "power guard owner died without releasing, reaping");
                if let Err(e) = mgr.release_power_guard(&guard_id) {
                    error!(error = %e, "failed to release force_power after reaping guard");
                }
            }
        }
    });

    let event_connection = connection.clone();
    let event_manager = manager.clone();
    let event_policy = policy.clone();
    let mut event_task: tokio::task::JoinHandle<()> = tokio::spawn(async move {
        loop {
            match events.next().await {
                Ok(event) => {
                    let notifications = {
                        let mut mgr = event_manager.lock().await;
                        let now = std::time::Duration::from_micros(boltd::util::now_usec());
                        match mgr.apply_event(event, now) {
                            Ok(notifications) => notifications,
                            Err(e) => {
                                warn!(error = %e, "rejected hotplug event");
                                continue;
                            }
                        }
                    };
                    for notification in notifications {
                        reflect_notification(&event_connection, &event_manager, &event_policy, notification).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "kernel event source failed, daemon cannot continue");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
        }
        _ = &mut event_task => {
            error!("event loop exited unexpectedly");
        }
        _ = &mut reaper_task => {}
        _ = &mut watchdog_task => {}
    }

    event_task.abort();
    reaper_task.abort();
    watchdog_task.abort();
    SdNotify::from_env().stopping();

    Ok(())
}
