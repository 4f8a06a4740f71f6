// boltd - Thunderbolt/USB4 device authorization daemon
//
// Kernel-event source. See spec.md §4.1. Mirrors the teacher's
// `monitor.rs` `Builder`/`Monitor` pair, but surfaces the richer
// `(Action, DeviceSnapshot)` pull this daemon needs and performs the
// startup topology scan the teacher's plain `find_devices()` doesn't order.

use std::os::fd::{AsRawFd, RawFd};

use tokio::io::unix::AsyncFd;
use udev::EventType;

use crate::error::{Error, Result};
use crate::sysfs::{self, DeviceSnapshot};

pub const SUBSYSTEM: &str = "thunderbolt";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    Add,
    Change,
    Remove,
}

impl Action {
    fn from_event_type(ty: EventType) -> Option<Self> {
        match ty {
            EventType::Add => Some(Action::Add),
            EventType::Change => Some(Action::Change),
            EventType::Remove => Some(Action::Remove),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Event {
    pub action: Action,
    pub device: DeviceSnapshot,
}

struct RawMonitorFd(RawFd);

impl AsRawFd for RawMonitorFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Async pull of kernel hotplug events, filtered to the thunderbolt bus.
///
/// *Open design note:* `udev::MonitorBuilder` binds only libudev's
/// processed ("udev") netlink multicast group, not the raw kernel group
/// the original daemon additionally subscribes to. We accept this as a
/// simplification — see DESIGN.md.
pub struct EventSource {
    socket: udev::MonitorSocket,
    fd: AsyncFd<RawMonitorFd>,
}

impl EventSource {
    pub fn new() -> Result<Self> {
        let socket = udev::MonitorBuilder::new()
            .map_err(Error::Udev)?
            .match_subsystem(SUBSYSTEM)
            .map_err(Error::Udev)?
            .listen()
            .map_err(Error::Udev)?;

        let raw_fd = socket.as_raw_fd();
        let fd = AsyncFd::new(RawMonitorFd(raw_fd))?;

        Ok(Self { socket, fd })
    }

    /// Enumerates every existing device on the thunderbolt bus, synthesized
    /// as `Add` events in bus-topology order (shallower syspaths, i.e.
    /// domains and parents, first). Called once at startup.
    pub fn enumerate(&self) -> Result<Vec<Event>> {
        let mut enumerator = udev::Enumerator::new().map_err(Error::Udev)?;
        enumerator.match_subsystem(SUBSYSTEM).map_err(Error::Udev)?;

        let mut devices: Vec<udev::Device> =
            enumerator.scan_devices().map_err(Error::Udev)?.collect();
        devices.sort_by_key(|d| d.syspath().as_os_str().len());

        Ok(devices
            .iter()
            .map(|device| Event {
                action: Action::Add,
                device: sysfs::snapshot(device),
            })
            .collect())
    }

    /// Awaits the next hotplug event, retrying internally on event types
    /// this daemon doesn't model (e.g. `bind`/`unbind`).
    pub async fn next(&mut self) -> Result<Event> {
        loop {
            let mut guard = self.fd.readable().await?;
            let polled = guard.try_io(|_| {
                self.socket
                    .iter()
                    .next()
                    .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::WouldBlock))
            });

            let event = match polled {
                Ok(Ok(event)) => event,
                Ok(Err(e)) => return Err(Error::Udev(e)),
                Err(_would_block) => continue,
            };

            if let Some(action) = Action::from_event_type(event.event_type()) {
                return Ok(Event {
                    action,
                    device: sysfs::snapshot(&event.device()),
                });
            }
        }
    }
}
