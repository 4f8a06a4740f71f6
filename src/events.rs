// boltd - Thunderbolt/USB4 device authorization daemon
//
// The kernel-event source as a trait, so `Manager` can be driven by a
// replayed event script in tests instead of a real kernel. See spec.md
// §9's implicit need for a substitution point to test kernel-driven state
// machines without hardware.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::Result;
use crate::udev_events::Event;

#[async_trait(?Send)]
pub trait EventSource {
    /// Enumerates every existing device, synthesized as `Add` events in
    /// bus-topology order. Called once at startup.
    fn enumerate(&self) -> Result<Vec<Event>>;

    /// Awaits the next hotplug event.
    async fn next(&mut self) -> Result<Event>;
}

#[async_trait(?Send)]
impl EventSource for crate::udev_events::EventSource {
    fn enumerate(&self) -> Result<Vec<Event>> {
        crate::udev_events::EventSource::enumerate(self)
    }

    async fn next(&mut self) -> Result<Event> {
        crate::udev_events::EventSource::next(self).await
    }
}

/// A fixed, pre-recorded event script, for driving [`crate::manager::Manager`]
/// in tests without a real kernel. `next()` never resolves once the script
/// is exhausted, the same way a real monitor socket simply has nothing
/// more to deliver.
pub struct ScriptedEventSource {
    enumeration: Vec<Event>,
    script: VecDeque<Event>,
}

impl ScriptedEventSource {
    pub fn new(enumeration: Vec<Event>, script: Vec<Event>) -> Self {
        Self {
            enumeration,
            script: script.into(),
        }
    }
}

#[async_trait(?Send)]
impl EventSource for ScriptedEventSource {
    fn enumerate(&self) -> Result<Vec<Event>> {
        Ok(self.enumeration.clone())
    }

    async fn next(&mut self) -> Result<Event> {
        match self.script.pop_front() {
            Some(event) => Ok(event),
            None => std::future::pending().await,
        }
    }
}
