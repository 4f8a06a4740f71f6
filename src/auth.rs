// boltd - Thunderbolt/USB4 device authorization daemon
//
// Authorization task: the one-shot async operation that performs the
// sysfs write sequence for a single device. See spec.md §4.9.
//
// The actual sysfs write sequence is behind a small `AuthBackend` trait
// rather than called directly against `udev::Device::from_syspath` so the
// whole authorize flow (state machine, journal, flags) is drivable in
// tests without a real kernel — the same substitution point `events.rs`
// uses for the hotplug stream.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::device::AuthOutcome;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::types::{AuthFlags, SecurityLevel, Uid};

/// What the caller asked for: a target level and, for `secure`, the key
/// material to write (or prove possession of).
pub struct AuthRequest {
    pub uid: Uid,
    pub level: SecurityLevel,
    pub key: Option<Key>,
    pub domain_permits_pcie: bool,
}

/// Performs the blocking sysfs write sequence for a request against the
/// device at `syspath`.
pub trait AuthBackend: Send + Sync {
    fn perform(&self, request: &AuthRequest, syspath: &Path) -> Result<AuthOutcome>;
}

/// The real backend: opens the device via its syspath and writes `key`/
/// `authorized` directly.
pub struct UdevAuthBackend;

impl AuthBackend for UdevAuthBackend {
    fn perform(&self, request: &AuthRequest, syspath: &Path) -> Result<AuthOutcome> {
        let device = udev::Device::from_syspath(syspath).map_err(Error::Udev)?;
        write_sequence(request, &device)
    }
}

fn write_sequence(request: &AuthRequest, device: &udev::Device) -> Result<AuthOutcome> {
    let mut flags = AuthFlags::empty();
    if !request.domain_permits_pcie {
        flags |= AuthFlags::NOPCIE;
    }

    let (achieved, key_was_new) = match request.level {
        SecurityLevel::None | SecurityLevel::DpOnly | SecurityLevel::UsbOnly => {
            // The kernel auto-authorizes at these levels; we only observe.
            (request.level, false)
        }
        SecurityLevel::User => {
            device
                .set_attribute_value("authorized", "1")
                .map_err(Error::Udev)?;
            (SecurityLevel::User, false)
        }
        SecurityLevel::Secure => {
            let key = request
                .key
                .as_ref()
                .ok_or_else(|| Error::NoKey { uid: request.uid.clone() })?;
            let achieved = key.write_to_kernel(&request.uid, device)?;
            device
                .set_attribute_value("authorized", "2")
                .map_err(Error::Udev)?;
            (achieved, key.is_fresh())
        }
        SecurityLevel::Unknown => {
            return Err(Error::Cfg(format!(
                "cannot authorize {} at an unknown security level",
                request.uid
            )));
        }
    };

    if achieved == SecurityLevel::Secure {
        flags |= AuthFlags::SECURE;
    }

    Ok(AuthOutcome {
        level: achieved,
        flags,
        key_was_new,
    })
}

/// A spawned, cancellable authorization in flight. `check()` does not
/// consume the task, matching spec.md §9's "task errors can be inspected
/// without consumption": the result is written once into a shared
/// `OnceLock` and every `check()` call reads the same slot.
pub struct AuthTask {
    uid: Uid,
    result: Arc<OnceLock<Result<AuthOutcome>>>,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl AuthTask {
    /// Spawns the task. The blocking sysfs write runs inside
    /// `spawn_blocking` so the single-threaded main loop never stalls on
    /// device I/O.
    pub fn spawn(
        request: AuthRequest,
        syspath: std::path::PathBuf,
        backend: Arc<dyn AuthBackend>,
    ) -> Self {
        let uid = request.uid.clone();
        let result: Arc<OnceLock<Result<AuthOutcome>>> = Arc::new(OnceLock::new());
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let result_slot = result.clone();
        let task_uid = uid.clone();
        let handle = tokio::spawn(async move {
            if *cancel_rx.borrow() {
                let _ = result_slot.set(Err(Error::Cancelled));
                return;
            }

            let outcome =
                tokio::task::spawn_blocking(move || backend.perform(&request, &syspath))
                    .await
                    .unwrap_or_else(|join_err| {
                        Err(Error::Failed(format!("authorization task panicked: {join_err}")))
                    });

            // A cancellation observed after the blocking write has already
            // run has no effect: spec.md §5 "does not roll back any
            // partial kernel-side effect" — the achieved state is whatever
            // a subsequent `change` event reports.
            if cancel_rx.has_changed().unwrap_or(false) && *cancel_rx.borrow() {
                warn!(uid = %task_uid, "authorization cancelled after sysfs write completed");
            }

            match &outcome {
                Ok(o) => info!(uid = %task_uid, level = %o.level, "authorization succeeded"),
                Err(e) => warn!(uid = %task_uid, error = %e, "authorization failed"),
            }

            let _ = result_slot.set(outcome);
        });

        Self {
            uid,
            result,
            cancel: cancel_tx,
            handle,
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// Awaits completion and returns the outcome, consuming the task. A
    /// backend error loses its original variant here (there's no `Clone`
    /// on `Error`) and is reported as [`Error::Failed`] with the original
    /// message preserved in its text.
    pub async fn join(self) -> Result<AuthOutcome> {
        let result = self.result.clone();
        let _ = self.handle.await;
        match result.get() {
            Some(Ok(outcome)) => Ok(*outcome),
            Some(Err(e)) => Err(Error::Failed(e.to_string())),
            None => Err(Error::Failed("authorization task ended without a result".into())),
        }
    }

    /// Non-consuming peek at the task's outcome. Returns `None` while
    /// still in flight.
    pub fn check(&self) -> Option<&Result<AuthOutcome>> {
        self.result.get()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Requests cancellation. Has no effect once the blocking write has
    /// already started (see spec.md §5).
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// A backend that never touches sysfs, for driving the authorize flow
/// end-to-end in tests. Always reports success at the requested level,
/// marking the key fresh iff one was supplied and [`Key::is_fresh`].
pub struct FakeAuthBackend;

impl AuthBackend for FakeAuthBackend {
    fn perform(&self, request: &AuthRequest, _syspath: &Path) -> Result<AuthOutcome> {
        let mut flags = AuthFlags::empty();
        if !request.domain_permits_pcie {
            flags |= AuthFlags::NOPCIE;
        }
        if request.level == SecurityLevel::Secure {
            flags |= AuthFlags::SECURE;
        }
        let key_was_new = request.key.as_ref().map(Key::is_fresh).unwrap_or(false);
        Ok(AuthOutcome {
            level: request.level,
            flags,
            key_was_new,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_backend_reaches_authorized_via_spawn() {
        let request = AuthRequest {
            uid: Uid::new("uid-a"),
            level: SecurityLevel::User,
            key: None,
            domain_permits_pcie: true,
        };

        let task = AuthTask::spawn(request, "/sys/devices/fake".into(), Arc::new(FakeAuthBackend));
        for _ in 0..100 {
            if task.is_finished() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let outcome = task.check().expect("task finished").as_ref().unwrap();
        assert_eq!(outcome.level, SecurityLevel::User);
        assert!(!outcome.flags.contains(AuthFlags::NOPCIE));
    }
}
