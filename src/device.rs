// boltd - Thunderbolt/USB4 device authorization daemon
//
// Device entity and its authorization state machine. See spec.md §4.8.
//
// Transitions are an explicit match on `(Status, DeviceEvent)` rather than
// a runtime table — the compiler makes the match exhaustive, which is the
// Rust equivalent of the original's state table.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::sysfs::LinkSpeed;
use crate::types::{AuthFlags, KeyState, Policy, SecurityLevel, Status, Uid};

/// Outcome of a completed authorization task (see `auth.rs`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuthOutcome {
    pub level: SecurityLevel,
    pub flags: AuthFlags,
    pub key_was_new: bool,
}

/// Events that drive a device's [`Status`] transitions.
pub enum DeviceEvent {
    Added { authorized_state: Option<u8> },
    Changed { authorized_state: Option<u8> },
    Removed,
    AuthorizeRequested,
    AuthorizeSucceeded(AuthOutcome),
    AuthorizeFailed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Device {
    pub uid: Uid,
    pub name: String,
    pub vendor: String,
    pub status: Status,
    pub authflags: AuthFlags,
    pub parent_uid: Option<Uid>,
    pub domain_id: Option<String>,
    pub syspath: Option<PathBuf>,
    pub conntime: Option<Duration>,
    pub authtime: Option<Duration>,
    pub storetime: Option<Duration>,
    pub policy: Policy,
    pub keystate: KeyState,
    pub label: Option<String>,
    pub linkspeed: Option<LinkSpeed>,
    pub stored: bool,
}

impl Device {
    pub fn new(uid: Uid, name: String, vendor: String) -> Self {
        Self {
            uid,
            name,
            vendor,
            status: Status::Unknown,
            authflags: AuthFlags::empty(),
            parent_uid: None,
            domain_id: None,
            syspath: None,
            conntime: None,
            authtime: None,
            storetime: None,
            policy: Policy::Default,
            keystate: KeyState::Missing,
            label: None,
            linkspeed: None,
            stored: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.syspath.is_some()
    }

    pub fn is_authorized(&self) -> bool {
        self.status.is_authorized()
    }

    /// `None` means the sysfs `authorized` attribute hasn't been observed
    /// yet (the implicit `connecting` state of spec.md §4.8); an observed
    /// `0` means the device is present and unauthorized, i.e. `connected`.
    fn status_for_authorized_state(authorized_state: Option<u8>) -> Status {
        match authorized_state {
            None => Status::Connecting,
            Some(0) => Status::Connected,
            Some(1) => Status::Authorized,
            Some(2) => Status::AuthorizedSecure,
            Some(_) => Status::Unknown,
        }
    }

    /// Applies one event, updating `status` (and, where relevant,
    /// `authflags`/timestamps) in place. Disallowed transitions return
    /// [`Error::BadState`] and leave the device unchanged.
    pub fn apply(&mut self, event: DeviceEvent, now: Duration) -> Result<()> {
        match (self.status, event) {
            (_, DeviceEvent::Added { authorized_state }) => {
                self.status = Self::status_for_authorized_state(authorized_state);
                self.conntime = Some(now);
            }

            (Status::Disconnected, DeviceEvent::Changed { .. }) => {
                return Err(Error::BadState {
                    uid: self.uid.clone(),
                    state: "disconnected",
                });
            }
            (_, DeviceEvent::Changed { authorized_state }) => {
                self.status = Self::status_for_authorized_state(authorized_state);
            }

            (_, DeviceEvent::Removed) => {
                self.status = Status::Disconnected;
                self.syspath = None;
            }

            (Status::Authorizing, DeviceEvent::AuthorizeRequested) => {
                return Err(Error::BadState {
                    uid: self.uid.clone(),
                    state: "authorizing",
                });
            }
            (_, DeviceEvent::AuthorizeRequested) => {
                self.status = Status::Authorizing;
            }

            (Status::Authorizing, DeviceEvent::AuthorizeSucceeded(outcome)) => {
                self.status = Self::status_after_success(&outcome);
                self.authflags = outcome.flags;
                self.authtime = Some(now);
                self.keystate = if outcome.key_was_new {
                    KeyState::New
                } else if self.keystate != KeyState::Missing {
                    KeyState::Have
                } else {
                    self.keystate
                };
            }
            (_, DeviceEvent::AuthorizeSucceeded(_)) => {
                return Err(Error::BadState {
                    uid: self.uid.clone(),
                    state: "not authorizing",
                });
            }

            (Status::Authorizing, DeviceEvent::AuthorizeFailed) => {
                self.status = Status::AuthError;
            }
            (_, DeviceEvent::AuthorizeFailed) => {
                return Err(Error::BadState {
                    uid: self.uid.clone(),
                    state: "not authorizing",
                });
            }
        }

        Ok(())
    }

    /// AuthFlags-to-Status mapping for a successful authorization, per
    /// spec.md §4.8: secure level with a reused key is `authorized_secure`;
    /// secure with a freshly generated key is `authorized_newkey`; anything
    /// else successful is plain `authorized`.
    fn status_after_success(outcome: &AuthOutcome) -> Status {
        match outcome.level {
            SecurityLevel::Secure if outcome.key_was_new => Status::AuthorizedNewkey,
            SecurityLevel::Secure => Status::AuthorizedSecure,
            SecurityLevel::DpOnly => Status::AuthorizedDpOnly,
            _ => Status::Authorized,
        }
    }

    /// Requested-level negotiation: the minimum of the caller's requested
    /// level and the domain's own security level (spec.md §4.8 "Authorize
    /// policy negotiation").
    pub fn negotiate_level(requested: SecurityLevel, domain: SecurityLevel) -> SecurityLevel {
        requested.min(domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_device() -> Device {
        Device::new(Uid::new("uid-a"), "Dock".into(), "Acme".into())
    }

    #[test]
    fn add_with_unobserved_authorized_attribute_is_connecting() {
        let mut d = new_device();
        d.apply(DeviceEvent::Added { authorized_state: None }, Duration::ZERO)
            .unwrap();
        assert_eq!(d.status, Status::Connecting);
    }

    #[test]
    fn add_then_authorize_then_success_reaches_authorized_secure() {
        let mut d = new_device();
        d.apply(DeviceEvent::Added { authorized_state: Some(0) }, Duration::ZERO)
            .unwrap();
        assert_eq!(d.status, Status::Connected);

        d.apply(DeviceEvent::AuthorizeRequested, Duration::ZERO).unwrap();
        assert_eq!(d.status, Status::Authorizing);

        d.apply(
            DeviceEvent::AuthorizeSucceeded(AuthOutcome {
                level: SecurityLevel::Secure,
                flags: AuthFlags::SECURE,
                key_was_new: false,
            }),
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(d.status, Status::AuthorizedSecure);
        assert!(d.authtime.is_some());
    }

    #[test]
    fn authorize_with_fresh_key_reaches_authorized_newkey() {
        let mut d = new_device();
        d.apply(DeviceEvent::Added { authorized_state: Some(0) }, Duration::ZERO)
            .unwrap();
        d.apply(DeviceEvent::AuthorizeRequested, Duration::ZERO).unwrap();
        d.apply(
            DeviceEvent::AuthorizeSucceeded(AuthOutcome {
                level: SecurityLevel::Secure,
                flags: AuthFlags::SECURE,
                key_was_new: true,
            }),
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(d.status, Status::AuthorizedNewkey);
        assert_eq!(d.keystate, KeyState::New);
    }

    #[test]
    fn second_concurrent_authorize_request_is_rejected() {
        let mut d = new_device();
        d.apply(DeviceEvent::Added { authorized_state: Some(0) }, Duration::ZERO)
            .unwrap();
        d.apply(DeviceEvent::AuthorizeRequested, Duration::ZERO).unwrap();

        let err = d
            .apply(DeviceEvent::AuthorizeRequested, Duration::ZERO)
            .unwrap_err();
        assert!(err.is_bad_state());
        assert_eq!(d.status, Status::Authorizing, "state unchanged on rejection");
    }

    #[test]
    fn failed_authorization_reaches_auth_error() {
        let mut d = new_device();
        d.apply(DeviceEvent::Added { authorized_state: Some(0) }, Duration::ZERO)
            .unwrap();
        d.apply(DeviceEvent::AuthorizeRequested, Duration::ZERO).unwrap();
        d.apply(DeviceEvent::AuthorizeFailed, Duration::ZERO).unwrap();
        assert_eq!(d.status, Status::AuthError);
    }

    #[test]
    fn remove_transitions_to_disconnected_and_clears_syspath() {
        let mut d = new_device();
        d.syspath = Some("/sys/devices/x".into());
        d.apply(DeviceEvent::Removed, Duration::ZERO).unwrap();
        assert_eq!(d.status, Status::Disconnected);
        assert!(d.syspath.is_none());
    }

    #[test]
    fn negotiate_level_takes_the_weaker_of_request_and_domain() {
        assert_eq!(
            Device::negotiate_level(SecurityLevel::Secure, SecurityLevel::User),
            SecurityLevel::User
        );
        assert_eq!(
            Device::negotiate_level(SecurityLevel::DpOnly, SecurityLevel::Secure),
            SecurityLevel::DpOnly
        );
    }
}
