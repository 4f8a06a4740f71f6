// boltd - Thunderbolt/USB4 device authorization daemon
//
// Wire enums and the `Uid` newtype. Follows the teacher's
// `impl From<&str>` / `impl Display` pattern for every enum that crosses
// the kernel or bus boundary (see the upstream `Kind`/`SecurityLevel` in
// tbtools' device model): parsing never fails, it falls back to a
// designated `Unknown`/`Invalid` arm, and `Display` always round-trips.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Stable per-peripheral identifier reported by the kernel.
///
/// Canonical form is preserved byte-exact; the only place this type bends
/// its own string is [`Uid::object_path_segment`], which substitutes `-`
/// for `_` for use in a D-Bus object path.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Uid(String);

impl Uid {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The uid with every `-` replaced by `_`, suitable as the final path
    /// segment of `/org/freedesktop/bolt/devices/<uid>`.
    pub fn object_path_segment(&self) -> String {
        self.0.replace('-', "_")
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Uid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for Uid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Domain-level security policy, as reported by the kernel's `security`
/// sysfs attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecurityLevel {
    /// PCIe tunnels are created automatically, no daemon involvement.
    None,
    /// Only DisplayPort/USB traffic is tunneled.
    DpOnly,
    /// Only one PCIe tunnel, to the first-level USB controller.
    UsbOnly,
    /// Host-initiated approval is required before tunneling.
    User,
    /// Approval plus key-based re-authentication is required.
    Secure,
    /// Security level string not recognized.
    Unknown,
}

impl SecurityLevel {
    /// The minimum of two levels in the authorization-strength ordering
    /// `none < dponly < usbonly < user < secure` (`Unknown` sorts as
    /// weakest, i.e. as if it were `none`, since we never want to grant
    /// more trust than we understand).
    pub fn min(self, other: Self) -> Self {
        fn rank(l: SecurityLevel) -> u8 {
            match l {
                SecurityLevel::None | SecurityLevel::Unknown => 0,
                SecurityLevel::DpOnly => 1,
                SecurityLevel::UsbOnly => 2,
                SecurityLevel::User => 3,
                SecurityLevel::Secure => 4,
            }
        }
        if rank(self) <= rank(other) {
            self
        } else {
            other
        }
    }
}

impl From<&str> for SecurityLevel {
    fn from(s: &str) -> Self {
        match s {
            "none" => Self::None,
            "dponly" => Self::DpOnly,
            "usbonly" => Self::UsbOnly,
            "user" => Self::User,
            "secure" => Self::Secure,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::DpOnly => "dponly",
            Self::UsbOnly => "usbonly",
            Self::User => "user",
            Self::Secure => "secure",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// State of a device's key material.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyState {
    Missing,
    /// Generated this enrollment, never written to the kernel yet.
    New,
    /// A key exists and has been used successfully at least once.
    Have,
    Unknown,
}

impl From<&str> for KeyState {
    fn from(s: &str) -> Self {
        match s {
            "missing" => Self::Missing,
            "new" => Self::New,
            "have" => Self::Have,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Missing => "missing",
            Self::New => "new",
            Self::Have => "have",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Per-device behavior when seen by the daemon.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Policy {
    #[default]
    Default,
    Manual,
    Auto,
    Unknown,
}

impl From<&str> for Policy {
    fn from(s: &str) -> Self {
        match s {
            "default" => Self::Default,
            "manual" => Self::Manual,
            "auto" => Self::Auto,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Default => "default",
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Observable device status.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Unknown,
    Disconnected,
    Connected,
    Connecting,
    Authorizing,
    AuthError,
    Authorized,
    AuthorizedSecure,
    AuthorizedNewkey,
    AuthorizedDpOnly,
}

impl Status {
    pub fn is_authorized(self) -> bool {
        matches!(
            self,
            Status::Authorized
                | Status::AuthorizedSecure
                | Status::AuthorizedNewkey
                | Status::AuthorizedDpOnly
        )
    }

    pub fn is_connected(self) -> bool {
        self.is_authorized()
            || matches!(
                self,
                Status::Connected | Status::Connecting | Status::Authorizing | Status::AuthError
            )
    }
}

impl From<&str> for Status {
    fn from(s: &str) -> Self {
        match s {
            "disconnected" => Self::Disconnected,
            "connected" => Self::Connected,
            "connecting" => Self::Connecting,
            "authorizing" => Self::Authorizing,
            "auth_error" => Self::AuthError,
            "authorized" => Self::Authorized,
            "authorized_secure" => Self::AuthorizedSecure,
            "authorized_newkey" => Self::AuthorizedNewkey,
            "authorized_dponly" => Self::AuthorizedDpOnly,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Connecting => "connecting",
            Self::Authorizing => "authorizing",
            Self::AuthError => "auth_error",
            Self::Authorized => "authorized",
            Self::AuthorizedSecure => "authorized_secure",
            Self::AuthorizedNewkey => "authorized_newkey",
            Self::AuthorizedDpOnly => "authorized_dponly",
        };
        write!(f, "{s}")
    }
}

/// Whether a device node is a domain root, a host router, or a peripheral.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceType {
    Host,
    Peripheral,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Host => "host",
            Self::Peripheral => "peripheral",
        };
        write!(f, "{s}")
    }
}

bitflags! {
    /// Capability modifiers attached to an authorization outcome.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
    pub struct AuthFlags: u32 {
        /// Key-based authentication was used to reach this state.
        const SECURE = 0b01;
        /// The device is not carrying PCIe traffic.
        const NOPCIE = 0b10;
    }
}

impl AuthFlags {
    /// Parse a pipe-separated nick string, e.g. `"secure|nopcie"`. Unknown
    /// nicks are ignored rather than rejected, matching the enum parsers'
    /// "never fail" convention.
    pub fn from_nicks(s: &str) -> Self {
        let mut flags = AuthFlags::empty();
        for nick in s.split('|').map(str::trim).filter(|s| !s.is_empty()) {
            match nick {
                "secure" => flags |= AuthFlags::SECURE,
                "nopcie" => flags |= AuthFlags::NOPCIE,
                _ => {}
            }
        }
        flags
    }

    pub fn to_nicks(self) -> String {
        let mut nicks = Vec::new();
        if self.contains(AuthFlags::SECURE) {
            nicks.push("secure");
        }
        if self.contains(AuthFlags::NOPCIE) {
            nicks.push("nopcie");
        }
        nicks.join("|")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_level_round_trips() {
        for s in [
            SecurityLevel::None,
            SecurityLevel::DpOnly,
            SecurityLevel::UsbOnly,
            SecurityLevel::User,
            SecurityLevel::Secure,
        ] {
            assert_eq!(SecurityLevel::from(s.to_string().as_str()), s);
        }
        assert_eq!(SecurityLevel::from("garbage"), SecurityLevel::Unknown);
    }

    #[test]
    fn key_state_round_trips() {
        for s in [KeyState::Missing, KeyState::New, KeyState::Have] {
            assert_eq!(KeyState::from(s.to_string().as_str()), s);
        }
        assert_eq!(KeyState::from("garbage"), KeyState::Unknown);
    }

    #[test]
    fn policy_round_trips() {
        for s in [Policy::Default, Policy::Manual, Policy::Auto] {
            assert_eq!(Policy::from(s.to_string().as_str()), s);
        }
        assert_eq!(Policy::from("garbage"), Policy::Unknown);
    }

    #[test]
    fn status_round_trips() {
        for s in [
            Status::Disconnected,
            Status::Connected,
            Status::Connecting,
            Status::Authorizing,
            Status::AuthError,
            Status::Authorized,
            Status::AuthorizedSecure,
            Status::AuthorizedNewkey,
            Status::AuthorizedDpOnly,
        ] {
            assert_eq!(Status::from(s.to_string().as_str()), s);
        }
        assert_eq!(Status::from("garbage"), Status::Unknown);
    }

    #[test]
    fn authflags_nicks_round_trip() {
        let flags = AuthFlags::SECURE | AuthFlags::NOPCIE;
        assert_eq!(AuthFlags::from_nicks(&flags.to_nicks()), flags);
        assert_eq!(AuthFlags::from_nicks(""), AuthFlags::empty());
    }

    #[test]
    fn uid_object_path_segment_substitutes_dashes() {
        let uid = Uid::new("fbc83890-e9bf-45e5-a777-b3728490989c");
        assert_eq!(
            uid.object_path_segment(),
            "fbc83890_e9bf_45e5_a777_b3728490989c"
        );
    }

    #[test]
    fn security_level_min_treats_unknown_as_weakest() {
        assert_eq!(
            SecurityLevel::Unknown.min(SecurityLevel::Secure),
            SecurityLevel::Unknown
        );
        assert_eq!(
            SecurityLevel::User.min(SecurityLevel::Secure),
            SecurityLevel::User
        );
    }
}
