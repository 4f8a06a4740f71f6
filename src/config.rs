// boltd - Thunderbolt/USB4 device authorization daemon
//
// Global daemon configuration, parsed from the store's top-level `config`
// file via the same keyfile format the store uses for device records. See
// spec.md §6 "Persisted state layout" and SPEC_FULL.md §6 for the
// sd_notify environment handling.

use std::env;
use std::os::unix::net::UnixDatagram;
use std::time::Duration;

use tracing::{debug, warn};

use crate::keyfile::KeyFile;
use crate::types::{Policy, SecurityLevel};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthMode {
    Enabled,
    Disabled,
}

impl From<&str> for AuthMode {
    fn from(s: &str) -> Self {
        match s {
            "disabled" => Self::Disabled,
            _ => Self::Enabled,
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub default_policy: Policy,
    pub security_level_override: Option<SecurityLevel>,
    pub auth_mode: AuthMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_policy: Policy::Default,
            security_level_override: None,
            auth_mode: AuthMode::Enabled,
        }
    }
}

impl Config {
    /// Parses `text` as a `[daemon]`-sectioned keyfile. Missing keys fall
    /// back to defaults; an unparseable enum value is a warning, not a
    /// fatal `cfg` error, matching spec.md's "neutral fallback" rule used
    /// elsewhere for enum parsing.
    pub fn parse(text: &str) -> Self {
        let kf = KeyFile::parse(text);
        let mut config = Self::default();

        if let Some(policy) = kf.get("daemon", "default-policy") {
            config.default_policy = Policy::from(policy);
        }
        if let Some(level) = kf.get("daemon", "security-level") {
            let level = SecurityLevel::from(level);
            if level == SecurityLevel::Unknown {
                warn!(value = level.to_string(), "invalid security-level override in config, ignoring");
            } else {
                config.security_level_override = Some(level);
            }
        }
        if let Some(mode) = kf.get("daemon", "auth-mode") {
            config.auth_mode = AuthMode::from(mode);
        }

        config
    }

    pub fn to_keyfile_text(&self) -> String {
        let mut kf = KeyFile::new();
        kf.set("daemon", "default-policy", self.default_policy.to_string());
        if let Some(level) = self.security_level_override {
            kf.set("daemon", "security-level", level.to_string());
        }
        kf.set("daemon", "auth-mode", self.auth_mode.to_string());
        kf.to_string()
    }
}

/// Minimal sd_notify-protocol client: a two-line datagram write over the
/// `NOTIFY_SOCKET` env var, with optional watchdog pings driven by
/// `WATCHDOG_USEC`. This is the one place the daemon talks to systemd; it
/// is implemented directly over a Unix datagram socket rather than a
/// dedicated sd-notify crate since the protocol itself is this small.
pub struct SdNotify {
    socket: Option<UnixDatagram>,
    pub watchdog_interval: Option<Duration>,
}

impl SdNotify {
    pub fn from_env() -> Self {
        let socket = env::var_os("NOTIFY_SOCKET").and_then(|path| {
            let socket = UnixDatagram::unbound().ok()?;
            socket.connect(&path).ok()?;
            debug!(path = ?path, "connected to sd_notify socket");
            Some(socket)
        });

        let watchdog_interval = env::var("WATCHDOG_USEC")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|usec| Duration::from_micros(usec / 2));

        Self {
            socket,
            watchdog_interval,
        }
    }

    fn send(&self, message: &str) {
        if let Some(socket) = &self.socket {
            if let Err(e) = socket.send(message.as_bytes()) {
                warn!(error = %e, "failed to write sd_notify message");
            }
        }
    }

    pub fn ready(&self) {
        self.send("READY=1");
    }

    pub fn watchdog_ping(&self) {
        self.send("WATCHDOG=1");
    }

    pub fn stopping(&self) {
        self.send("STOPPING=1");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_through_text() {
        let mut config = Config::default();
        config.default_policy = Policy::Auto;
        config.security_level_override = Some(SecurityLevel::Secure);
        config.auth_mode = AuthMode::Disabled;

        let text = config.to_keyfile_text();
        let parsed = Config::parse(&text);

        assert_eq!(parsed.default_policy, Policy::Auto);
        assert_eq!(parsed.security_level_override, Some(SecurityLevel::Secure));
        assert_eq!(parsed.auth_mode, AuthMode::Disabled);
    }

    #[test]
    fn invalid_security_level_is_ignored_not_fatal() {
        let config = Config::parse("[daemon]\nsecurity-level=bogus\n");
        assert_eq!(config.security_level_override, None);
    }

    #[test]
    fn missing_notify_socket_makes_a_silent_no_op_client() {
        env::remove_var("NOTIFY_SOCKET");
        let notify = SdNotify::from_env();
        notify.ready(); // must not panic
        assert!(notify.watchdog_interval.is_none() || env::var("WATCHDOG_USEC").is_ok());
    }
}
