// boltd - Thunderbolt/USB4 device authorization daemon
//
// Error taxonomy shared by every component. Each variant is the Rust home
// of one of the wire-visible error kinds; the D-Bus name mapping
// (`org.freedesktop.bolt.Error.*`) lives in `bus::wire`, not here, so that
// this module stays free of D-Bus concerns.

use crate::types::Uid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Uncategorized failure. Never returned where a more specific kind applies.
    #[error("{0}")]
    Failed(String),

    #[error("udev error: {0}")]
    Udev(#[source] std::io::Error),

    #[error("no key material for device {uid}")]
    NoKey { uid: Uid },

    #[error("bad key for device {uid}: {reason}")]
    BadKey { uid: Uid, reason: String },

    #[error("invalid configuration: {0}")]
    Cfg(String),

    #[error("invalid operation in state {state} for device {uid}")]
    BadState { uid: Uid, state: &'static str },

    #[error("parent device in authorization chain failed: {uid}")]
    AuthChain { uid: Uid },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("access denied")]
    AccessDenied,
}

impl Error {
    /// Short wire-visible kind name, e.g. `bad_state`. Used both for the
    /// D-Bus error name suffix and for CLI diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Failed(_) => "failed",
            Error::Udev(_) => "udev",
            Error::NoKey { .. } => "no_key",
            Error::BadKey { .. } => "bad_key",
            Error::Cfg(_) => "cfg",
            Error::BadState { .. } => "bad_state",
            Error::AuthChain { .. } => "authchain",
            Error::NotFound(_) => "not_found",
            Error::Exists(_) => "exists",
            Error::Cancelled => "cancelled",
            Error::AccessDenied => "access_denied",
        }
    }

    pub fn is_bad_state(&self) -> bool {
        matches!(self, Error::BadState { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Udev(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Failed(e.to_string())
    }
}
