// boltd - Thunderbolt/USB4 device authorization daemon
//
// Pluggable authorization backend for the two-phase dispatch of spec.md
// §4.10 step 2: "emit an authorize_method/authorize_property signal whose
// first-wins accumulator yields a boolean outcome". Here that signal/
// accumulator is a trait object instead, since there is no in-process
// signal bus in this design — a caller swaps in a real polkit-style
// backend by implementing `PolicyCheck`.

use async_trait::async_trait;

use crate::error::{Error, Result};

/// What's being authorized: a method call or a property write, each
/// named after its bus-visible member.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action<'a> {
    Method { interface: &'a str, member: &'a str },
    PropertyWrite { interface: &'a str, property: &'a str },
}

#[async_trait]
pub trait PolicyCheck: Send + Sync {
    /// Runs on a worker thread (spec.md §4.10 step 2: "worker thread");
    /// may consult an external policy backend synchronously. `Ok(())`
    /// authorizes the request; `Err` (always [`Error::AccessDenied`] or a
    /// backend-specific kind) rejects it before the handler runs.
    async fn check(&self, caller: &str, action: Action<'_>) -> Result<()>;
}

/// The default, no-op backend: authorizes everything. Swapped out in
/// deployments that need a real polkit-style policy.
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyCheck for AllowAllPolicy {
    async fn check(&self, _caller: &str, _action: Action<'_>) -> Result<()> {
        Ok(())
    }
}

/// A backend that always refuses, for exercising the `access_denied` path
/// in tests without standing up a real policy service.
pub struct DenyAllPolicy;

#[async_trait]
impl PolicyCheck for DenyAllPolicy {
    async fn check(&self, _caller: &str, _action: Action<'_>) -> Result<()> {
        Err(Error::AccessDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_authorizes_every_action() {
        let policy = AllowAllPolicy;
        let action = Action::Method {
            interface: "org.freedesktop.bolt1.Manager",
            member: "EnrollDevice",
        };
        assert!(policy.check("caller", action).await.is_ok());
    }

    #[tokio::test]
    async fn deny_all_rejects_with_access_denied() {
        let policy = DenyAllPolicy;
        let action = Action::PropertyWrite {
            interface: "org.freedesktop.bolt1.Device",
            property: "Policy",
        };
        let err = policy.check("caller", action).await.unwrap_err();
        assert_eq!(err.kind(), "access_denied");
    }
}
