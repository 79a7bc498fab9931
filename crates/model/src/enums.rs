//! Device enumerations and their canonical token strings.
//!
//! Every enumeration has exactly one static table mapping each variant to
//! its token. The same table drives `as_str()`, `FromStr` and serde, so the
//! persisted form and the parsed form can never drift apart.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

fn token_of<T: Copy + PartialEq>(table: &'static [(T, &'static str)], value: T) -> &'static str {
    table
        .iter()
        .find(|(v, _)| *v == value)
        .map(|(_, name)| *name)
        .unwrap_or("unknown")
}

fn parse_token<T: Copy>(
    table: &'static [(T, &'static str)],
    kind: &'static str,
    token: &str,
) -> Result<T, Error> {
    table
        .iter()
        .find(|(_, name)| *name == token)
        .map(|(v, _)| *v)
        .ok_or_else(|| Error::InvalidToken {
            kind,
            token: token.to_string(),
        })
}

/// Current authorization level of an attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AuthLevel {
    /// Level could not be determined (or the device is detached).
    #[default]
    Unknown,
    /// Device is attached but has no bus access.
    Unauthorized,
    /// Device has been granted bus access.
    Authorized,
    /// Device has been granted access via key verification.
    AuthorizedSecure,
}

const AUTH_LEVEL_NAMES: &[(AuthLevel, &str)] = &[
    (AuthLevel::Unknown, "unknown"),
    (AuthLevel::Unauthorized, "unauthorized"),
    (AuthLevel::Authorized, "authorized"),
    (AuthLevel::AuthorizedSecure, "secure"),
];

impl AuthLevel {
    /// Maps the integer read from the sysfs `authorized` attribute.
    pub fn from_sysfs(level: i64) -> Self {
        match level {
            0 => AuthLevel::Unauthorized,
            1 => AuthLevel::Authorized,
            2 => AuthLevel::AuthorizedSecure,
            _ => AuthLevel::Unknown,
        }
    }

    /// Returns the canonical token.
    pub fn as_str(&self) -> &'static str {
        token_of(AUTH_LEVEL_NAMES, *self)
    }

    /// True for both authorized levels.
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthLevel::Authorized | AuthLevel::AuthorizedSecure)
    }
}

/// Persisted user decision for future sightings of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Policy {
    /// No decision recorded.
    #[default]
    Unknown,
    /// Authorize only on explicit request.
    Manual,
    /// Authorize automatically whenever the device shows up.
    Auto,
}

const POLICY_NAMES: &[(Policy, &str)] = &[
    (Policy::Unknown, "unknown"),
    (Policy::Manual, "manual"),
    (Policy::Auto, "auto"),
];

impl Policy {
    /// Returns the canonical token.
    pub fn as_str(&self) -> &'static str {
        token_of(POLICY_NAMES, *self)
    }
}

/// Security mode of the (single) domain controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Security {
    /// Not yet read from the controller.
    #[default]
    Unknown,
    /// Every device is connected by firmware.
    None,
    /// Only display port tunnels are created.
    DpOnly,
    /// Devices need explicit authorization.
    User,
    /// Devices need authorization and may be verified by key.
    Secure,
}

const SECURITY_NAMES: &[(Security, &str)] = &[
    (Security::Unknown, "unknown"),
    (Security::None, "none"),
    (Security::DpOnly, "dponly"),
    (Security::User, "user"),
    (Security::Secure, "secure"),
];

impl Security {
    /// Returns the canonical token.
    pub fn as_str(&self) -> &'static str {
        token_of(SECURITY_NAMES, *self)
    }

    /// Whether devices on this domain need an authorization write at all.
    pub fn requires_authorization(&self) -> bool {
        !matches!(self, Security::None | Security::DpOnly)
    }
}

macro_rules! impl_token_traits {
    ($ty:ty, $table:expr, $kind:literal) => {
        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_token($table, $kind, s)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.as_str().to_string()
            }
        }

        impl TryFrom<String> for $ty {
            type Error = Error;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

impl_token_traits!(AuthLevel, AUTH_LEVEL_NAMES, "authorization level");
impl_token_traits!(Policy, POLICY_NAMES, "policy");
impl_token_traits!(Security, SECURITY_NAMES, "security");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_tokens_are_bidirectional() {
        for (policy, token) in POLICY_NAMES {
            assert_eq!(policy.as_str(), *token);
            assert_eq!(token.parse::<Policy>().unwrap(), *policy);
        }
    }

    #[test]
    fn test_security_tokens_are_bidirectional() {
        for (security, token) in SECURITY_NAMES {
            assert_eq!(security.as_str(), *token);
            assert_eq!(token.parse::<Security>().unwrap(), *security);
        }
    }

    #[test]
    fn test_unknown_token_is_rejected() {
        let err = "sometimes".parse::<Policy>().unwrap_err();
        assert!(matches!(err, Error::InvalidToken { kind: "policy", .. }));
    }

    #[test]
    fn test_auth_level_from_sysfs() {
        assert_eq!(AuthLevel::from_sysfs(0), AuthLevel::Unauthorized);
        assert_eq!(AuthLevel::from_sysfs(1), AuthLevel::Authorized);
        assert_eq!(AuthLevel::from_sysfs(2), AuthLevel::AuthorizedSecure);
        assert_eq!(AuthLevel::from_sysfs(3), AuthLevel::Unknown);
        assert_eq!(AuthLevel::from_sysfs(-1), AuthLevel::Unknown);
    }

    #[test]
    fn test_security_requires_authorization() {
        assert!(!Security::None.requires_authorization());
        assert!(!Security::DpOnly.requires_authorization());
        assert!(Security::User.requires_authorization());
        assert!(Security::Secure.requires_authorization());
        assert!(Security::Unknown.requires_authorization());
    }

    #[test]
    fn test_policy_serde_uses_tokens() {
        let json = serde_json::to_string(&Policy::Auto).unwrap();
        assert_eq!(json, "\"auto\"");

        let policy: Policy = serde_json::from_str("\"manual\"").unwrap();
        assert_eq!(policy, Policy::Manual);

        assert!(serde_json::from_str::<Policy>("\"bogus\"").is_err());
    }

    #[test]
    fn test_default_is_unknown() {
        assert_eq!(Policy::default(), Policy::Unknown);
        assert_eq!(AuthLevel::default(), AuthLevel::Unknown);
        assert_eq!(Security::default(), Security::Unknown);
    }
}
