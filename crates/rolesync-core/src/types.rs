//! Strong type definitions for rolesync.
//!
//! Identifiers are newtypes to prevent mixing up subjects, hosts and
//! content types at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Maximum encoded length of any identifier (it is `u8`-length-prefixed).
pub const MAX_IDENTIFIER_LEN: usize = 255;

fn validate(s: &str) -> Result<(), CoreError> {
    if s.is_empty() || s.len() > MAX_IDENTIFIER_LEN {
        return Err(CoreError::InvalidIdentifier(format!(
            "length {} outside 1..={}",
            s.len(),
            MAX_IDENTIFIER_LEN
        )));
    }
    if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CoreError::InvalidIdentifier(format!("{s:?} contains whitespace")));
    }
    Ok(())
}

/// The identifier of an identity: `name@host` for identities hosted on a
/// server, or a bare host name for the host identity itself.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Create a validated identifier.
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        validate(&s)?;
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host responsible for this identity.
    pub fn host(&self) -> HostIdentifier {
        match self.0.rsplit_once('@') {
            Some((_, host)) if !host.is_empty() => HostIdentifier(host.to_string()),
            _ => HostIdentifier(self.0.clone()),
        }
    }

    /// Whether this identifier denotes a host rather than a hosted identity.
    pub fn is_host(&self) -> bool {
        !self.0.contains('@')
    }
}

/// The identifier of a host server.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostIdentifier(String);

impl HostIdentifier {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        validate(&s)?;
        if s.contains('@') {
            return Err(CoreError::InvalidIdentifier(format!("{s:?} is not a host")));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifies the shape of a content block (`name@namespace`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeIdentifier(String);

impl TypeIdentifier {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        validate(&s)?;
        Ok(Self(s))
    }

    /// Wrap a well-known constant. The constant must satisfy the identifier rules.
    pub fn from_static(s: &'static str) -> Self {
        debug_assert!(validate(s).is_ok(), "invalid static type identifier {s:?}");
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_conversions {
    ($($ty:ident),*) => {$(
        impl TryFrom<String> for $ty {
            type Error = CoreError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl From<$ty> for String {
            fn from(id: $ty) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $ty {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($ty), self.0)
            }
        }
    )*};
}

string_conversions!(Identifier, HostIdentifier, TypeIdentifier);

/// A point in time in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Time(pub i64);

impl Time {
    /// The beginning of time; the audit cursor of a service never synced.
    pub const ZERO: Self = Self(0);

    /// The current wall-clock time.
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(millis)
    }

    pub const fn millis(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Local number of a role (a client's relationship to a hosted identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleId(pub u64);

/// Number of an agent acting on behalf of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub u64);

/// Local, monotonically increasing number of a queued internal action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A role as seen by the synchronizer: its local number and the identity
/// it relates to on the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Role {
    pub id: RoleId,
    pub subject: Identifier,
}

impl Role {
    pub fn new(id: RoleId, subject: Identifier) -> Self {
        Self { id, subject }
    }
}

/// The unit of exclusive synchronization: one service of one role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub role: RoleId,
    pub service: TypeIdentifier,
}

impl ServiceKey {
    pub fn new(role: RoleId, service: TypeIdentifier) -> Self {
        Self { role, service }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "role {}/{}", self.role.0, self.service)
    }
}
