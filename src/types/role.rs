use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of a user within a workspace. ADMIN outranks MOD, which outranks USER.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Mod,
    User,
}

impl Role {
    const fn rank(self) -> u8 {
        match self {
            Role::Admin => 3,
            Role::Mod => 2,
            Role::User => 1,
        }
    }

    /// Returns true if this role grants at least the privileges of `required`.
    #[must_use]
    pub const fn at_least(self, required: Role) -> bool {
        self.rank() >= required.rank()
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Mod => "MOD",
            Role::User => "USER",
        }
    }

    /// Parses a role name, ignoring case.
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Some(Role::Admin),
            "MOD" => Some(Role::Mod),
            "USER" => Some(Role::User),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity providers supported for login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    Google,
    GitHub,
}

impl OAuthProvider {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
            OAuthProvider::GitHub => "github",
        }
    }

    pub fn parse(s: &str) -> Option<OAuthProvider> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Some(OAuthProvider::Google),
            "github" => Some(OAuthProvider::GitHub),
            _ => None,
        }
    }
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
