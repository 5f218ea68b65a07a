use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown role '{0}'")]
pub struct RoleParseError(pub String);

/// Per-room role. Ordering is defined by [`ChatroomRole::ordinal`], never by
/// how a storage backend happens to sort the labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatroomRole {
    Member,
    Manage,
}

impl ChatroomRole {
    pub const fn ordinal(self) -> u8 {
        match self {
            ChatroomRole::Member => 0,
            ChatroomRole::Manage => 1,
        }
    }

    pub fn at_least(self, required: ChatroomRole) -> bool {
        self.ordinal() >= required.ordinal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatroomRole::Member => "member",
            ChatroomRole::Manage => "manage",
        }
    }
}

impl PartialOrd for ChatroomRole {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChatroomRole {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordinal().cmp(&other.ordinal())
    }
}

impl FromStr for ChatroomRole {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "member" => Ok(ChatroomRole::Member),
            "manage" => Ok(ChatroomRole::Manage),
            other => Err(RoleParseError(other.to_string())),
        }
    }
}

impl TryFrom<String> for ChatroomRole {
    type Error = RoleParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ChatroomRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-wide role of an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemRole {
    #[default]
    User,
    Admin,
}

impl SystemRole {
    pub fn is_admin(self) -> bool {
        matches!(self, SystemRole::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemRole::User => "user",
            SystemRole::Admin => "admin",
        }
    }
}

impl FromStr for SystemRole {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(SystemRole::User),
            "admin" => Ok(SystemRole::Admin),
            other => Err(RoleParseError(other.to_string())),
        }
    }
}

impl TryFrom<String> for SystemRole {
    type Error = RoleParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for SystemRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
