#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transaction isolation, ordered from weakest to strictest.
///
/// `Unspecified` means "inherit": from the parent scope, or from the
/// configured default for a root scope.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    Unspecified,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::ReadUncommitted => "read_uncommitted",
            Self::ReadCommitted => "read_committed",
            Self::RepeatableRead => "repeatable_read",
            Self::Serializable => "serializable",
        }
    }

    pub fn is_specified(self) -> bool {
        self != Self::Unspecified
    }

    /// Level in effect after a nested request: stricter requests win, weaker
    /// or unspecified ones leave the current level alone.
    pub fn tightened_by(self, requested: IsolationLevel) -> IsolationLevel {
        self.max(requested)
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = OptionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "" | "unspecified" => Ok(Self::Unspecified),
            "read_uncommitted" => Ok(Self::ReadUncommitted),
            "read_committed" => Ok(Self::ReadCommitted),
            "repeatable_read" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            _ => Err(OptionParseError::IsolationLevel(s.to_string())),
        }
    }
}

/// How repositories cache entities for the lifetime of a scope tree.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryCacheMode {
    #[default]
    Unspecified,
    /// Shared, process-wide caches.
    Default,
    /// Caches isolated to the scope tree, flushed into the global ones on commit.
    Scoped,
    /// No caching at all.
    None,
}

impl RepositoryCacheMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Default => "default",
            Self::Scoped => "scoped",
            Self::None => "none",
        }
    }

    pub fn is_specified(self) -> bool {
        self != Self::Unspecified
    }

    /// Mode a root scope runs with when the caller left it unspecified.
    pub fn resolved(self) -> RepositoryCacheMode {
        match self {
            Self::Unspecified => Self::Default,
            other => other,
        }
    }
}

impl std::fmt::Display for RepositoryCacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RepositoryCacheMode {
    type Err = OptionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "unspecified" => Ok(Self::Unspecified),
            "default" => Ok(Self::Default),
            "scoped" => Ok(Self::Scoped),
            "none" => Ok(Self::None),
            _ => Err(OptionParseError::CacheMode(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum OptionParseError {
    #[error("invalid isolation level: {0}")]
    IsolationLevel(String),
    #[error("invalid repository cache mode: {0}")]
    CacheMode(String),
}
