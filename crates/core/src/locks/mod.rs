#![forbid(unsafe_code)]

//! Lock identifiers, the registry of well-known locks and lock modes.

mod registry;

pub use registry::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Identifier of one logical, lockable resource.
///
/// Ordering is numeric; multi-id acquisition always walks ids in ascending
/// order so that every acquirer agrees on one global order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(i32);

impl LockId {
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub fn get(self) -> i32 {
        self.0
    }

    /// Name of the registry entry, `None` for ids outside the registry.
    pub fn registered_name(self) -> Option<&'static str> {
        REGISTRY
            .iter()
            .find(|(id, _)| *id == self)
            .map(|(_, name)| *name)
    }

    pub fn is_registered(self) -> bool {
        self.registered_name().is_some()
    }

    /// Parses either a raw integer (`-331`) or a registry name (`servers`).
    pub fn parse(value: &str) -> Result<Self, LockIdError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(LockIdError::Empty);
        }
        if let Ok(raw) = value.parse::<i32>() {
            return Ok(Self(raw));
        }
        let lowered = value.to_ascii_lowercase().replace('_', "-");
        REGISTRY
            .iter()
            .find(|(_, name)| *name == lowered)
            .map(|(id, _)| *id)
            .ok_or_else(|| LockIdError::UnknownName(value.to_string()))
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.registered_name() {
            Some(name) => write!(f, "{}({name})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

impl std::str::FromStr for LockId {
    type Err = LockIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LockIdError {
    #[error("lock id must not be empty")]
    Empty,
    #[error("unknown lock name: {0}")]
    UnknownName(String),
}

/// Strength of a lock request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Shared with other readers.
    Read,
    /// Exclusive.
    Write,
}

impl LockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
        }
    }

    /// Whether a lock already held in `self` mode satisfies a request for `requested`.
    pub fn satisfies(self, requested: LockMode) -> bool {
        self >= requested
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockEntry {
    pub id: LockId,
    pub mode: LockMode,
}

impl LockEntry {
    pub fn read(id: LockId) -> Self {
        Self {
            id,
            mode: LockMode::Read,
        }
    }

    pub fn write(id: LockId) -> Self {
        Self {
            id,
            mode: LockMode::Write,
        }
    }
}

/// Merges `entries` into one entry per id, keeping the strongest mode, in
/// acquisition order (ascending id).
pub fn acquisition_order(entries: &[LockEntry]) -> Vec<LockEntry> {
    let mut merged = BTreeMap::<LockId, LockMode>::new();
    for entry in entries {
        merged
            .entry(entry.id)
            .and_modify(|mode| *mode = (*mode).max(entry.mode))
            .or_insert(entry.mode);
    }
    merged
        .into_iter()
        .map(|(id, mode)| LockEntry { id, mode })
        .collect()
}

#[cfg(test)]
mod tests;
