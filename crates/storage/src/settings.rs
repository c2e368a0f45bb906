#![forbid(unsafe_code)]

use crate::ScopeError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uow_core::IsolationLevel;

const DEFAULT_DB_FILE: &str = "uow.db";

/// Which lock manager backs `read_lock`/`write_lock`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingBackend {
    /// Lock rows in the shared database file; visible to every process using it.
    #[default]
    Sqlite,
    /// In-process lock table; only valid when a single process owns the database.
    Local,
}

impl LockingBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Some(Self::Sqlite),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: PathBuf,
    pub busy_timeout_ms: u64,
    pub read_lock_timeout_ms: u64,
    pub write_lock_timeout_ms: u64,
    pub default_isolation: IsolationLevel,
    pub locking: LockingBackend,
    pub install_missing_schema: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DB_FILE),
            busy_timeout_ms: 5_000,
            read_lock_timeout_ms: 60_000,
            write_lock_timeout_ms: 5_000,
            default_isolation: IsolationLevel::ReadCommitted,
            locking: LockingBackend::Sqlite,
            install_missing_schema: true,
        }
    }
}

impl Settings {
    pub fn for_database(path: impl AsRef<Path>) -> Self {
        Self {
            database_path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ScopeError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&raw).map_err(|err| {
            ScopeError::InvalidInput(format!(
                "settings file {}: {err}",
                path.as_ref().display()
            ))
        })
    }

    /// Overrides fields from `UOW_*` environment variables.
    pub fn apply_env(self) -> Result<Self, ScopeError> {
        self.apply_vars(env_var)
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, ScopeError> {
        if let Some(path) = var("UOW_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(raw) = var("UOW_BUSY_TIMEOUT_MS") {
            self.busy_timeout_ms = parse_ms("UOW_BUSY_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = var("UOW_READ_LOCK_TIMEOUT_MS") {
            self.read_lock_timeout_ms = parse_ms("UOW_READ_LOCK_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = var("UOW_WRITE_LOCK_TIMEOUT_MS") {
            self.write_lock_timeout_ms = parse_ms("UOW_WRITE_LOCK_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = var("UOW_DEFAULT_ISOLATION") {
            self.default_isolation = raw
                .parse()
                .map_err(|err| ScopeError::InvalidInput(format!("UOW_DEFAULT_ISOLATION: {err}")))?;
        }
        if let Some(raw) = var("UOW_LOCKING") {
            self.locking = LockingBackend::parse(&raw).ok_or_else(|| {
                ScopeError::InvalidInput(format!("UOW_LOCKING: expected sqlite|local, got {raw}"))
            })?;
        }
        if let Some(raw) = var("UOW_INSTALL_MISSING_SCHEMA") {
            self.install_missing_schema = matches!(raw.as_str(), "1" | "true" | "yes");
        }
        Ok(self)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn read_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.read_lock_timeout_ms)
    }

    pub fn write_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.write_lock_timeout_ms)
    }

    /// Isolation a root scope runs with when it requested none.
    pub fn root_isolation(&self, requested: IsolationLevel) -> IsolationLevel {
        if requested.is_specified() {
            requested
        } else if self.default_isolation.is_specified() {
            self.default_isolation
        } else {
            IsolationLevel::ReadCommitted
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_ms(name: &str, raw: &str) -> Result<u64, ScopeError> {
    raw.parse::<u64>()
        .map_err(|_| ScopeError::InvalidInput(format!("{name}: expected milliseconds, got {raw}")))
}
