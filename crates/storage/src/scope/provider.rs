#![forbid(unsafe_code)]

use super::ScopeContext;
use crate::locking::{DistributedLockingMechanism, LocalLockingMechanism, SqliteLockingMechanism};
use crate::schema;
use crate::{LockingBackend, ScopeError, Settings};
use rusqlite::Connection;
use std::sync::Arc;
use tracing::info;
use uow_core::locks::registered_ids;

struct ProviderShared {
    settings: Settings,
    locking: Arc<dyn DistributedLockingMechanism>,
}

/// Process-wide entry point: settings plus the lock manager. Cheap to clone
/// and safe to share between threads; each thread opens its own
/// [`ScopeContext`].
#[derive(Clone)]
pub struct ScopeProvider {
    shared: Arc<ProviderShared>,
}

impl ScopeProvider {
    /// Checks connectivity, installs the core schema when it is missing and
    /// `install_missing_schema` is set, and builds the configured lock manager.
    pub fn open(settings: Settings) -> Result<Self, ScopeError> {
        let conn = Self::prepare(&settings)?;
        let locking: Arc<dyn DistributedLockingMechanism> = match settings.locking {
            LockingBackend::Sqlite => Arc::new(SqliteLockingMechanism::new(settings.busy_timeout())),
            LockingBackend::Local => {
                let ids = if schema::table_exists(&conn, "locks")? {
                    schema::registered_lock_ids(&conn)?
                } else {
                    registered_ids().collect()
                };
                Arc::new(LocalLockingMechanism::from_registry(ids))
            }
        };
        drop(conn);
        Ok(Self::build(settings, locking))
    }

    /// Like [`ScopeProvider::open`], with a caller-supplied lock manager.
    pub fn with_locking(
        settings: Settings,
        locking: Arc<dyn DistributedLockingMechanism>,
    ) -> Result<Self, ScopeError> {
        Self::prepare(&settings)?;
        Ok(Self::build(settings, locking))
    }

    fn prepare(settings: &Settings) -> Result<Connection, ScopeError> {
        let conn = schema::open_connection(settings)?;
        if settings.install_missing_schema && !schema::validate(&conn)?.is_installed() {
            schema::install(&conn)?;
            info!(db = %settings.database_path.display(), "installed core schema");
        }
        Ok(conn)
    }

    fn build(settings: Settings, locking: Arc<dyn DistributedLockingMechanism>) -> Self {
        info!(
            db = %settings.database_path.display(),
            locking = locking.name(),
            "scope provider ready"
        );
        Self {
            shared: Arc::new(ProviderShared { settings, locking }),
        }
    }

    /// A fresh, empty scope stack for the calling thread.
    pub fn context(&self) -> ScopeContext {
        ScopeContext::new(self.clone())
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn locking(&self) -> Arc<dyn DistributedLockingMechanism> {
        Arc::clone(&self.shared.locking)
    }

    pub(crate) fn connect(&self) -> Result<Connection, ScopeError> {
        schema::open_connection(&self.shared.settings)
    }
}

impl std::fmt::Debug for ScopeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeProvider")
            .field("database_path", &self.shared.settings.database_path)
            .field("locking", &self.shared.locking.name())
            .finish()
    }
}
