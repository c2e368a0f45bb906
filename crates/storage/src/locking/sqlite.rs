#![forbid(unsafe_code)]

use super::{DistributedLockingMechanism, LockRequest};
use crate::ScopeError;
use crate::error::is_busy;
use rusqlite::{OptionalExtension, params};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uow_core::ids::TreeId;
use uow_core::LockMode;

/// Row-based locks in the shared database file.
///
/// Trees served by this mechanism begin with `BEGIN IMMEDIATE`, so every tree
/// that touches the database holds SQLite's write reservation until it ends
/// and trees in all processes sharing the file run one at a time. A read lock
/// proves the row exists and reads it from the tree's stable snapshot. A
/// write lock rewrites the row. Waiting is bounded by the busy timeout, set
/// to the request's timeout for the duration of the statement.
#[derive(Debug)]
pub struct SqliteLockingMechanism {
    busy_timeout: Duration,
}

impl SqliteLockingMechanism {
    /// `busy_timeout` is restored on the connection after each acquisition.
    pub fn new(busy_timeout: Duration) -> Self {
        Self { busy_timeout }
    }

    fn with_timeout<T>(
        &self,
        request: &LockRequest<'_>,
        mode: LockMode,
        op: impl FnOnce() -> rusqlite::Result<T>,
    ) -> Result<T, ScopeError> {
        request.connection.busy_timeout(request.timeout)?;
        let started = Instant::now();
        let result = op();
        request.connection.busy_timeout(self.busy_timeout)?;
        result.map_err(|err| {
            if is_busy(&err) {
                let waited = started.elapsed();
                warn!(tree = %request.tree, id = %request.id, %mode, ?waited, "lock wait timed out");
                ScopeError::LockTimeout {
                    id: request.id,
                    mode,
                    waited,
                }
            } else {
                ScopeError::Sql(err)
            }
        })
    }
}

impl DistributedLockingMechanism for SqliteLockingMechanism {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn read_lock(&self, request: &LockRequest<'_>) -> Result<(), ScopeError> {
        let row = self.with_timeout(request, LockMode::Read, || {
            request
                .connection
                .query_row(
                    "SELECT value FROM locks WHERE id=?1",
                    params![request.id.get()],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
        })?;
        if row.is_none() {
            return Err(ScopeError::UnknownLockTarget { id: request.id });
        }
        debug!(tree = %request.tree, id = %request.id, "read lock granted");
        Ok(())
    }

    fn write_lock(&self, request: &LockRequest<'_>) -> Result<(), ScopeError> {
        let updated = self.with_timeout(request, LockMode::Write, || {
            request.connection.execute(
                "UPDATE locks SET value = (CASE WHEN (value=1) THEN -1 ELSE 1 END) WHERE id=?1",
                params![request.id.get()],
            )
        })?;
        if updated == 0 {
            return Err(ScopeError::UnknownLockTarget { id: request.id });
        }
        debug!(tree = %request.tree, id = %request.id, "write lock granted");
        Ok(())
    }

    fn release_all(&self, _tree: TreeId) {
        // The database releases row locks when the transaction ends.
    }

    fn begins_immediate(&self) -> bool {
        true
    }
}
