#![forbid(unsafe_code)]

use super::{ScopeOptions, ScopeOutcome};
use crate::locking::{DistributedLockingMechanism, LockRequest};
use crate::error::is_busy;
use crate::transaction::TransactionHandle;
use crate::{ScopeError, Settings};
use rusqlite::Connection;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uow_core::ids::{ScopeId, TreeId};
use uow_core::locks::acquisition_order;
use uow_core::{IsolationLevel, LockEntry, LockId, LockMode, RepositoryCacheMode};

/// State shared by every scope of one tree: the transaction, the effective
/// configuration, the locks taken so far and the completion veto.
pub(crate) struct ScopeTree {
    id: TreeId,
    handle: RefCell<Option<TransactionHandle>>,
    isolation: Cell<IsolationLevel>,
    cache_mode: RepositoryCacheMode,
    scope_file_systems: bool,
    held: RefCell<BTreeMap<LockId, LockMode>>,
    vetoed_by: Cell<Option<ScopeId>>,
    locking: Arc<dyn DistributedLockingMechanism>,
    immediate: bool,
    busy_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl ScopeTree {
    pub(crate) fn new(
        conn: Connection,
        options: &ScopeOptions,
        settings: &Settings,
        locking: Arc<dyn DistributedLockingMechanism>,
    ) -> Self {
        let id = TreeId::next();
        Self {
            id,
            handle: RefCell::new(Some(TransactionHandle::new(id, conn))),
            isolation: Cell::new(settings.root_isolation(options.isolation_level)),
            cache_mode: options.cache_mode.resolved(),
            scope_file_systems: options.scope_file_systems.unwrap_or(false),
            held: RefCell::new(BTreeMap::new()),
            vetoed_by: Cell::new(None),
            immediate: locking.begins_immediate(),
            locking,
            busy_timeout: settings.busy_timeout(),
            read_timeout: settings.read_lock_timeout(),
            write_timeout: settings.write_lock_timeout(),
        }
    }

    pub(crate) fn id(&self) -> TreeId {
        self.id
    }

    pub(crate) fn isolation(&self) -> IsolationLevel {
        self.isolation.get()
    }

    pub(crate) fn cache_mode(&self) -> RepositoryCacheMode {
        self.cache_mode
    }

    pub(crate) fn scope_file_systems(&self) -> bool {
        self.scope_file_systems
    }

    pub(crate) fn held_locks(&self) -> BTreeMap<LockId, LockMode> {
        self.held.borrow().clone()
    }

    pub(crate) fn is_vetoed(&self) -> bool {
        self.vetoed_by.get().is_some()
    }

    /// Checks a nested scope's explicit options against the tree. Stricter
    /// isolation is adopted while the transaction has not started and is a
    /// conflict afterwards; weaker isolation is ignored. Any other explicit
    /// difference is a conflict.
    pub(crate) fn join(&self, options: &ScopeOptions) -> Result<(), ScopeError> {
        if options.cache_mode.is_specified() && options.cache_mode != self.cache_mode {
            return Err(ScopeError::ConfigurationConflict {
                option: "repository_cache_mode",
                established: self.cache_mode.to_string(),
                requested: options.cache_mode.to_string(),
            });
        }
        if let Some(requested) = options.scope_file_systems {
            if requested != self.scope_file_systems {
                return Err(ScopeError::ConfigurationConflict {
                    option: "scope_file_systems",
                    established: self.scope_file_systems.to_string(),
                    requested: requested.to_string(),
                });
            }
        }

        let current = self.isolation.get();
        let effective = current.tightened_by(options.isolation_level);
        if effective != current && self.is_started() {
            return Err(ScopeError::ConfigurationConflict {
                option: "isolation_level",
                established: current.to_string(),
                requested: options.isolation_level.to_string(),
            });
        }
        if effective != current {
            debug!(tree = %self.id, from = %current, to = %effective, "isolation raised by nested scope");
            self.isolation.set(effective);
        } else if options.isolation_level.is_specified() && options.isolation_level < current {
            debug!(
                tree = %self.id,
                requested = %options.isolation_level,
                kept = %current,
                "weaker isolation request ignored"
            );
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.handle
            .borrow()
            .as_ref()
            .is_some_and(TransactionHandle::is_active)
    }

    /// Runs `f` against the connection inside the running transaction,
    /// starting the transaction first if needed.
    pub(crate) fn with_connection<R>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R, ScopeError>,
    ) -> Result<R, ScopeError> {
        self.begin(None)?;
        let slot = self.handle.borrow();
        let handle = slot.as_ref().ok_or_else(|| self.ended())?;
        f(handle.connection())
    }

    /// Starts the transaction unless it is running. When a lock acquisition
    /// triggers the start, the wait for the database is bounded by that
    /// lock's timeout and a busy database is reported as its timeout.
    fn begin(&self, trigger: Option<(LockEntry, Duration)>) -> Result<(), ScopeError> {
        match self.handle.borrow().as_ref() {
            Some(handle) if handle.is_active() => return Ok(()),
            Some(_) => {}
            None => return Err(self.ended()),
        }
        let mut slot = self.handle.borrow_mut();
        let handle = slot.as_mut().ok_or_else(|| self.ended())?;
        let isolation = self.isolation.get();
        let Some((LockEntry { id, mode }, timeout)) = trigger else {
            return handle.begin(isolation, self.immediate);
        };

        handle.connection().busy_timeout(timeout)?;
        let started = Instant::now();
        let result = handle.begin(isolation, self.immediate);
        handle.connection().busy_timeout(self.busy_timeout)?;
        match result {
            Err(ScopeError::Sql(err)) if is_busy(&err) => {
                let waited = started.elapsed();
                warn!(tree = %self.id, %id, %mode, ?waited, "lock wait timed out before the transaction started");
                Err(ScopeError::LockTimeout { id, mode, waited })
            }
            other => other,
        }
    }

    fn ended(&self) -> ScopeError {
        ScopeError::InvalidInput(format!("transaction of {} has already ended", self.id))
    }

    /// Acquires `entries` in ascending id order, skipping those the tree
    /// already holds at sufficient strength.
    pub(crate) fn acquire(
        &self,
        entries: &[LockEntry],
        timeout: Option<Duration>,
    ) -> Result<(), ScopeError> {
        for LockEntry { id, mode } in acquisition_order(entries) {
            let already = self.held.borrow().get(&id).copied();
            if already.is_some_and(|held| held.satisfies(mode)) {
                continue;
            }
            let timeout = timeout.unwrap_or(match mode {
                LockMode::Read => self.read_timeout,
                LockMode::Write => self.write_timeout,
            });
            self.begin(Some((LockEntry { id, mode }, timeout)))?;
            self.with_connection(|connection| {
                let request = LockRequest {
                    tree: self.id,
                    id,
                    timeout,
                    connection,
                };
                self.locking.acquire(&request, mode)
            })?;
            self.held.borrow_mut().insert(id, mode);
        }
        Ok(())
    }

    pub(crate) fn veto(&self, scope: ScopeId) {
        if self.vetoed_by.get().is_none() {
            debug!(tree = %self.id, %scope, "nested scope disposed without completing; tree will roll back");
            self.vetoed_by.set(Some(scope));
        }
    }

    /// Ends the transaction. Commits only when the root completed and no
    /// scope of the tree vetoed; releases every lock either way.
    pub(crate) fn finish(&self, root_completed: bool) -> Result<ScopeOutcome, ScopeError> {
        let commit = root_completed && !self.is_vetoed();
        let handle = self.handle.borrow_mut().take();
        let result = match handle {
            Some(handle) if commit => handle.commit(),
            Some(handle) => handle.rollback(),
            None => Ok(()),
        };
        self.locking.release_all(self.id);
        let released = std::mem::take(&mut *self.held.borrow_mut());

        result?;
        if commit {
            info!(tree = %self.id, locks = released.len(), "transaction committed");
            Ok(ScopeOutcome::Committed)
        } else {
            match self.vetoed_by.get() {
                Some(scope) => warn!(tree = %self.id, vetoed_by = %scope, "transaction rolled back"),
                None => info!(tree = %self.id, "transaction rolled back"),
            }
            Ok(ScopeOutcome::RolledBack)
        }
    }
}

impl Drop for ScopeTree {
    fn drop(&mut self) {
        if self.handle.get_mut().is_some() {
            warn!(tree = %self.id, "scope tree dropped before its root was disposed; rolling back");
            self.handle.get_mut().take();
            self.locking.release_all(self.id);
        }
    }
}
