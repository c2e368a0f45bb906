#![forbid(unsafe_code)]

use super::{DistributedLockingMechanism, LockRequest};
use crate::ScopeError;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Condvar, Mutex};
use std::time::Instant;
use tracing::{debug, warn};
use uow_core::ids::TreeId;
use uow_core::{LockId, LockMode};

#[derive(Debug, Default)]
struct LockSlot {
    writer: Option<TreeId>,
    readers: BTreeSet<TreeId>,
}

impl LockSlot {
    fn grants(&self, tree: TreeId, mode: LockMode) -> bool {
        let writer_ok = self.writer.is_none_or(|holder| holder == tree);
        match mode {
            LockMode::Read => writer_ok,
            LockMode::Write => writer_ok && self.readers.iter().all(|reader| *reader == tree),
        }
    }

    fn take(&mut self, tree: TreeId, mode: LockMode) {
        match mode {
            LockMode::Read => {
                if self.writer != Some(tree) {
                    self.readers.insert(tree);
                }
            }
            LockMode::Write => {
                self.readers.remove(&tree);
                self.writer = Some(tree);
            }
        }
    }

    fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

/// In-process shared/exclusive lock table.
///
/// Only correct when one process owns the database: nothing here is visible
/// to other processes. Holders are tracked per tree, so a tree never blocks on
/// itself and a read lock it holds upgrades in place.
#[derive(Debug)]
pub struct LocalLockingMechanism {
    registry: BTreeSet<LockId>,
    table: Mutex<HashMap<LockId, LockSlot>>,
    released: Condvar,
}

impl LocalLockingMechanism {
    /// Builds a lock table that accepts exactly the ids in `registry`.
    pub fn from_registry(registry: impl IntoIterator<Item = LockId>) -> Self {
        Self {
            registry: registry.into_iter().collect(),
            table: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Number of trees currently holding `id`, in any mode.
    pub fn holder_count(&self, id: LockId) -> usize {
        let Ok(table) = self.table.lock() else {
            return 0;
        };
        table.get(&id).map_or(0, |slot| {
            slot.readers.len() + usize::from(slot.writer.is_some())
        })
    }

    fn lock(&self, request: &LockRequest<'_>, mode: LockMode) -> Result<(), ScopeError> {
        if !self.registry.contains(&request.id) {
            return Err(ScopeError::UnknownLockTarget { id: request.id });
        }

        let started = Instant::now();
        let deadline = started + request.timeout;
        let mut table = self.table.lock().map_err(|_| ScopeError::LockPoisoned)?;
        loop {
            let slot = table.entry(request.id).or_default();
            if slot.grants(request.tree, mode) {
                slot.take(request.tree, mode);
                debug!(tree = %request.tree, id = %request.id, %mode, "local lock granted");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = started.elapsed();
                warn!(tree = %request.tree, id = %request.id, %mode, ?waited, "lock wait timed out");
                return Err(ScopeError::LockTimeout {
                    id: request.id,
                    mode,
                    waited,
                });
            }
            let (guard, _) = self
                .released
                .wait_timeout(table, deadline - now)
                .map_err(|_| ScopeError::LockPoisoned)?;
            table = guard;
        }
    }
}

impl DistributedLockingMechanism for LocalLockingMechanism {
    fn name(&self) -> &'static str {
        "local"
    }

    fn read_lock(&self, request: &LockRequest<'_>) -> Result<(), ScopeError> {
        self.lock(request, LockMode::Read)
    }

    fn write_lock(&self, request: &LockRequest<'_>) -> Result<(), ScopeError> {
        self.lock(request, LockMode::Write)
    }

    fn release_all(&self, tree: TreeId) {
        let mut table = match self.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        for slot in table.values_mut() {
            if slot.writer == Some(tree) {
                slot.writer = None;
            }
            slot.readers.remove(&tree);
        }
        table.retain(|_, slot| !slot.is_free());
        drop(table);
        self.released.notify_all();
    }
}
