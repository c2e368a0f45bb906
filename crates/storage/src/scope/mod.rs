#![forbid(unsafe_code)]

//! Ambient units of work.
//!
//! A [`Scope`] is created through a [`ScopeContext`], the per-task stack of
//! active scopes. The first scope on an empty stack is the root of a new tree
//! and owns its transaction; every scope created while another one is ambient
//! joins that scope's tree. Scopes are disposed in reverse creation order and
//! the root decides the outcome: commit only if it and every scope of the tree
//! completed successfully.

mod context;
mod provider;
mod tree;

pub use context::ScopeContext;
pub use provider::ScopeProvider;

use crate::ScopeError;
use context::ContextInner;
use rusqlite::Connection;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error};
use tree::ScopeTree;
use uow_core::ids::{ScopeId, TreeId};
use uow_core::{IsolationLevel, LockEntry, LockId, LockMode, RepositoryCacheMode};

/// Parameters for a new scope. Defaults inherit everything from the ambient
/// scope (or the configured defaults for a root).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScopeOptions {
    pub isolation_level: IsolationLevel,
    pub cache_mode: RepositoryCacheMode,
    pub scope_file_systems: Option<bool>,
    /// Register the scope in the task context even when nested; inherited by children.
    pub call_context: bool,
    /// Treat disposal without `complete` as success. Read-only work only.
    pub auto_complete: bool,
}

impl ScopeOptions {
    pub fn auto_complete() -> Self {
        Self {
            auto_complete: true,
            ..Self::default()
        }
    }

    pub fn with_isolation(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }

    pub fn with_cache_mode(mut self, cache_mode: RepositoryCacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    pub fn with_scope_file_systems(mut self, scope_file_systems: bool) -> Self {
        self.scope_file_systems = Some(scope_file_systems);
        self
    }

    pub fn with_call_context(mut self) -> Self {
        self.call_context = true;
        self
    }
}

/// What disposing a scope did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeOutcome {
    /// Nested scope: its completion was folded into the tree, nothing ended.
    Deferred,
    Committed,
    RolledBack,
    AlreadyDisposed,
}

pub(crate) struct ScopeInner {
    id: ScopeId,
    parent: Option<ScopeId>,
    tree: Rc<ScopeTree>,
    is_root: bool,
    detached: bool,
    call_context: bool,
    auto_complete: bool,
    attached: Cell<bool>,
    completed: Cell<Option<bool>>,
    disposed: Cell<bool>,
    /// Dropped while not on top of the stack; finalized as failed once it is.
    abandoned: Cell<bool>,
}

impl ScopeInner {
    fn root(tree: Rc<ScopeTree>, options: &ScopeOptions, detached: bool) -> Self {
        Self {
            id: ScopeId::next(),
            parent: None,
            tree,
            is_root: true,
            detached,
            call_context: options.call_context,
            auto_complete: options.auto_complete,
            attached: Cell::new(false),
            completed: Cell::new(None),
            disposed: Cell::new(false),
            abandoned: Cell::new(false),
        }
    }

    fn nested(parent: &ScopeInner, options: &ScopeOptions) -> Self {
        Self {
            id: ScopeId::next(),
            parent: Some(parent.id),
            tree: Rc::clone(&parent.tree),
            is_root: false,
            detached: false,
            call_context: options.call_context || parent.call_context,
            auto_complete: options.auto_complete,
            attached: Cell::new(false),
            completed: Cell::new(None),
            disposed: Cell::new(false),
            abandoned: Cell::new(false),
        }
    }

    pub(crate) fn id(&self) -> ScopeId {
        self.id
    }

    fn on_stack(&self) -> bool {
        !self.detached || self.attached.get()
    }

    fn succeeded(&self) -> bool {
        !self.abandoned.get() && self.completed.get().unwrap_or(self.auto_complete)
    }

    /// Everything disposal does after the scope left the stack.
    pub(crate) fn finalize(&self) -> Result<ScopeOutcome, ScopeError> {
        self.disposed.set(true);
        self.attached.set(false);
        let succeeded = self.succeeded();

        if !self.is_root {
            if !succeeded {
                self.tree.veto(self.id);
            }
            debug!(scope = %self.id, tree = %self.tree.id(), succeeded, "nested scope disposed");
            return Ok(ScopeOutcome::Deferred);
        }

        debug!(scope = %self.id, tree = %self.tree.id(), succeeded, "root scope disposed");
        self.tree.finish(succeeded)
    }
}

/// A unit of work. Not `Send`: a scope belongs to the task that created it.
pub struct Scope {
    inner: Rc<ScopeInner>,
    context: Rc<ContextInner>,
}

impl Scope {
    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    pub fn parent_id(&self) -> Option<ScopeId> {
        self.inner.parent
    }

    pub fn tree_id(&self) -> TreeId {
        self.inner.tree.id()
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_root
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached
    }

    pub fn is_attached(&self) -> bool {
        self.inner.attached.get()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Isolation in effect for the whole tree.
    pub fn isolation_level(&self) -> IsolationLevel {
        self.inner.tree.isolation()
    }

    pub fn cache_mode(&self) -> RepositoryCacheMode {
        self.inner.tree.cache_mode()
    }

    pub fn scope_file_systems(&self) -> bool {
        self.inner.tree.scope_file_systems()
    }

    pub fn call_context(&self) -> bool {
        self.inner.call_context
    }

    pub fn completed(&self) -> Option<bool> {
        self.inner.completed.get()
    }

    /// Locks taken so far by the tree this scope belongs to.
    pub fn held_locks(&self) -> BTreeMap<LockId, LockMode> {
        self.inner.tree.held_locks()
    }

    pub fn complete(&self) -> Result<(), ScopeError> {
        self.complete_with(true)
    }

    /// Records the completion intent. Repeating the same value is harmless;
    /// contradicting an earlier call is a caller bug.
    pub fn complete_with(&self, success: bool) -> Result<(), ScopeError> {
        if self.inner.disposed.get() {
            return Err(ScopeError::nesting(self.inner.id, "scope has been disposed"));
        }
        match self.inner.completed.get() {
            None => {
                self.inner.completed.set(Some(success));
                Ok(())
            }
            Some(first) if first == success => Ok(()),
            Some(first) => Err(ScopeError::DoubleCompletion {
                scope: self.inner.id,
                first,
                second: success,
            }),
        }
    }

    /// Takes `ids` in shared mode for the rest of the tree's transaction.
    ///
    /// What "shared" guarantees depends on the mechanism. The local mechanism
    /// excludes writers until the tree ends. The SQLite mechanism only checks
    /// the lock row and reads it from the tree's snapshot: the exclusion
    /// comes from the tree holding the database write reservation since its
    /// transaction began, not from the read lock itself.
    pub fn read_lock(&self, ids: &[LockId]) -> Result<(), ScopeError> {
        self.acquire(ids, LockMode::Read, None)
    }

    pub fn write_lock(&self, ids: &[LockId]) -> Result<(), ScopeError> {
        self.acquire(ids, LockMode::Write, None)
    }

    pub fn read_lock_with_timeout(&self, timeout: Duration, ids: &[LockId]) -> Result<(), ScopeError> {
        self.acquire(ids, LockMode::Read, Some(timeout))
    }

    pub fn write_lock_with_timeout(
        &self,
        timeout: Duration,
        ids: &[LockId],
    ) -> Result<(), ScopeError> {
        self.acquire(ids, LockMode::Write, Some(timeout))
    }

    /// Takes mixed read and write locks in one ascending pass. An id listed in
    /// both modes is taken once, for writing.
    pub fn lock(&self, entries: &[LockEntry]) -> Result<(), ScopeError> {
        self.ensure_usable()?;
        self.inner.tree.acquire(entries, None)
    }

    fn acquire(&self, ids: &[LockId], mode: LockMode, timeout: Option<Duration>) -> Result<(), ScopeError> {
        self.ensure_usable()?;
        let entries = ids
            .iter()
            .map(|&id| LockEntry { id, mode })
            .collect::<Vec<_>>();
        self.inner.tree.acquire(&entries, timeout)
    }

    /// Runs `f` on the tree's connection inside its transaction.
    pub fn with_database<R>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<R>,
    ) -> Result<R, ScopeError> {
        self.ensure_usable()?;
        self.inner
            .tree
            .with_connection(|conn| f(conn).map_err(ScopeError::from))
    }

    /// Leaves the stack and, for the root, ends the transaction.
    ///
    /// Fails with `ScopeNesting`, leaving the stack untouched, when another
    /// scope is still ambient on top of this one. Calling it again after a
    /// successful disposal does nothing.
    pub fn dispose(&self) -> Result<ScopeOutcome, ScopeError> {
        if self.inner.disposed.get() {
            return Ok(ScopeOutcome::AlreadyDisposed);
        }
        if self.inner.on_stack() {
            self.context.pop(&self.inner)?;
        }
        let outcome = self.inner.finalize();
        self.context.reap_abandoned();
        outcome
    }

    fn ensure_usable(&self) -> Result<(), ScopeError> {
        if self.inner.disposed.get() {
            return Err(ScopeError::nesting(self.inner.id, "scope has been disposed"));
        }
        if self.inner.detached && !self.inner.attached.get() {
            return Err(ScopeError::nesting(
                self.inner.id,
                "detached scope must be attached before use",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("parent", &self.inner.parent)
            .field("tree", &self.inner.tree.id())
            .field("detached", &self.inner.detached)
            .field("completed", &self.inner.completed.get())
            .field("disposed", &self.inner.disposed.get())
            .finish()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if self.inner.disposed.get() {
            return;
        }
        match self.dispose() {
            Ok(_) => {}
            Err(err @ ScopeError::ScopeNesting { .. }) => {
                error!(scope = %self.inner.id, error = %err, "scope dropped out of order; it will roll back its tree");
                self.inner.abandoned.set(true);
            }
            Err(err) => {
                error!(scope = %self.inner.id, error = %err, "scope disposal failed on drop");
            }
        }
    }
}
