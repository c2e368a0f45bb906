#![forbid(unsafe_code)]

//! Distributed lock managers.
//!
//! Locks are owned by a scope tree and live exactly as long as the tree's
//! transaction. There is no per-lock unlock: the only release
//! path is `release_all`, called once the transaction has ended.

mod local;
mod sqlite;

pub use local::LocalLockingMechanism;
pub use sqlite::SqliteLockingMechanism;

use crate::ScopeError;
use rusqlite::Connection;
use std::time::Duration;
use uow_core::ids::TreeId;
use uow_core::{LockId, LockMode};

/// A single acquisition, issued on behalf of one scope tree.
pub struct LockRequest<'a> {
    pub tree: TreeId,
    pub id: LockId,
    pub timeout: Duration,
    /// The tree's connection, inside its running transaction.
    pub connection: &'a Connection,
}

pub trait DistributedLockingMechanism: Send + Sync {
    fn name(&self) -> &'static str;

    /// Shared lock. Blocks until granted or `request.timeout` elapses.
    fn read_lock(&self, request: &LockRequest<'_>) -> Result<(), ScopeError>;

    /// Exclusive lock. A tree already holding the lock in read mode is upgraded.
    fn write_lock(&self, request: &LockRequest<'_>) -> Result<(), ScopeError>;

    /// Releases everything `tree` holds. Called after its transaction ended.
    fn release_all(&self, tree: TreeId);

    /// Whether trees must take the database write reservation when their
    /// transaction starts (`BEGIN IMMEDIATE`). Mechanisms that lock through
    /// the database need it: a deferred transaction that has already read
    /// cannot wait for the write lock, it fails at once.
    fn begins_immediate(&self) -> bool {
        false
    }

    fn acquire(&self, request: &LockRequest<'_>, mode: LockMode) -> Result<(), ScopeError> {
        match mode {
            LockMode::Read => self.read_lock(request),
            LockMode::Write => self.write_lock(request),
        }
    }
}
