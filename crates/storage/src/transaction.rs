#![forbid(unsafe_code)]

use crate::ScopeError;
use rusqlite::Connection;
use tracing::{debug, warn};
use uow_core::IsolationLevel;
use uow_core::ids::TreeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandleState {
    /// Connection open, no `BEGIN` issued yet.
    Idle,
    Active,
}

/// One physical connection plus at most one transaction on it.
///
/// `commit` and `rollback` consume the handle, so a transaction ends exactly
/// once. A handle dropped while active rolls back.
#[derive(Debug)]
pub struct TransactionHandle {
    tree: TreeId,
    conn: Connection,
    state: HandleState,
    begun_with: Option<IsolationLevel>,
}

impl TransactionHandle {
    pub(crate) fn new(tree: TreeId, conn: Connection) -> Self {
        Self {
            tree,
            conn,
            state: HandleState::Idle,
            begun_with: None,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn is_active(&self) -> bool {
        self.state == HandleState::Active
    }

    /// Isolation the transaction was started with, once started.
    pub fn begun_with(&self) -> Option<IsolationLevel> {
        self.begun_with
    }

    /// Starts the transaction if it is not running yet. Serializable trees,
    /// and any tree that asks for `immediate`, reserve the write lock up
    /// front (`BEGIN IMMEDIATE`); everything else starts deferred.
    pub fn begin(&mut self, isolation: IsolationLevel, immediate: bool) -> Result<(), ScopeError> {
        if self.is_active() {
            return Ok(());
        }
        if isolation == IsolationLevel::ReadUncommitted {
            self.conn.execute_batch("PRAGMA read_uncommitted = 1;")?;
        }
        let statement = if immediate || isolation >= IsolationLevel::Serializable {
            "BEGIN IMMEDIATE"
        } else {
            "BEGIN DEFERRED"
        };
        self.conn.execute_batch(statement)?;
        self.state = HandleState::Active;
        self.begun_with = Some(isolation);
        debug!(tree = %self.tree, %isolation, statement, "transaction started");
        Ok(())
    }

    pub fn commit(mut self) -> Result<(), ScopeError> {
        if !self.is_active() {
            return Ok(());
        }
        // Clear first so Drop never issues a second statement.
        self.state = HandleState::Idle;
        if let Err(err) = self.conn.execute_batch("COMMIT") {
            if !self.conn.is_autocommit() {
                if let Err(rollback_err) = self.conn.execute_batch("ROLLBACK") {
                    warn!(tree = %self.tree, error = %rollback_err, "rollback after failed commit failed");
                }
            }
            return Err(err.into());
        }
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), ScopeError> {
        if !self.is_active() {
            return Ok(());
        }
        self.state = HandleState::Idle;
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.is_active() && !self.conn.is_autocommit() {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(tree = %self.tree, error = %err, "rollback on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn handle_with_table() -> (tempfile::TempDir, std::path::PathBuf, TransactionHandle) {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("tx.db");
        let conn = Connection::open(&path).expect("open db");
        conn.execute_batch("CREATE TABLE t(v INTEGER NOT NULL);")
            .expect("create table");
        (dir, path, TransactionHandle::new(TreeId::next(), conn))
    }

    fn count_rows(path: &std::path::Path) -> i64 {
        let conn = Connection::open(path).expect("reopen db");
        conn.query_row("SELECT COUNT(1) FROM t", [], |row| row.get(0))
            .expect("count rows")
    }

    #[test]
    fn commit_persists_and_rollback_discards() {
        let (_dir, path, mut handle) = handle_with_table();
        handle.begin(IsolationLevel::ReadCommitted, false).expect("begin");
        handle
            .connection()
            .execute("INSERT INTO t(v) VALUES (?1)", params![1])
            .expect("insert");
        handle.commit().expect("commit");
        assert_eq!(count_rows(&path), 1);

        let conn = Connection::open(&path).expect("open again");
        let mut handle = TransactionHandle::new(TreeId::next(), conn);
        handle.begin(IsolationLevel::Serializable, false).expect("begin");
        assert_eq!(handle.begun_with(), Some(IsolationLevel::Serializable));
        handle
            .connection()
            .execute("INSERT INTO t(v) VALUES (?1)", params![2])
            .expect("insert");
        handle.rollback().expect("rollback");
        assert_eq!(count_rows(&path), 1);
    }

    #[test]
    fn dropping_an_active_handle_rolls_back() {
        let (_dir, path, mut handle) = handle_with_table();
        handle.begin(IsolationLevel::ReadCommitted, false).expect("begin");
        handle
            .connection()
            .execute("INSERT INTO t(v) VALUES (?1)", params![7])
            .expect("insert");
        drop(handle);
        assert_eq!(count_rows(&path), 0);
    }

    #[test]
    fn immediate_begin_reserves_the_writer() {
        let (_dir, path, mut handle) = handle_with_table();
        handle.begin(IsolationLevel::ReadCommitted, true).expect("begin");
        assert!(handle.is_active());

        let other = Connection::open(&path).expect("second connection");
        other
            .busy_timeout(std::time::Duration::ZERO)
            .expect("no wait");
        let err = other
            .execute_batch("BEGIN IMMEDIATE")
            .expect_err("writer is reserved");
        assert!(crate::error::is_busy(&err), "{err}");

        handle.rollback().expect("rollback");
        other.execute_batch("BEGIN IMMEDIATE; ROLLBACK;").expect("free again");
    }

    #[test]
    fn begin_is_idempotent_while_active() {
        let (_dir, _path, mut handle) = handle_with_table();
        handle.begin(IsolationLevel::ReadCommitted, false).expect("begin");
        handle.begin(IsolationLevel::Serializable, false).expect("second begin");
        assert_eq!(handle.begun_with(), Some(IsolationLevel::ReadCommitted));
        assert!(handle.is_active());
    }
}
