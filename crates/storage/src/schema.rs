#![forbid(unsafe_code)]

use crate::{ScopeError, Settings};
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use std::collections::BTreeSet;
use uow_core::LockId;
use uow_core::locks::REGISTRY;

pub(crate) const SCHEMA_VERSION: &str = "1";

pub(crate) const CORE_TABLES: &[&str] = &["meta", "locks", "kv"];

/// Opens a connection to the configured database, turning every way that can
/// fail into an actionable `ConnectivityFailure`.
pub(crate) fn open_connection(settings: &Settings) -> Result<Connection, ScopeError> {
    let path = settings.database_path.as_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.is_dir() {
            return Err(ScopeError::ConnectivityFailure(format!(
                "database directory {} does not exist",
                parent.display()
            )));
        }
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(|err| {
        ScopeError::ConnectivityFailure(format!(
            "cannot open {} ({err}); check the configured path and file permissions",
            path.display()
        ))
    })?;

    conn.busy_timeout(settings.busy_timeout())?;
    probe(&conn, settings)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys = ON;")
        .map_err(|err| connectivity_from(err, settings))?;
    Ok(conn)
}

fn probe(conn: &Connection, settings: &Settings) -> Result<(), ScopeError> {
    conn.query_row("SELECT COUNT(1) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })
    .map(|_| ())
    .map_err(|err| connectivity_from(err, settings))
}

fn connectivity_from(err: rusqlite::Error, settings: &Settings) -> ScopeError {
    let path = settings.database_path.display();
    let hint = match &err {
        rusqlite::Error::SqliteFailure(code, _) => match code.code {
            ErrorCode::NotADatabase => "the file is not a SQLite database",
            ErrorCode::ReadOnly | ErrorCode::PermissionDenied => {
                "insufficient privileges: the database must be writable"
            }
            ErrorCode::CannotOpen => "the database file cannot be opened",
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                "the database is locked by another process"
            }
            _ => "unexpected database error",
        },
        _ => "unexpected database error",
    };
    ScopeError::ConnectivityFailure(format!("{path}: {hint} ({err})"))
}

/// Creates the core tables and seeds the lock registry. Idempotent.
pub(crate) fn install(conn: &Connection) -> Result<(), ScopeError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS locks (
          id INTEGER PRIMARY KEY,
          value INTEGER NOT NULL,
          name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS kv (
          key TEXT PRIMARY KEY,
          value TEXT,
          updated_at_ms INTEGER NOT NULL
        );
        "#,
    )?;

    for (id, name) in REGISTRY {
        tx.execute(
            "INSERT OR IGNORE INTO locks(id, value, name) VALUES (?1, 1, ?2)",
            params![id.get(), name],
        )?;
    }

    tx.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params!["schema_version", SCHEMA_VERSION],
    )?;
    tx.commit()?;
    Ok(())
}

pub(crate) fn table_names(conn: &Connection) -> rusqlite::Result<BTreeSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let mut rows = stmt.query([])?;
    let mut tables = BTreeSet::new();
    while let Some(row) = rows.next()? {
        tables.insert(row.get::<_, String>(0)?);
    }
    Ok(tables)
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1",
        params![name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

pub(crate) fn registered_lock_ids(conn: &Connection) -> rusqlite::Result<Vec<LockId>> {
    let mut stmt = conn.prepare("SELECT id FROM locks ORDER BY id ASC")?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(LockId::new(row.get::<_, i32>(0)?));
    }
    Ok(out)
}

/// Outcome of comparing the live database against the expected core schema.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchemaReport {
    pub missing_tables: Vec<String>,
    pub missing_locks: Vec<LockId>,
    pub schema_version: Option<String>,
}

impl SchemaReport {
    pub fn is_installed(&self) -> bool {
        self.missing_tables.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.missing_tables.is_empty()
            && self.missing_locks.is_empty()
            && self.schema_version.as_deref() == Some(SCHEMA_VERSION)
    }

    /// One-line operator summary, attached to failure reports.
    pub fn summary(&self) -> String {
        if self.is_valid() {
            return format!("schema v{SCHEMA_VERSION} is valid");
        }
        let mut parts = Vec::new();
        if !self.missing_tables.is_empty() {
            parts.push(format!("missing tables: {}", self.missing_tables.join(", ")));
        }
        if !self.missing_locks.is_empty() {
            let ids = self
                .missing_locks
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>();
            parts.push(format!("missing lock rows: {}", ids.join(", ")));
        }
        match self.schema_version.as_deref() {
            Some(SCHEMA_VERSION) => {}
            Some(other) => parts.push(format!("schema version {other} (expected {SCHEMA_VERSION})")),
            None => parts.push("schema version row is missing".to_string()),
        }
        parts.join("; ")
    }
}

pub(crate) fn validate(conn: &Connection) -> rusqlite::Result<SchemaReport> {
    let tables = table_names(conn)?;
    let missing_tables = CORE_TABLES
        .iter()
        .filter(|table| !tables.contains(**table))
        .map(|table| table.to_string())
        .collect::<Vec<_>>();

    let missing_locks = if tables.contains("locks") {
        let present = registered_lock_ids(conn)?
            .into_iter()
            .collect::<BTreeSet<_>>();
        REGISTRY
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| !present.contains(id))
            .collect()
    } else {
        REGISTRY.iter().map(|(id, _)| *id).collect()
    };

    let schema_version = if tables.contains("meta") {
        conn.query_row(
            "SELECT value FROM meta WHERE key=?1",
            params!["schema_version"],
            |row| row.get::<_, String>(0),
        )
        .optional()?
    } else {
        None
    };

    Ok(SchemaReport {
        missing_tables,
        missing_locks,
        schema_version,
    })
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}
