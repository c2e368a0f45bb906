#![forbid(unsafe_code)]

use super::MigrationError;
use crate::scope::Scope;
use crate::schema;
use rusqlite::Connection;

/// What a step sees while it runs: its own nested scope plus a handful of
/// schema primitives. Every statement runs inside the plan's transaction.
pub struct MigrationContext<'a> {
    scope: &'a Scope,
    plan: &'a str,
    step: &'a str,
}

impl<'a> MigrationContext<'a> {
    pub(crate) fn new(scope: &'a Scope, plan: &'a str, step: &'a str) -> Self {
        Self { scope, plan, step }
    }

    pub fn plan_name(&self) -> &str {
        self.plan
    }

    pub fn step_name(&self) -> &str {
        self.step
    }

    /// The step's scope, for taking locks.
    pub fn scope(&self) -> &Scope {
        self.scope
    }

    pub fn with_database<R>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<R>,
    ) -> Result<R, MigrationError> {
        Ok(self.scope.with_database(f)?)
    }

    pub fn execute(&self, sql: &str) -> Result<usize, MigrationError> {
        self.with_database(|conn| conn.execute(sql, []))
    }

    pub fn execute_batch(&self, sql: &str) -> Result<(), MigrationError> {
        self.with_database(|conn| conn.execute_batch(sql))
    }

    pub fn table_exists(&self, name: &str) -> Result<bool, MigrationError> {
        let name = identifier(name)?;
        self.with_database(|conn| schema::table_exists(conn, name))
    }

    /// `columns` is the column list without parentheses, e.g. `id INTEGER PRIMARY KEY, name TEXT`.
    pub fn create_table(&self, name: &str, columns: &str) -> Result<(), MigrationError> {
        let name = identifier(name)?;
        if self.table_exists(name)? {
            return Err(MigrationError::TableExists(name.to_string()));
        }
        self.execute_batch(&format!("CREATE TABLE {name} ({columns})"))
    }

    pub fn rename_table(&self, from: &str, to: &str) -> Result<(), MigrationError> {
        let from = identifier(from)?;
        let to = identifier(to)?;
        if !self.table_exists(from)? {
            return Err(MigrationError::MissingTable(from.to_string()));
        }
        if self.table_exists(to)? {
            return Err(MigrationError::TableExists(to.to_string()));
        }
        self.execute_batch(&format!("ALTER TABLE {from} RENAME TO {to}"))
    }

    pub fn drop_table(&self, name: &str) -> Result<(), MigrationError> {
        let name = identifier(name)?;
        if !self.table_exists(name)? {
            return Err(MigrationError::MissingTable(name.to_string()));
        }
        self.execute_batch(&format!("DROP TABLE {name}"))
    }

    /// Adds a column; a column that already exists is left alone.
    pub fn add_column(&self, table: &str, column: &str, decl: &str) -> Result<(), MigrationError> {
        let table = identifier(table)?;
        let column = identifier(column)?;
        let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {decl}");
        match self.scope.with_database(|conn| conn.execute(&sql, [])) {
            Ok(_) => Ok(()),
            Err(crate::ScopeError::Sql(err)) if is_duplicate_column(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn column_names(&self, table: &str) -> Result<Vec<String>, MigrationError> {
        let table = identifier(table)?;
        self.with_database(|conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row.get::<_, String>(1)?);
            }
            Ok(out)
        })
    }
}

fn identifier(name: &str) -> Result<&str, MigrationError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if valid {
        Ok(name)
    } else {
        Err(MigrationError::InvalidIdentifier(name.to_string()))
    }
}

fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => {
            message.contains("duplicate column name")
        }
        _ => false,
    }
}
