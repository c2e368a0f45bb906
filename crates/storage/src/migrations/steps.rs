#![forbid(unsafe_code)]

use super::{MigrationContext, MigrationError, MigrationStep};

/// Renames a table. Fails if the source is missing or the target exists.
#[derive(Clone, Debug)]
pub struct RenameTable {
    from: String,
    to: String,
}

impl RenameTable {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl MigrationStep for RenameTable {
    fn name(&self) -> String {
        format!("rename-table {} -> {}", self.from, self.to)
    }

    fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<(), MigrationError> {
        ctx.rename_table(&self.from, &self.to)
    }
}

/// Runs a raw SQL batch.
#[derive(Clone, Debug)]
pub struct ExecuteSql {
    name: String,
    sql: String,
}

impl ExecuteSql {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

impl MigrationStep for ExecuteSql {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<(), MigrationError> {
        ctx.execute_batch(&self.sql)
    }
}

/// A step backed by a closure.
pub struct FnStep<F> {
    name: String,
    f: F,
}

impl<F> MigrationStep for FnStep<F>
where
    F: Fn(&MigrationContext<'_>) -> Result<(), MigrationError>,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<(), MigrationError> {
        (self.f)(ctx)
    }
}

pub fn step<F>(name: impl Into<String>, f: F) -> FnStep<F>
where
    F: Fn(&MigrationContext<'_>) -> Result<(), MigrationError>,
{
    FnStep {
        name: name.into(),
        f,
    }
}
