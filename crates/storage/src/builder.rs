#![forbid(unsafe_code)]

use crate::key_value::KeyValueService;
use crate::migrations::{MigrationPlan, Upgrader};
use crate::schema::{self, SchemaReport};
use crate::scope::ScopeProvider;
use crate::ScopeError;
use serde::Serialize;
use std::cell::RefCell;
use tracing::{error, info};

const CANNOT_CONNECT: &str = "Database configuration is invalid. Check that the database file exists \
     in a readable directory and that the process has write access to it.";

/// Outcome of an install or upgrade attempt. Failures are reported here, not
/// raised; `percentage` is a coarse progress marker for installers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub success: bool,
    pub requires_upgrade: bool,
    pub message: String,
    pub percentage: u8,
    pub schema_summary: Option<String>,
}

impl BuildReport {
    fn done(message: impl Into<String>) -> Self {
        Self {
            success: true,
            requires_upgrade: false,
            message: message.into(),
            percentage: 100,
            schema_summary: None,
        }
    }

    fn needs_upgrade() -> Self {
        Self {
            success: true,
            requires_upgrade: true,
            message: "Database is installed and must be upgraded.".to_string(),
            percentage: 30,
            schema_summary: None,
        }
    }

    fn cannot_connect() -> Self {
        Self {
            success: false,
            requires_upgrade: false,
            message: CANNOT_CONNECT.to_string(),
            percentage: 10,
            schema_summary: None,
        }
    }
}

/// Installs and upgrades the database behind a [`ScopeProvider`].
pub struct DatabaseBuilder {
    provider: ScopeProvider,
    validated: RefCell<Option<SchemaReport>>,
}

impl DatabaseBuilder {
    pub fn new(provider: ScopeProvider) -> Self {
        Self {
            provider,
            validated: RefCell::new(None),
        }
    }

    pub fn can_connect(&self) -> bool {
        self.provider.connect().is_ok()
    }

    pub fn is_installed(&self) -> Result<bool, ScopeError> {
        let conn = self.provider.connect()?;
        Ok(schema::validate(&conn)?.is_installed())
    }

    /// Compares the live schema with the expected one. The first result is
    /// kept until the schema is changed through this builder.
    pub fn validate_schema(&self) -> Result<SchemaReport, ScopeError> {
        if let Some(report) = self.validated.borrow().as_ref() {
            return Ok(report.clone());
        }
        let conn = self.provider.connect()?;
        let report = schema::validate(&conn)?;
        *self.validated.borrow_mut() = Some(report.clone());
        Ok(report)
    }

    /// Creates the core schema on an empty database. An already installed
    /// database is reported as needing an upgrade instead.
    pub fn create_schema_and_data(&self) -> BuildReport {
        if !self.can_connect() {
            return BuildReport::cannot_connect();
        }
        info!(db = %self.provider.settings().database_path.display(), "database install started");

        let installed = self.validate_schema().and_then(|report| {
            if report.is_installed() {
                return Ok(false);
            }
            let conn = self.provider.connect()?;
            schema::install(&conn)?;
            self.validated.borrow_mut().take();
            Ok(true)
        });

        match installed {
            Ok(true) => {
                info!("database install completed");
                BuildReport::done("Installation completed.")
            }
            Ok(false) => {
                info!("database requires upgrade");
                BuildReport::needs_upgrade()
            }
            Err(err) => self.failed(err),
        }
    }

    /// Runs `plan` through the [`Upgrader`] in a fresh context.
    pub fn upgrade_schema_and_data(&self, plan: MigrationPlan) -> BuildReport {
        if !self.can_connect() {
            return BuildReport::cannot_connect();
        }
        info!(plan = %plan.name(), "database upgrade started");

        let ctx = self.provider.context();
        match Upgrader::new(plan).execute(&ctx, &KeyValueService::new()) {
            Ok(report) => {
                self.validated.borrow_mut().take();
                let message = if report.already_current {
                    format!("Database already at state {}.", report.to_state)
                } else {
                    format!(
                        "Upgrade completed: {} step(s), now at state {}.",
                        report.executed.len(),
                        report.to_state
                    )
                };
                BuildReport::done(message)
            }
            Err(err) => self.failed(err),
        }
    }

    fn failed(&self, err: ScopeError) -> BuildReport {
        error!(error = %err, code = err.code(), "database configuration failed");
        let schema_summary = self.validate_schema().ok().map(|report| report.summary());
        if let Some(summary) = &schema_summary {
            info!(%summary, "schema validation summary");
        }
        BuildReport {
            success: false,
            requires_upgrade: false,
            message: format!("The database configuration failed: {err}"),
            percentage: 90,
            schema_summary,
        }
    }
}

impl std::fmt::Debug for DatabaseBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseBuilder")
            .field("provider", &self.provider)
            .field("validated", &self.validated.borrow().is_some())
            .finish()
    }
}
