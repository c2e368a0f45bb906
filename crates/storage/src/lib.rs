#![forbid(unsafe_code)]

//! SQLite-backed ambient scopes.
//!
//! ```no_run
//! use uow_core::LockId;
//! use uow_storage::{ScopeOptions, ScopeProvider, Settings};
//!
//! # fn main() -> Result<(), uow_storage::ScopeError> {
//! let provider = ScopeProvider::open(Settings::for_database("app.db"))?;
//! let ctx = provider.context();
//!
//! let scope = ctx.create_scope(ScopeOptions::default())?;
//! scope.write_lock(&[LockId::DOMAINS])?;
//! scope.with_database(|conn| conn.execute("UPDATE kv SET value='x' WHERE key='y'", []))?;
//! scope.complete()?;
//! scope.dispose()?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod error;
mod key_value;
pub mod locking;
pub mod migrations;
mod schema;
mod scope;
mod settings;
mod transaction;

pub use builder::{BuildReport, DatabaseBuilder};
pub use error::ScopeError;
pub use key_value::KeyValueService;
pub use schema::SchemaReport;
pub use scope::{Scope, ScopeContext, ScopeOptions, ScopeOutcome, ScopeProvider};
pub use settings::{LockingBackend, Settings};
pub use transaction::TransactionHandle;
