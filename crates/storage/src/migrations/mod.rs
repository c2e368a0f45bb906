#![forbid(unsafe_code)]

//! Migration plans and the runner that executes them inside one scope tree.

mod context;
mod steps;
mod upgrader;

pub use context::MigrationContext;
pub use steps::{ExecuteSql, FnStep, RenameTable, step};
pub use upgrader::{UpgradeReport, Upgrader};

use crate::ScopeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("{0}")]
    Scope(Box<ScopeError>),

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("table {0} already exists")]
    TableExists(String),

    #[error("table {0} does not exist")]
    MissingTable(String),

    #[error("{0}")]
    Failed(String),
}

impl From<ScopeError> for MigrationError {
    fn from(value: ScopeError) -> Self {
        Self::Scope(Box::new(value))
    }
}

/// One unit of schema or data change.
///
/// A step reports failure by returning an error; the runner then rolls back
/// every step of the plan.
pub trait MigrationStep {
    fn name(&self) -> String;

    fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<(), MigrationError>;
}

pub(crate) struct Transition {
    pub(crate) target: String,
    pub(crate) step: Box<dyn MigrationStep>,
}

/// Ordered steps taking a database from `initial_state` to the state reached
/// by the last step.
pub struct MigrationPlan {
    name: String,
    initial_state: String,
    transitions: Vec<Transition>,
}

impl MigrationPlan {
    pub fn new(name: impl Into<String>, initial_state: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial_state: initial_state.into(),
            transitions: Vec::new(),
        }
    }

    /// Appends a step that moves the plan to `target_state`.
    pub fn add(mut self, target_state: impl Into<String>, step: impl MigrationStep + 'static) -> Self {
        self.transitions.push(Transition {
            target: target_state.into(),
            step: Box::new(step),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    pub fn final_state(&self) -> &str {
        self.transitions
            .last()
            .map_or(self.initial_state.as_str(), |transition| transition.target.as_str())
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn step_names(&self) -> Vec<String> {
        self.transitions.iter().map(|t| t.step.name()).collect()
    }

    /// Key under which the reached state is recorded in the key-value store.
    pub fn state_key(&self) -> String {
        format!("upgrader.state+{}", self.name)
    }

    /// Steps still to run from `recorded`. Nothing recorded means the plan
    /// starts at its initial state.
    pub(crate) fn pending_from(&self, recorded: Option<&str>) -> Result<&[Transition], ScopeError> {
        let Some(recorded) = recorded else {
            return Ok(&self.transitions);
        };
        if recorded == self.initial_state {
            return Ok(&self.transitions);
        }
        match self.transitions.iter().position(|t| t.target == recorded) {
            Some(index) => Ok(&self.transitions[index + 1..]),
            None => Err(ScopeError::InvalidInput(format!(
                "plan {} does not know recorded state {recorded:?}",
                self.name
            ))),
        }
    }
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("target", &self.target)
            .field("step", &self.step.name())
            .finish()
    }
}

impl std::fmt::Debug for MigrationPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationPlan")
            .field("name", &self.name)
            .field("initial_state", &self.initial_state)
            .field("steps", &self.step_names())
            .finish()
    }
}
