#![forbid(unsafe_code)]

use super::{MigrationContext, MigrationPlan};
use crate::key_value::KeyValueService;
use crate::scope::{ScopeContext, ScopeOptions};
use crate::ScopeError;
use tracing::{info, info_span, warn};
use uow_core::LockId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeReport {
    pub plan: String,
    pub from_state: Option<String>,
    pub to_state: String,
    pub executed: Vec<String>,
    pub already_current: bool,
}

/// Runs a [`MigrationPlan`] as one unit: all pending steps and the new state
/// record commit together, or nothing does.
#[derive(Debug)]
pub struct Upgrader {
    plan: MigrationPlan,
}

impl Upgrader {
    pub fn new(plan: MigrationPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &MigrationPlan {
        &self.plan
    }

    pub fn execute(&self, ctx: &ScopeContext, kv: &KeyValueService) -> Result<UpgradeReport, ScopeError> {
        let span = info_span!("upgrade", plan = %self.plan.name());
        let _entered = span.enter();

        let plan_name = self.plan.name();
        let key = self.plan.state_key();
        let target = self.plan.final_state();

        let outer = ctx.create_scope(ScopeOptions::default())?;
        outer.write_lock(&[LockId::KEY_VALUES])?;
        let recorded = kv.get_value(ctx, &key)?;

        if recorded.as_deref() == Some(target) {
            outer.complete()?;
            outer.dispose()?;
            info!(state = %target, "already at final state");
            return Ok(UpgradeReport {
                plan: plan_name.to_string(),
                from_state: recorded,
                to_state: target.to_string(),
                executed: Vec::new(),
                already_current: true,
            });
        }

        let pending = self.plan.pending_from(recorded.as_deref())?;
        info!(from = ?recorded, to = %target, steps = pending.len(), "upgrade started");

        let mut executed = Vec::with_capacity(pending.len());
        for transition in pending {
            let step_name = transition.step.name();
            let inner = ctx.create_scope(ScopeOptions::default())?;
            let result = transition
                .step
                .migrate(&MigrationContext::new(&inner, plan_name, &step_name));

            match result {
                Ok(()) => {
                    inner.complete()?;
                    inner.dispose()?;
                    info!(step = %step_name, state = %transition.target, "step applied");
                    executed.push(step_name);
                }
                Err(source) => {
                    warn!(step = %step_name, error = %source, "step failed; rolling back plan");
                    inner.dispose()?;
                    outer.dispose()?;
                    return Err(ScopeError::MigrationStepFailure {
                        plan: plan_name.to_string(),
                        step: step_name,
                        completed_steps: executed,
                        source: Box::new(source),
                    });
                }
            }
        }

        kv.set_value(ctx, &key, target)?;
        outer.complete()?;
        let outcome = outer.dispose()?;
        info!(state = %target, steps = executed.len(), ?outcome, "upgrade finished");

        Ok(UpgradeReport {
            plan: plan_name.to_string(),
            from_state: recorded,
            to_state: target.to_string(),
            executed,
            already_current: false,
        })
    }
}
