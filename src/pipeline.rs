//! Module for running an ordered list of actions over a data context.
use crate::actions::Action;
use crate::data::{DataContext, DataError};
use crate::kernel::KernelError;
use crate::regression::RegressionError;
use thiserror::Error;

/// Why an action could not complete.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionFailure {
    #[error("degenerate input: {0}")]
    DegenerateInput(String),
    #[error("fit did not converge after {iterations} iterations (max coefficient change {max_change:.3e})")]
    NonConvergence { iterations: usize, max_change: f64 },
    #[error("{0}")]
    Computation(String),
    #[error("external program failed: {0}")]
    External(String),
}

impl From<RegressionError> for ActionFailure {
    fn from(e: RegressionError) -> Self {
        match e {
            RegressionError::DegenerateInput(msg) => ActionFailure::DegenerateInput(msg),
            RegressionError::NonConvergence { iterations, max_change } => {
                ActionFailure::NonConvergence { iterations, max_change }
            }
            other => ActionFailure::Computation(other.to_string()),
        }
    }
}

impl From<KernelError> for ActionFailure {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::Degenerate(msg) => ActionFailure::DegenerateInput(msg),
            other => ActionFailure::Computation(other.to_string()),
        }
    }
}

impl From<DataError> for ActionFailure {
    fn from(e: DataError) -> Self {
        ActionFailure::Computation(e.to_string())
    }
}

/// A pipeline failure attributed to the action that raised it.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("action '{action}' failed: {failure}")]
pub struct ActionError {
    pub action: String,
    #[source]
    pub failure: ActionFailure,
}

impl ActionError {
    pub fn is_degenerate(&self) -> bool {
        matches!(self.failure, ActionFailure::DegenerateInput(_))
    }
}

/// Ordered actions, split into a permutation-invariant prefix and a suffix
/// that is re-applied for every permuted copy of the context.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    actions: Vec<Action>,
    invariant_len: usize,
}

impl Pipeline {
    /// A pipeline whose actions all depend on the permuted data.
    pub fn new(actions: Vec<Action>) -> Self {
        Pipeline { actions, invariant_len: 0 }
    }

    /// A pipeline whose `invariant` actions only need to run once per group.
    pub fn with_invariant(invariant: Vec<Action>, variable: Vec<Action>) -> Self {
        let invariant_len = invariant.len();
        let mut actions = invariant;
        actions.extend(variable);
        Pipeline { actions, invariant_len }
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn invariant(&self) -> &[Action] {
        &self.actions[..self.invariant_len]
    }

    pub fn variable(&self) -> &[Action] {
        &self.actions[self.invariant_len..]
    }

    pub fn action_names(&self) -> Vec<&str> {
        self.actions.iter().map(Action::name).collect()
    }

    /// Resets the context's statistics and runs every action in order.
    pub fn apply(&self, ctx: &mut DataContext) -> Result<(), ActionError> {
        ctx.begin_run();
        run_actions(&self.actions, ctx)
    }

    /// Resets the context's statistics and runs the invariant prefix.
    pub fn apply_invariant(&self, ctx: &mut DataContext) -> Result<(), ActionError> {
        ctx.begin_run();
        run_actions(self.invariant(), ctx)
    }

    /// Runs the variable suffix on an already prepared context.
    pub fn apply_variable(&self, ctx: &mut DataContext) -> Result<(), ActionError> {
        run_actions(self.variable(), ctx)
    }
}

fn run_actions(actions: &[Action], ctx: &mut DataContext) -> Result<(), ActionError> {
    for action in actions {
        log::trace!("[{}] applying action {}", ctx.group_key(), action.name());
        action.apply(ctx).map_err(|failure| ActionError {
            action: action.name().to_string(),
            failure,
        })?;
    }
    Ok(())
}
