//! Node actions and the context handed to them.

use std::sync::Arc;
use std::time::Duration;

use super::cancel::CancelToken;
use super::machine::Shared;
use super::StateId;
use crate::progress::{FiniteTask, ProgressTask};

/// Error returned by an action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// Ordinary failure; reported to the bound progress tree.
    #[error("{message} (code {code})")]
    Failed { message: String, code: i32 },

    /// The machine is being stopped. The worker unwinds on this.
    #[error("interrupted")]
    Interrupted,
}

impl ActionError {
    pub fn failed(message: impl Into<String>, code: i32) -> Self {
        ActionError::Failed {
            message: message.into(),
            code,
        }
    }
}

/// Executable part of a graph node.
///
/// Any `Fn(&ActionContext) -> Result<(), ActionError>` closure is an action.
pub trait Action: Send + Sync + 'static {
    fn invoke(&self, ctx: &ActionContext) -> Result<(), ActionError>;
}

impl<F> Action for F
where
    F: Fn(&ActionContext) -> Result<(), ActionError> + Send + Sync + 'static,
{
    fn invoke(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        self(ctx)
    }
}

/// Handle an action uses to report progress, re-route and yield.
///
/// Progress calls are no-ops when no progress tree is bound.
pub struct ActionContext {
    shared: Arc<Shared>,
    state: StateId,
}

impl ActionContext {
    pub(crate) fn new(shared: Arc<Shared>, state: StateId) -> Self {
        Self { shared, state }
    }

    /// Id of the node being executed.
    pub fn state(&self) -> StateId {
        self.state
    }

    /// The bound progress tree, if any.
    pub fn progress(&self) -> Option<FiniteTask> {
        self.shared.bound_progress()
    }

    pub fn doing(&self, message: &str) {
        if let Some(task) = self.progress() {
            task.doing(message);
        }
    }

    pub fn done(&self, message: &str) {
        if let Some(task) = self.progress() {
            task.done(message);
        }
    }

    pub fn fail(&self, message: &str, code: i32) {
        if let Some(task) = self.progress() {
            task.fail(message, code);
        }
    }

    /// Start a sub-task of kind `T` in the current slot of the bound tree.
    pub fn begin<T: ProgressTask>(&self, message: &str) -> Option<T> {
        self.progress().map(|task| task.begin::<T>(message))
    }

    /// Re-route towards `target`; see [`Fsm::goto`](super::Fsm::goto).
    pub fn goto(&self, target: StateId) -> bool {
        self.shared.goto(target)
    }

    /// Reposition onto `state`; see [`Fsm::skew`](super::Fsm::skew).
    pub fn skew(&self, state: StateId) -> bool {
        self.shared.skew(state)
    }

    /// Current route target.
    pub fn target(&self) -> StateId {
        self.shared.target_state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Stop flag of the machine, for async work that should give up with it.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// Yield point: fails with `Interrupted` once the machine is stopping.
    pub fn checkpoint(&self) -> Result<(), ActionError> {
        if self.is_cancelled() {
            return Err(ActionError::Interrupted);
        }
        Ok(())
    }

    /// Sleep that wakes up early with `Interrupted` when the machine stops.
    pub fn sleep(&self, duration: Duration) -> Result<(), ActionError> {
        if self.shared.cancel.sleep(duration) {
            Ok(())
        } else {
            Err(ActionError::Interrupted)
        }
    }
}

impl std::fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionContext")
            .field("fsm", &self.shared.name)
            .field("state", &self.state)
            .finish()
    }
}
