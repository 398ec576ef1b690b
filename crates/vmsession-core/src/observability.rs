use serde::{Deserialize, Serialize};

use crate::fsm::StateId;

/// Point-in-time view of an [`Fsm`](crate::fsm::Fsm).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsmStatus {
    pub name: String,
    pub current: StateId,
    pub target: StateId,
    /// Ids still queued, state markers included.
    pub pending: Vec<StateId>,
    /// An action is running or queued.
    pub active: bool,
    /// The worker thread is alive.
    pub running: bool,
    /// Progress of the bound tree, if one is bound.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub progress: Option<f64>,
}
