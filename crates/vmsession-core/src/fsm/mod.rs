//! FSM - 自己ルーティングする状態機械
//!
//! A graph of states and actions is declared once with [`FsmBuilder`].
//! `goto(target)` computes a route from the current node and hands it to a
//! dedicated worker thread, which runs the actions on the route one at a
//! time and parks when nothing is left.
//!
//! # 学習ポイント
//! - Index-based graph: edges are `usize` positions in a table the machine owns
//! - Mutex + Condvar: park/wake of the worker and blocking `wait_for`
//! - Cooperative cancellation through [`CancelToken`] (a `watch` flag) instead of thread interruption
//! - Optional progress binding: every route recalibrates a [`FiniteTask`](crate::progress::FiniteTask)

mod action;
mod cancel;
mod graph;
mod machine;
mod router;
mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use self::action::{Action, ActionContext, ActionError};
pub use self::cancel::CancelToken;
pub use self::graph::{BuildError, FsmBuilder};
pub use self::machine::Fsm;

/// Integer id of a graph node.
pub type StateId = i32;

/// Lock a mutex, recovering the guard from a poisoned lock.
///
/// Handlers run outside every lock, so a poisoned mutex still guards
/// consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
