//! Worker loop: Draining ⇄ Parked, until cancelled.
//!
//! Pop one node, run it, repeat; block on the wakeup condition variable
//! when the queue is empty or the last action failed.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info_span, warn};

use super::action::{ActionContext, ActionError};
use super::lock;
use super::machine::Shared;

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Queue was empty.
    Idle,
    /// Another step is in progress on this machine.
    Busy,
    /// A node was consumed (action run successfully, or markers skipped).
    Ran,
    /// The action failed or panicked; the rest of the queue is kept.
    Failed,
    /// The action observed cancellation.
    Interrupted,
}

pub(crate) fn run(shared: Arc<Shared>) {
    let span = info_span!("fsm", name = %shared.name);
    let _enter = span.enter();
    debug!("worker loop entered");

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        match step(&shared) {
            Step::Ran => {
                std::thread::yield_now();
                continue;
            }
            Step::Interrupted => break,
            Step::Idle | Step::Busy | Step::Failed => {}
        }
        if !shared.park() {
            break;
        }
    }

    debug!("worker loop exited");
}

/// Pop the next node (skipping state markers) and run its action.
pub(crate) fn step(shared: &Arc<Shared>) -> Step {
    if shared.inside_handler.swap(true, Ordering::AcqRel) {
        return Step::Busy;
    }
    let outcome = step_guarded(shared);
    shared.inside_handler.store(false, Ordering::Release);
    outcome
}

fn step_guarded(shared: &Arc<Shared>) -> Step {
    let next = {
        let _serial = lock(&shared.goto_lock);
        let mut routing = lock(&shared.routing);
        let mut next = None;
        while let Some(index) = routing.queue.pop_front() {
            next = Some(index);
            if shared.graph.has_action(index) {
                break;
            }
        }
        if let Some(index) = next {
            routing.current = index;
            routing.busy = shared.graph.has_action(index);
        }
        next
    };
    shared.routing_changed.notify_all();

    let Some(index) = next else {
        return Step::Idle;
    };
    let node = &shared.graph.nodes[index];
    let Some(action) = node.action.clone() else {
        return Step::Ran;
    };

    let state = node.id;
    let ctx = ActionContext::new(Arc::clone(shared), state);
    let result = panic::catch_unwind(AssertUnwindSafe(|| action.invoke(&ctx)));

    lock(&shared.routing).busy = false;
    shared.routing_changed.notify_all();

    match result {
        Ok(Ok(())) => Step::Ran,
        Ok(Err(ActionError::Interrupted)) => {
            debug!(state, "action interrupted");
            Step::Interrupted
        }
        Ok(Err(ActionError::Failed { message, code })) => {
            warn!(state, code, error = %message, "action failed");
            shared.fail_progress(&message, code);
            Step::Failed
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(state, error = %message, "action panicked");
            shared.fail_progress(&message, -1);
            Step::Failed
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown exception".to_string()
    }
}
