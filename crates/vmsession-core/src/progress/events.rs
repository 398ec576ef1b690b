//! Observer callbacks of a task node.
//!
//! Callbacks are collected while the tree lock is held and fired after it is
//! released, so an observer may freely query the tree (e.g. read the root
//! progress) from inside its callback.

use std::sync::Arc;

pub type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&str, i32) + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(f64, &str) + Send + Sync>;

/// Per-node observer lists. Insertion order is call order.
#[derive(Default)]
pub(crate) struct Observers {
    pub started: Vec<MessageCallback>,
    pub completed: Vec<MessageCallback>,
    pub error: Vec<ErrorCallback>,
    pub progress: Vec<ProgressCallback>,
}

/// A callback invocation captured under the tree lock.
pub(crate) enum Notification {
    Started(MessageCallback, String),
    Completed(MessageCallback, String),
    Error(ErrorCallback, String, i32),
    Progress(ProgressCallback, f64, String),
}

impl Notification {
    pub fn fire(self) {
        match self {
            Notification::Started(cb, msg) => cb(&msg),
            Notification::Completed(cb, msg) => cb(&msg),
            Notification::Error(cb, msg, code) => cb(&msg, code),
            Notification::Progress(cb, value, msg) => cb(value, &msg),
        }
    }
}

impl Observers {
    pub fn started(&self, message: &str, out: &mut Vec<Notification>) {
        for cb in &self.started {
            out.push(Notification::Started(Arc::clone(cb), message.to_string()));
        }
    }

    pub fn completed(&self, message: &str, out: &mut Vec<Notification>) {
        for cb in &self.completed {
            out.push(Notification::Completed(Arc::clone(cb), message.to_string()));
        }
    }

    pub fn error(&self, message: &str, code: i32, out: &mut Vec<Notification>) {
        for cb in &self.error {
            out.push(Notification::Error(Arc::clone(cb), message.to_string(), code));
        }
    }

    pub fn progress(&self, value: f64, message: &str, out: &mut Vec<Notification>) {
        for cb in &self.progress {
            out.push(Notification::Progress(
                Arc::clone(cb),
                value,
                message.to_string(),
            ));
        }
    }
}
