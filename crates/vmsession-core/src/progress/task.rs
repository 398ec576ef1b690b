//! Task handles: `FiniteTask`, `VariableTask`, `BooleanTask`.
//!
//! A handle is a (tree, key) pair. Handles are cheap to clone and can be
//! moved across threads, but a tree is meant to be driven by one thread at a
//! time (normally the FSM worker that owns the run).

use std::sync::Arc;

use super::arena::NodeKey;
use super::tree::{NodeBody, Slot, TaskKind, TaskSnapshot, TaskTree};

/// Opaque (tree, node) reference shared by all task kinds.
#[derive(Clone)]
pub struct TaskRef {
    tree: TaskTree,
    key: NodeKey,
}

impl TaskRef {
    fn new_root(kind: TaskKind) -> Self {
        let tree = TaskTree::new();
        let key = tree.lock().insert(kind, None);
        Self { tree, key }
    }
}

impl std::fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRef").field("key", &self.key).finish()
    }
}

/// Behaviour shared by every task kind.
///
/// Terminal operations (`complete`, `fail`) are idempotent: once a task is
/// completed, further calls fire nothing.
pub trait ProgressTask: Clone + Send + Sync + Sized + 'static {
    const KIND: TaskKind;

    #[doc(hidden)]
    fn task_ref(&self) -> &TaskRef;

    #[doc(hidden)]
    fn from_task_ref(task_ref: TaskRef) -> Self;

    fn on_started(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        let r = self.task_ref();
        if let Some(node) = r.tree.lock().node_mut(r.key) {
            node.observers.started.push(Arc::new(cb));
        }
    }

    fn on_completed(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        let r = self.task_ref();
        if let Some(node) = r.tree.lock().node_mut(r.key) {
            node.observers.completed.push(Arc::new(cb));
        }
    }

    fn on_error(&self, cb: impl Fn(&str, i32) + Send + Sync + 'static) {
        let r = self.task_ref();
        if let Some(node) = r.tree.lock().node_mut(r.key) {
            node.observers.error.push(Arc::new(cb));
        }
    }

    fn on_progress(&self, cb: impl Fn(f64, &str) + Send + Sync + 'static) {
        let r = self.task_ref();
        if let Some(node) = r.tree.lock().node_mut(r.key) {
            node.observers.progress.push(Arc::new(cb));
        }
    }

    /// Report what is going on without changing completion state.
    fn doing(&self, message: &str) {
        let r = self.task_ref();
        r.tree.apply(|state, out| {
            if state.is_completed(r.key) {
                return;
            }
            state.ensure_started(r.key, message, out);
            state.refresh(r.key, message, out);
        });
    }

    fn complete(&self, message: &str) {
        let r = self.task_ref();
        r.tree.apply(|state, out| state.complete(r.key, message, out));
    }

    fn fail(&self, message: &str, code: i32) {
        let r = self.task_ref();
        r.tree.apply(|state, out| state.fail(r.key, message, code, out));
    }

    /// Reset to a freshly started task; sub-tasks are discarded.
    fn restart(&self, message: &str) {
        let r = self.task_ref();
        r.tree.apply(|state, out| state.restart(r.key, message, out));
    }

    fn progress(&self) -> f64 {
        let r = self.task_ref();
        r.tree.lock().progress(r.key)
    }

    fn last_message(&self) -> String {
        let r = self.task_ref();
        r.tree
            .lock()
            .node(r.key)
            .map(|n| n.last_message.clone())
            .unwrap_or_default()
    }

    fn is_started(&self) -> bool {
        let r = self.task_ref();
        r.tree.lock().node(r.key).map(|n| n.started).unwrap_or(false)
    }

    fn is_completed(&self) -> bool {
        let r = self.task_ref();
        r.tree.lock().is_completed(r.key)
    }

    fn is_failed(&self) -> bool {
        let r = self.task_ref();
        r.tree.lock().node(r.key).map(|n| n.failed).unwrap_or(false)
    }

    /// False once the node was discarded by an ancestor's `restart`.
    fn is_alive(&self) -> bool {
        let r = self.task_ref();
        r.tree.lock().node(r.key).is_some()
    }

    fn snapshot(&self) -> Option<TaskSnapshot> {
        let r = self.task_ref();
        r.tree.lock().snapshot(r.key)
    }

    fn same_task(&self, other: &impl ProgressTask) -> bool {
        let (a, b) = (self.task_ref(), other.task_ref());
        a.key == b.key && a.tree.same_tree(&b.tree)
    }
}

macro_rules! task_handle {
    ($name:ident, $kind:expr) => {
        impl ProgressTask for $name {
            const KIND: TaskKind = $kind;

            fn task_ref(&self) -> &TaskRef {
                &self.0
            }

            fn from_task_ref(task_ref: TaskRef) -> Self {
                Self(task_ref)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("progress", &self.progress())
                    .field("message", &self.last_message())
                    .finish()
            }
        }
    };
}

/// A task split into N equally weighted slots.
#[derive(Clone)]
pub struct FiniteTask(TaskRef);

/// A task measured by `current / max` (e.g. bytes transferred).
#[derive(Clone)]
pub struct VariableTask(TaskRef);

/// A task that is either not done (0.0) or done (1.0).
#[derive(Clone)]
pub struct BooleanTask(TaskRef);

task_handle!(FiniteTask, TaskKind::Finite);
task_handle!(VariableTask, TaskKind::Variable);
task_handle!(BooleanTask, TaskKind::Boolean);

impl FiniteTask {
    /// Create the root of a new task tree with no slots.
    pub fn new() -> Self {
        Self(TaskRef::new_root(TaskKind::Finite))
    }

    pub fn with_max(max: usize) -> Self {
        let task = Self::new();
        task.set_max(max);
        task
    }

    /// Number of slots currently allocated.
    pub fn max(&self) -> usize {
        match self.0.tree.lock().node(self.0.key).map(|n| &n.body) {
            Some(NodeBody::Finite { slots, .. }) => slots.len(),
            _ => 0,
        }
    }

    /// Grow or shrink the slot vector; re-notifies progress if started.
    pub fn set_max(&self, max: usize) {
        let key = self.0.key;
        self.0.tree.apply(|state, out| {
            for child in state.set_max(key, max) {
                state.remove_subtree(child);
            }
            let Some(node) = state.node(key) else {
                return;
            };
            if node.started {
                let message = node.last_message.clone();
                state.refresh(key, &message, out);
            }
        });
    }

    /// Mark the next slot as done.
    pub fn done(&self, message: &str) {
        let key = self.0.key;
        self.0.tree.apply(|state, out| {
            if state.is_completed(key) {
                return;
            }
            state.ensure_started(key, message, out);
            state.claim_slot(key, Slot::Done);
            state.refresh(key, message, out);
        });
    }

    /// Start a sub-task of kind `T` in the next slot.
    ///
    /// This is the only way children are attached to a tree.
    pub fn begin<T: ProgressTask>(&self, message: &str) -> T {
        let parent = self.0.key;
        let child = self.0.tree.apply(|state, out| {
            let attached = state.node(parent).is_some();
            let child = state.insert(T::KIND, attached.then_some(parent));
            if attached {
                state.ensure_started(parent, message, out);
                state.claim_slot(parent, Slot::Sub(child));
            }
            state.ensure_started(child, message, out);
            if attached {
                state.refresh(parent, message, out);
            }
            child
        });
        T::from_task_ref(TaskRef {
            tree: self.0.tree.clone(),
            key: child,
        })
    }
}

impl Default for FiniteTask {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableTask {
    pub fn new(max: u64) -> Self {
        let task = Self(TaskRef::new_root(TaskKind::Variable));
        task.set_max(max);
        task
    }

    fn with_counters<R>(&self, f: impl FnOnce(&mut u64, &mut u64) -> R) -> Option<R> {
        let mut state = self.0.tree.lock();
        match state.node_mut(self.0.key).map(|n| &mut n.body) {
            Some(NodeBody::Variable { current, max }) => Some(f(current, max)),
            _ => None,
        }
    }

    pub fn set_max(&self, value: u64) {
        self.with_counters(|_, max| *max = value);
    }

    pub fn current(&self) -> u64 {
        self.with_counters(|current, _| *current).unwrap_or(0)
    }

    pub fn max(&self) -> u64 {
        self.with_counters(|_, max| *max).unwrap_or(0)
    }

    /// Set `current` and re-notify. Completion is not pushed: it is
    /// observed lazily through `is_completed`.
    pub fn update(&self, value: u64) {
        let key = self.0.key;
        self.0.tree.apply(|state, out| {
            let Some(node) = state.node_mut(key) else {
                return;
            };
            if node.completed {
                return;
            }
            let message = node.last_message.clone();
            if let NodeBody::Variable { current, .. } = &mut node.body {
                *current = value;
            }
            state.ensure_started(key, &message, out);
            state.refresh(key, &message, out);
        });
    }
}

impl BooleanTask {
    pub fn new() -> Self {
        Self(TaskRef::new_root(TaskKind::Boolean))
    }
}

impl Default for BooleanTask {
    fn default() -> Self {
        Self::new()
    }
}
