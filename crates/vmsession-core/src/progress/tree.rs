//! Task tree state: node table plus the aggregation and propagation rules.
//!
//! All mutation happens through `TaskTree::apply`, which runs the operation
//! under the tree lock, collects the resulting notifications, and fires them
//! once the lock is released.
//!
//! # 伝播の順序
//! 1. `last_message` を更新
//! 2. 自ノードのコールバックを発火
//! 3. 親ノードの通知関数を呼ぶ（ルートまで同期的に連鎖）

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::arena::{Arena, NodeKey};
use super::events::{Notification, Observers};

/// The three aggregation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Finite,
    Variable,
    Boolean,
}

/// One unit of a finite task's step allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Pending,
    Done,
    Sub(NodeKey),
}

pub(crate) enum NodeBody {
    Finite { slots: Vec<Slot>, cursor: usize },
    Variable { current: u64, max: u64 },
    Boolean,
}

impl NodeBody {
    pub fn empty(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Finite => NodeBody::Finite {
                slots: Vec::new(),
                cursor: 0,
            },
            TaskKind::Variable => NodeBody::Variable { current: 0, max: 0 },
            TaskKind::Boolean => NodeBody::Boolean,
        }
    }

    fn kind(&self) -> TaskKind {
        match self {
            NodeBody::Finite { .. } => TaskKind::Finite,
            NodeBody::Variable { .. } => TaskKind::Variable,
            NodeBody::Boolean => TaskKind::Boolean,
        }
    }
}

pub(crate) struct TaskNode {
    pub started: bool,
    pub completed: bool,
    pub failed: bool,
    pub last_message: String,
    /// Back-reference for upward propagation only; the parent owns its slots.
    pub parent: Option<NodeKey>,
    pub body: NodeBody,
    pub observers: Observers,
}

impl TaskNode {
    fn new(kind: TaskKind, parent: Option<NodeKey>) -> Self {
        Self {
            started: false,
            completed: false,
            failed: false,
            last_message: String::new(),
            parent,
            body: NodeBody::empty(kind),
            observers: Observers::default(),
        }
    }
}

/// Serializable view of a task and its sub-tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub kind: TaskKind,
    pub message: String,
    pub progress: f64,
    pub started: bool,
    pub completed: bool,
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskSnapshot>,
}

pub(crate) struct TreeState {
    nodes: Arena<TaskNode>,
}

impl TreeState {
    pub fn node(&self, key: NodeKey) -> Option<&TaskNode> {
        self.nodes.get(key)
    }

    pub fn node_mut(&mut self, key: NodeKey) -> Option<&mut TaskNode> {
        self.nodes.get_mut(key)
    }

    pub fn insert(&mut self, kind: TaskKind, parent: Option<NodeKey>) -> NodeKey {
        self.nodes.insert(TaskNode::new(kind, parent))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Aggregated progress in `[0.0, 1.0]`.
    pub fn progress(&self, key: NodeKey) -> f64 {
        let Some(node) = self.nodes.get(key) else {
            return 0.0;
        };
        if node.completed && !node.failed {
            return 1.0;
        }
        match &node.body {
            NodeBody::Finite { slots, .. } => {
                if slots.is_empty() {
                    return 0.0;
                }
                let weight = 1.0 / slots.len() as f64;
                slots
                    .iter()
                    .map(|slot| match slot {
                        Slot::Pending => 0.0,
                        Slot::Done => 1.0,
                        Slot::Sub(child) => self.progress(*child),
                    })
                    .sum::<f64>()
                    * weight
            }
            NodeBody::Variable { current, max } => {
                if *max == 0 {
                    0.0
                } else {
                    (*current as f64 / *max as f64).min(1.0)
                }
            }
            NodeBody::Boolean => 0.0,
        }
    }

    /// Variable tasks complete lazily once `current` reaches `max`.
    pub fn is_completed(&self, key: NodeKey) -> bool {
        match self.nodes.get(key) {
            Some(node) if node.completed => true,
            Some(TaskNode {
                body: NodeBody::Variable { current, max },
                ..
            }) => *max > 0 && current >= max,
            _ => false,
        }
    }

    fn is_resolved(&self, slot: &Slot) -> bool {
        match slot {
            Slot::Pending => false,
            Slot::Done => true,
            Slot::Sub(child) => {
                self.is_completed(*child)
                    && !self.nodes.get(*child).map(|n| n.failed).unwrap_or(false)
            }
        }
    }

    fn all_slots_resolved(&self, key: NodeKey) -> bool {
        match self.nodes.get(key).map(|n| &n.body) {
            Some(NodeBody::Finite { slots, .. }) if !slots.is_empty() => {
                slots.iter().all(|slot| self.is_resolved(slot))
            }
            _ => false,
        }
    }

    /// Mark `key` (and any not-yet-started ancestor) as started.
    pub fn ensure_started(&mut self, key: NodeKey, message: &str, out: &mut Vec<Notification>) {
        let parent = match self.nodes.get_mut(key) {
            Some(node) if !node.started => {
                node.started = true;
                node.last_message = message.to_string();
                node.observers.started(message, out);
                node.parent
            }
            _ => return,
        };
        if let Some(parent) = parent {
            self.ensure_started(parent, message, out);
        }
    }

    /// Re-notify progress on `key` and every ancestor.
    ///
    /// A finite task whose slots are all resolved completes itself here.
    pub fn refresh(&mut self, key: NodeKey, message: &str, out: &mut Vec<Notification>) {
        let auto_complete = !self.is_completed(key) && self.all_slots_resolved(key);
        if auto_complete {
            self.complete(key, message, out);
            return;
        }

        let value = self.progress(key);
        let parent = match self.nodes.get_mut(key) {
            Some(node) => {
                node.last_message = message.to_string();
                node.observers.progress(value, message, out);
                node.parent
            }
            None => return,
        };
        if let Some(parent) = parent {
            self.refresh(parent, message, out);
        }
    }

    pub fn complete(&mut self, key: NodeKey, message: &str, out: &mut Vec<Notification>) {
        if self.nodes.get(key).map(|n| n.completed).unwrap_or(true) {
            return;
        }
        self.ensure_started(key, message, out);
        let parent = match self.nodes.get_mut(key) {
            Some(node) => {
                node.completed = true;
                node.last_message = message.to_string();
                node.observers.progress(1.0, message, out);
                node.observers.completed(message, out);
                node.parent
            }
            None => return,
        };
        if let Some(parent) = parent {
            self.refresh(parent, message, out);
        }
    }

    /// Fail `key`; each not-yet-terminal ancestor fails once as well.
    pub fn fail(&mut self, key: NodeKey, message: &str, code: i32, out: &mut Vec<Notification>) {
        if self.nodes.get(key).map(|n| n.completed).unwrap_or(true) {
            return;
        }
        self.ensure_started(key, message, out);
        let parent = match self.nodes.get_mut(key) {
            Some(node) => {
                node.completed = true;
                node.failed = true;
                node.last_message = message.to_string();
                node.observers.error(message, code, out);
                node.parent
            }
            None => return,
        };
        if let Some(parent) = parent {
            self.fail(parent, message, code, out);
        }
    }

    /// Claim the next free slot of a finite task, growing it if every slot
    /// is already taken.
    pub fn claim_slot(&mut self, key: NodeKey, slot: Slot) -> bool {
        let Some(node) = self.nodes.get_mut(key) else {
            return false;
        };
        let NodeBody::Finite { slots, cursor } = &mut node.body else {
            return false;
        };
        if *cursor >= slots.len() {
            warn!(
                max = slots.len(),
                "finite task received more steps than allocated; growing"
            );
            slots.push(Slot::Pending);
        }
        slots[*cursor] = slot;
        *cursor += 1;
        true
    }

    /// Resize the slot vector; truncated sub-tasks are dropped.
    pub fn set_max(&mut self, key: NodeKey, max: usize) -> Vec<NodeKey> {
        let Some(node) = self.nodes.get_mut(key) else {
            return Vec::new();
        };
        let NodeBody::Finite { slots, cursor } = &mut node.body else {
            return Vec::new();
        };
        let dropped = if max < slots.len() {
            slots
                .drain(max..)
                .filter_map(|slot| match slot {
                    Slot::Sub(child) => Some(child),
                    _ => None,
                })
                .collect()
        } else {
            slots.resize(max, Slot::Pending);
            Vec::new()
        };
        *cursor = (*cursor).min(max);
        dropped
    }

    /// Remove `key` and everything below it.
    pub fn remove_subtree(&mut self, key: NodeKey) {
        if let Some(node) = self.nodes.remove(key)
            && let NodeBody::Finite { slots, .. } = node.body
        {
            for slot in slots {
                if let Slot::Sub(child) = slot {
                    self.remove_subtree(child);
                }
            }
        }
    }

    /// Reset `key` to a freshly started state, discarding all sub-tasks.
    pub fn restart(&mut self, key: NodeKey, message: &str, out: &mut Vec<Notification>) {
        let children: Vec<NodeKey> = match self.nodes.get_mut(key) {
            Some(node) => {
                let children = match &mut node.body {
                    NodeBody::Finite { slots, cursor } => {
                        let children = slots
                            .iter()
                            .filter_map(|slot| match slot {
                                Slot::Sub(child) => Some(*child),
                                _ => None,
                            })
                            .collect();
                        slots.iter_mut().for_each(|slot| *slot = Slot::Pending);
                        *cursor = 0;
                        children
                    }
                    NodeBody::Variable { current, .. } => {
                        *current = 0;
                        Vec::new()
                    }
                    NodeBody::Boolean => Vec::new(),
                };
                node.started = false;
                node.completed = false;
                node.failed = false;
                children
            }
            None => return,
        };
        for child in children {
            self.remove_subtree(child);
        }
        self.ensure_started(key, message, out);
    }

    pub fn snapshot(&self, key: NodeKey) -> Option<TaskSnapshot> {
        let node = self.nodes.get(key)?;
        let children = match &node.body {
            NodeBody::Finite { slots, .. } => slots
                .iter()
                .filter_map(|slot| match slot {
                    Slot::Sub(child) => self.snapshot(*child),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        Some(TaskSnapshot {
            kind: node.body.kind(),
            message: node.last_message.clone(),
            progress: self.progress(key),
            started: node.started,
            completed: self.is_completed(key),
            failed: node.failed,
            children,
        })
    }
}

/// Shared handle on the node table of one task tree.
#[derive(Clone)]
pub(crate) struct TaskTree {
    inner: Arc<Mutex<TreeState>>,
}

impl TaskTree {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TreeState {
                nodes: Arena::new(),
            })),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the lock, then fire whatever it queued.
    pub fn apply<R>(&self, f: impl FnOnce(&mut TreeState, &mut Vec<Notification>) -> R) -> R {
        let mut out = Vec::new();
        let result = {
            let mut state = self.lock();
            f(&mut state, &mut out)
        };
        for notification in out {
            notification.fire();
        }
        result
    }

    pub fn same_tree(&self, other: &TaskTree) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_finite_task_has_zero_progress() {
        let tree = TaskTree::new();
        let root = tree.lock().insert(TaskKind::Finite, None);
        assert_eq!(tree.lock().progress(root), 0.0);
    }

    #[test]
    fn set_max_drops_truncated_subtasks() {
        let tree = TaskTree::new();
        let mut state = tree.lock();
        let root = state.insert(TaskKind::Finite, None);
        state.set_max(root, 2);
        state.claim_slot(root, Slot::Done);
        let child = state.insert(TaskKind::Boolean, Some(root));
        state.claim_slot(root, Slot::Sub(child));

        let dropped = state.set_max(root, 1);
        assert_eq!(dropped, vec![child]);
        for key in dropped {
            state.remove_subtree(key);
        }
        assert_eq!(state.len(), 1);
        assert_eq!(state.progress(root), 1.0);
    }

    #[test]
    fn variable_completion_is_lazy() {
        let tree = TaskTree::new();
        let mut state = tree.lock();
        let key = state.insert(TaskKind::Variable, None);
        if let Some(TaskNode {
            body: NodeBody::Variable { current, max },
            ..
        }) = state.node_mut(key)
        {
            *current = 10;
            *max = 10;
        }
        assert!(state.is_completed(key));
        assert!(!state.node(key).map(|n| n.completed).unwrap_or(true));
    }
}
