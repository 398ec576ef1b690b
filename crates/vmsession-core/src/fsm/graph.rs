//! FsmBuilder - 状態グラフの構築
//!
//! The graph is declared once (`new` / `add`×N / `build`) and is immutable
//! afterwards. Edges are indices into the node table owned by the graph, so
//! cyclic graphs need no reference counting.
//!
//! # Fail-fast 設計
//! Dangling ids are rejected by `build()` with a `BuildError` instead of
//! resolving to an invalid node.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::error;

use super::action::{Action, ActionContext, ActionError};
use super::machine::Fsm;
use super::StateId;

/// BuildError はグラフ構築時のエラー
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("no nodes were declared")]
    Empty,

    #[error("root state {0} was never declared")]
    UnknownRoot(StateId),

    #[error("node {node} links to undeclared state {child}")]
    UnknownChild { node: StateId, child: StateId },
}

pub(crate) struct GraphNode {
    pub id: StateId,
    /// `None` marks a pure state: it is routed through, never executed.
    pub action: Option<Arc<dyn Action>>,
    pub children: Vec<usize>,
}

/// Immutable node table.
pub(crate) struct Graph {
    pub nodes: Vec<GraphNode>,
    index: HashMap<StateId, usize>,
}

impl Graph {
    pub fn index_of(&self, id: StateId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn id_of(&self, index: usize) -> StateId {
        self.nodes[index].id
    }

    pub fn has_action(&self, index: usize) -> bool {
        self.nodes[index].action.is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

struct Declaration {
    action: Option<Arc<dyn Action>>,
    links: Vec<StateId>,
}

/// Declarative registry of states and actions.
///
/// # 使用例
/// ```ignore
/// let fsm = FsmBuilder::new()
///     .state(1, &[100])
///     .action(100, |ctx| { ctx.doing("working"); ctx.done("worked"); Ok(()) }, &[2])
///     .state(2, &[])
///     .build(1)?;
/// ```
#[derive(Default)]
pub struct FsmBuilder {
    name: Option<String>,
    declarations: BTreeMap<StateId, Declaration>,
}

impl FsmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label used in log lines and the worker thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Insert or overwrite node `id` with its outgoing links.
    ///
    /// Links are kept in declaration order; the router breaks ties by it.
    pub fn add(mut self, id: StateId, action: Option<Arc<dyn Action>>, links: &[StateId]) -> Self {
        self.declarations.insert(
            id,
            Declaration {
                action,
                links: links.to_vec(),
            },
        );
        self
    }

    /// Declare a pure state marker.
    pub fn state(self, id: StateId, links: &[StateId]) -> Self {
        self.add(id, None, links)
    }

    /// Declare an executable node from a closure.
    pub fn action<F>(self, id: StateId, f: F, links: &[StateId]) -> Self
    where
        F: Fn(&ActionContext) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        self.add(id, Some(Arc::new(f)), links)
    }

    /// Declare an executable node from an `Action` implementation.
    pub fn handler(self, id: StateId, action: impl Action, links: &[StateId]) -> Self {
        self.add(id, Some(Arc::new(action)), links)
    }

    /// Resolve every link and produce the machine, positioned on `root`.
    pub fn build(self, root: StateId) -> Result<Fsm, BuildError> {
        let name = self.name.clone().unwrap_or_else(|| "fsm".to_string());
        let (graph, root) = self.into_graph(root)?;
        Ok(Fsm::from_graph(name, graph, root))
    }

    pub(crate) fn into_graph(self, root: StateId) -> Result<(Graph, usize), BuildError> {
        if self.declarations.is_empty() {
            return Err(BuildError::Empty);
        }

        let index: HashMap<StateId, usize> = self
            .declarations
            .keys()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();

        let mut nodes = Vec::with_capacity(self.declarations.len());
        for (id, decl) in self.declarations {
            let mut children = Vec::with_capacity(decl.links.len());
            for link in decl.links {
                match index.get(&link) {
                    Some(i) => children.push(*i),
                    None => {
                        error!(node = id, child = link, "graph links to an undeclared state");
                        return Err(BuildError::UnknownChild { node: id, child: link });
                    }
                }
            }
            nodes.push(GraphNode {
                id,
                action: decl.action,
                children,
            });
        }

        let root = *index.get(&root).ok_or(BuildError::UnknownRoot(root))?;
        Ok((Graph { nodes, index }, root))
    }
}
