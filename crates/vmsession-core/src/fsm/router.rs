//! Path search over the state graph.
//!
//! Depth-first search with branch-and-bound:
//! - `clip` starts at the node count and prunes any partial path whose length
//!   reaches it.
//! - Reaching the target records the path (target included) as the new best,
//!   tightens `clip` to the length of the partial path, and abandons the
//!   remaining children of the node that reached it.
//! - Nodes already on the partial path are skipped, so cycles are safe.
//!
//! Children are visited in declaration order, which is also the tie-break
//! between paths of equal length. The result is the first minimal path found
//! in that order, not necessarily the graph-theoretic shortest path.

use super::graph::Graph;
use super::StateId;

/// Find the route from node `from` to state `target`.
///
/// The returned path starts with `from`. When `from` already is `target`
/// the path is just `[from]`.
pub(crate) fn find_path(graph: &Graph, from: usize, target: StateId) -> Option<Vec<usize>> {
    if graph.id_of(from) == target {
        return Some(vec![from]);
    }

    let mut clip = graph.len();
    let mut best: Option<Vec<usize>> = None;

    // path[i] is a node on the partial route, cursors[i] the next child of
    // path[i] still to explore.
    let mut path: Vec<usize> = vec![from];
    let mut cursors: Vec<usize> = vec![0];
    if path.len() >= clip {
        return None;
    }

    while let Some(&node) = path.last() {
        let depth = path.len() - 1;
        let next = cursors[depth];
        let children = &graph.nodes[node].children;

        if next >= children.len() {
            path.pop();
            cursors.pop();
            continue;
        }
        cursors[depth] += 1;

        let child = children[next];
        if path.contains(&child) {
            continue;
        }

        if graph.id_of(child) == target {
            clip = path.len();
            let mut found = path.clone();
            found.push(child);
            best = Some(found);

            path.pop();
            cursors.pop();
            continue;
        }

        path.push(child);
        cursors.push(0);
        if path.len() >= clip {
            path.pop();
            cursors.pop();
        }
    }

    best
}
