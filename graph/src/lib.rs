/*
 * Copyright 2026 The quern project developers
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Pure functions over the task DAG.
//!
//! Nothing here knows what a task *is*; callers implement
//! [`DependencyGraph`] over whatever node handle they use. The planner feeds
//! goals through `transitive_inputs` → `topo_sorted` →
//! `group_around_important` to obtain evaluation groups.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;

use petgraph::graph::NodeIndex;

mod multi_bimap;
pub use multi_bimap::MultiBiMap;

/// Adjacency oracle for a task DAG. Edges point from a node to its inputs.
pub trait DependencyGraph {
    type Node: Copy + Eq + Hash + fmt::Debug;

    fn inputs(&self, node: Self::Node) -> &[Self::Node];
}

/// Breadth-first closure over `.inputs`, preserving first-discovery order.
pub fn transitive_inputs<G: DependencyGraph>(graph: &G, goals: &[G::Node]) -> Vec<G::Node> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    for &goal in goals {
        if seen.insert(goal) {
            order.push(goal);
            queue.push_back(goal);
        }
    }
    while let Some(node) = queue.pop_front() {
        for &input in graph.inputs(node) {
            if seen.insert(input) {
                order.push(input);
                queue.push_back(input);
            }
        }
    }
    order
}

/// A sequence of nodes known to be in dependency order (inputs first).
///
/// The newtype keeps "must already be sorted" arguments honest at the type
/// level; the only way to get one is through [`topo_sorted`].
#[derive(Debug)]
pub struct TopoSorted<N>(Vec<N>);

impl<N> TopoSorted<N> {
    pub fn values(&self) -> &[N] {
        &self.0
    }

    pub fn into_values(self) -> Vec<N> {
        self.0
    }
}

/// One or more dependency cycles. The data model forbids them, so hitting
/// this means the task definitions are broken; the error renders every
/// offending cycle.
#[derive(Debug, PartialEq, Eq)]
pub struct CycleError<N> {
    pub cycles: Vec<Vec<N>>,
}

impl<N: fmt::Display> fmt::Display for CycleError<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle detected in task graph: ")?;
        for (i, cycle) in self.cycles.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            for node in cycle {
                write!(f, "{} -> ", node)?;
            }
            if let Some(first) = cycle.first() {
                write!(f, "{}", first)?;
            }
        }
        Ok(())
    }
}

impl<N: fmt::Debug + fmt::Display> std::error::Error for CycleError<N> {}

/// Deterministic topological sort (inputs before dependents).
///
/// Strongly connected components are computed over the dependency edges;
/// any component larger than one node, or any self-edge, is a cycle and
/// fails the sort.
pub fn topo_sorted<G: DependencyGraph>(
    graph: &G,
    nodes: &[G::Node],
) -> Result<TopoSorted<G::Node>, CycleError<G::Node>> {
    let mut pg = petgraph::Graph::<G::Node, ()>::new();
    let mut indices: HashMap<G::Node, NodeIndex> = HashMap::new();
    for &node in nodes {
        indices.entry(node).or_insert_with(|| pg.add_node(node));
    }
    for &node in nodes {
        let from = indices[&node];
        for input in graph.inputs(node) {
            // The node set is expected to be closed under `.inputs`.
            debug_assert!(indices.contains_key(input), "{:?} outside node set", input);
            if let Some(&to) = indices.get(input) {
                pg.add_edge(from, to, ());
            }
        }
    }

    // tarjan_scc emits components dependencies-first for this edge
    // direction, so the flattened order is already topological.
    let sccs = petgraph::algo::tarjan_scc(&pg);
    let cycles: Vec<Vec<G::Node>> = sccs
        .iter()
        .filter(|scc| {
            scc.len() > 1 || scc.iter().any(|&ix| pg.find_edge(ix, ix).is_some())
        })
        .map(|scc| scc.iter().map(|&ix| pg[ix]).collect())
        .collect();
    if !cycles.is_empty() {
        return Err(CycleError { cycles });
    }

    Ok(TopoSorted(
        sccs.into_iter().flatten().map(|ix| pg[ix]).collect(),
    ))
}

/// How the planner sees a node when forming groups.
pub enum Classify<T> {
    /// A user-visible node that heads its own group.
    Important(T),
    /// An anonymous node explicitly requested by the caller; also heads a
    /// group.
    Requested(T),
    /// Everything else; absorbed into the nearest downstream group head.
    Anonymous,
}

/// Coalesces a sorted DAG into groups around its important nodes.
///
/// Walking terminals in topological order, each one claims every
/// still-unclaimed node in its input closure. A node therefore lands in the
/// group of its nearest downstream important consumer, and each group's
/// terminal is its own last member in dependency order.
pub fn group_around_important<G, T, F>(
    graph: &G,
    topo: &TopoSorted<G::Node>,
    classify: F,
) -> MultiBiMap<T, G::Node>
where
    G: DependencyGraph,
    T: Clone + Eq + Hash,
    F: Fn(G::Node) -> Classify<T>,
{
    let mut output: MultiBiMap<T, G::Node> = MultiBiMap::new();
    for &node in topo.values() {
        let terminal = match classify(node) {
            Classify::Important(t) | Classify::Requested(t) => t,
            Classify::Anonymous => continue,
        };
        let mut collected = HashSet::new();
        collect_unclaimed(graph, &output, node, &mut collected);
        let group = topo
            .values()
            .iter()
            .copied()
            .filter(|n| collected.contains(n));
        output.add_all(terminal, group);
    }
    output
}

fn collect_unclaimed<G, T>(
    graph: &G,
    output: &MultiBiMap<T, G::Node>,
    node: G::Node,
    collected: &mut HashSet<G::Node>,
) where
    G: DependencyGraph,
    T: Clone + Eq + Hash,
{
    if collected.contains(&node) || output.contains_value(&node) {
        return;
    }
    collected.insert(node);
    for &input in graph.inputs(node) {
        collect_unclaimed(graph, output, input, collected);
    }
}
