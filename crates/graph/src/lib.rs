//! Adaptive communication graph over registered agents.
//!
//! Edges come from oracle scores between one agent's needs and another's
//! offers. Two edge-selection algorithms coexist and are intentionally
//! distinct:
//!
//! * [`CommunicationGraph::rebuild`] is a *first-fit* pass: pairs are visited
//!   in registration order and an edge is kept as soon as it qualifies and
//!   both endpoints still have room. Which edges survive the neighbor cap
//!   depends on iteration order, not on score rank.
//! * [`CommunicationGraph::update_one`] is a *ranked partial update*: only one
//!   node's edges are recomputed, candidates are sorted by combined score and
//!   accepted greedily.
//!
//! For the same scores the two can disagree once the neighbor cap binds.

use negotopo_core::{
    now_ms, AgentId, Edge, GraphStats, NegotiationError, NodeProfile, Result, TopologySnapshot,
};
use negotopo_oracle::CompatibilityOracle;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Minimum combined score for an edge.
    pub threshold: f32,
    pub max_neighbors: usize,
    /// Mirror every edge and require both directional scores to pass.
    pub bidirectional: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            max_neighbors: 5,
            bidirectional: true,
        }
    }
}

impl GraphConfig {
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_max_neighbors(mut self, max_neighbors: usize) -> Self {
        self.max_neighbors = max_neighbors;
        self
    }

    pub fn with_bidirectional(mut self, bidirectional: bool) -> Self {
        self.bidirectional = bidirectional;
        self
    }
}

type Sides<'a> = (&'a [String], &'a [String]);

pub struct CommunicationGraph {
    config: GraphConfig,
    oracle: Arc<dyn CompatibilityOracle>,
    nodes: Vec<AgentId>,
    adjacency: HashMap<AgentId, Vec<AgentId>>,
    weights: HashMap<AgentId, HashMap<AgentId, f32>>,
}

impl CommunicationGraph {
    pub fn new(config: GraphConfig, oracle: Arc<dyn CompatibilityOracle>) -> Self {
        Self {
            config,
            oracle,
            nodes: Vec::new(),
            adjacency: HashMap::new(),
            weights: HashMap::new(),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn register(&mut self, id: &AgentId) -> Result<()> {
        if self.adjacency.contains_key(id) {
            return Err(NegotiationError::DuplicateNode(id.clone()));
        }
        self.nodes.push(id.clone());
        self.adjacency.insert(id.clone(), Vec::new());
        self.weights.insert(id.clone(), HashMap::new());
        Ok(())
    }

    /// Removes a node and every edge touching it. Unknown ids are a no-op.
    pub fn unregister(&mut self, id: &AgentId) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.detach(id);
        self.nodes.retain(|n| n != id);
        self.adjacency.remove(id);
        self.weights.remove(id);
        true
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.adjacency.contains_key(id)
    }

    /// Nodes in registration order.
    pub fn nodes(&self) -> &[AgentId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Neighbors in insertion order; empty for isolated or unknown nodes.
    pub fn neighbors(&self, id: &AgentId) -> &[AgentId] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_edge(&self, from: &AgentId, to: &AgentId) -> bool {
        self.edge_weight(from, to).is_some()
    }

    pub fn edge_weight(&self, from: &AgentId, to: &AgentId) -> Option<f32> {
        self.weights.get(from).and_then(|m| m.get(to)).copied()
    }

    /// Undirected pairs in bidirectional mode, directed edges otherwise.
    pub fn edge_count(&self) -> usize {
        let directed: usize = self.weights.values().map(HashMap::len).sum();
        if self.config.bidirectional {
            directed / 2
        } else {
            directed
        }
    }

    pub fn stats(&self) -> GraphStats {
        let n = self.nodes.len();
        let edges = self.edge_count();
        let density = if n > 1 {
            edges as f32 / (n * (n - 1)) as f32
        } else {
            0.0
        };
        GraphStats {
            nodes: n,
            edges,
            density,
        }
    }

    /// Every stored directed edge, in registration then adjacency order.
    pub fn edges(&self) -> Vec<Edge> {
        let mut out = Vec::new();
        for from in &self.nodes {
            for to in self.neighbors(from) {
                if let Some(weight) = self.edge_weight(from, to) {
                    out.push(Edge {
                        from: from.clone(),
                        to: to.clone(),
                        weight,
                    });
                }
            }
        }
        out
    }

    pub fn snapshot(&self, round: usize) -> TopologySnapshot {
        TopologySnapshot {
            round,
            stats: self.stats(),
            edges: self.edges(),
            ts_unix_ms: now_ms(),
        }
    }

    pub fn clear_edges(&mut self) {
        for list in self.adjacency.values_mut() {
            list.clear();
        }
        for m in self.weights.values_mut() {
            m.clear();
        }
    }

    /// Removes `from -> to` (and its mirror in bidirectional mode).
    pub fn remove_edge(&mut self, from: &AgentId, to: &AgentId) -> bool {
        let removed = self.unlink(from, to);
        if self.config.bidirectional {
            self.unlink(to, from);
        }
        removed
    }

    fn unlink(&mut self, from: &AgentId, to: &AgentId) -> bool {
        if let Some(list) = self.adjacency.get_mut(from) {
            list.retain(|n| n != to);
        }
        self.weights
            .get_mut(from)
            .map(|m| m.remove(to).is_some())
            .unwrap_or(false)
    }

    /// Drops every edge into or out of `id`.
    fn detach(&mut self, id: &AgentId) {
        if let Some(list) = self.adjacency.get_mut(id) {
            list.clear();
        }
        for list in self.adjacency.values_mut() {
            list.retain(|n| n != id);
        }
        if let Some(m) = self.weights.get_mut(id) {
            m.clear();
        }
        for m in self.weights.values_mut() {
            m.remove(id);
        }
    }

    fn degree(&self, id: &AgentId) -> usize {
        self.neighbors(id).len()
    }

    fn link(&mut self, a: &AgentId, b: &AgentId, weight: f32) {
        let mut add = |from: &AgentId, to: &AgentId| {
            if let Some(list) = self.adjacency.get_mut(from) {
                if !list.contains(to) {
                    list.push(to.clone());
                }
            }
            if let Some(m) = self.weights.get_mut(from) {
                m.insert(to.clone(), weight);
            }
        };
        add(a, b);
        if self.config.bidirectional {
            add(b, a);
        }
    }

    /// Oracles are trusted to stay in `[0, 1]`; anything else would turn
    /// into a negative or NaN edge weight.
    fn bounded(score: f32) -> f32 {
        if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 1.0)
        }
    }

    fn qualifies(&self, ab: f32, ba: f32) -> bool {
        let t = self.config.threshold;
        let combined = (ab + ba) / 2.0;
        combined >= t && (!self.config.bidirectional || (ab >= t && ba >= t))
    }

    fn sides<'a>(lookup: &HashMap<&AgentId, Sides<'a>>, id: &AgentId) -> Sides<'a> {
        lookup.get(id).copied().unwrap_or_default()
    }

    fn lookup<'a>(profiles: &[NodeProfile<'a>]) -> HashMap<&'a AgentId, Sides<'a>> {
        profiles.iter().map(|p| (p.id, (p.needs, p.offers))).collect()
    }

    /// Clears all edges and recomputes them with the first-fit policy.
    ///
    /// Nodes without a profile score as having no needs and no offers.
    pub fn rebuild(&mut self, profiles: &[NodeProfile<'_>]) -> GraphStats {
        self.clear_edges();
        let lookup = Self::lookup(profiles);
        let nodes = self.nodes.clone();
        let n = nodes.len();

        // Directional scores are independent, so compute them up front.
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
            .collect();
        let oracle = &self.oracle;
        let scored: Vec<(usize, usize, f32)> = pairs
            .par_iter()
            .map(|&(i, j)| {
                let (needs, _) = Self::sides(&lookup, &nodes[i]);
                let (_, offers) = Self::sides(&lookup, &nodes[j]);
                (i, j, Self::bounded(oracle.score(needs, offers)))
            })
            .collect();
        let mut matrix = vec![0f32; n * n];
        for (i, j, s) in scored {
            matrix[i * n + j] = s;
        }

        let cap = self.config.max_neighbors;
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let (ab, ba) = (matrix[i * n + j], matrix[j * n + i]);
                if !self.qualifies(ab, ba) {
                    continue;
                }
                let (a, b) = (&nodes[i], &nodes[j]);
                if self.has_edge(a, b) {
                    continue;
                }
                if self.degree(a) >= cap || self.degree(b) >= cap {
                    tracing::trace!(%a, %b, "edge skipped, neighbor cap reached");
                    continue;
                }
                self.link(a, b, 1.0 - (ab + ba) / 2.0);
            }
        }

        let stats = self.stats();
        tracing::info!(
            nodes = stats.nodes,
            edges = stats.edges,
            density = stats.density,
            "topology rebuilt"
        );
        stats
    }

    /// Recomputes only `id`'s edges, accepting candidates by descending
    /// combined score. Returns the node's new degree.
    pub fn update_one(&mut self, id: &AgentId, profiles: &[NodeProfile<'_>]) -> Result<usize> {
        if !self.contains(id) {
            return Err(NegotiationError::UnknownAgent(id.clone()));
        }
        self.detach(id);

        let lookup = Self::lookup(profiles);
        let (my_needs, my_offers) = Self::sides(&lookup, id);
        let others: Vec<AgentId> = self.nodes.iter().filter(|n| *n != id).cloned().collect();
        let oracle = &self.oracle;
        let scored: Vec<(f32, f32)> = others
            .par_iter()
            .map(|other| {
                let (needs, offers) = Self::sides(&lookup, other);
                (
                    Self::bounded(oracle.score(my_needs, offers)),
                    Self::bounded(oracle.score(needs, my_offers)),
                )
            })
            .collect();

        let mut candidates: Vec<(&AgentId, f32)> = others
            .iter()
            .zip(scored)
            .filter(|(_, (ab, ba))| self.qualifies(*ab, *ba))
            .map(|(other, (ab, ba))| (other, (ab + ba) / 2.0))
            .collect();
        // Stable sort keeps registration order among equal scores.
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let cap = self.config.max_neighbors;
        for (other, combined) in candidates {
            if self.degree(id) >= cap {
                break;
            }
            if self.degree(other) >= cap {
                continue;
            }
            self.link(id, other, 1.0 - combined);
        }

        let degree = self.degree(id);
        tracing::debug!(agent = %id, degree, "partial topology update");
        Ok(degree)
    }

    /// Unweighted BFS. Ties resolve by adjacency order.
    pub fn shortest_path(&self, from: &AgentId, to: &AgentId) -> Option<Vec<AgentId>> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }
        if from == to {
            return Some(vec![from.clone()]);
        }

        let mut prev: HashMap<&AgentId, &AgentId> = HashMap::new();
        let mut seen: HashSet<&AgentId> = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);

        while let Some(cur) = queue.pop_front() {
            for next in self.neighbors(cur) {
                if !seen.insert(next) {
                    continue;
                }
                prev.insert(next, cur);
                if next == to {
                    return Some(Self::trace_back(&prev, to));
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Dijkstra over stored edge weights. Returns the path and its total weight.
    pub fn weighted_path(&self, from: &AgentId, to: &AgentId) -> Option<(Vec<AgentId>, f32)> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }

        let mut dist: HashMap<&AgentId, f32> = HashMap::from([(from, 0.0)]);
        let mut prev: HashMap<&AgentId, &AgentId> = HashMap::new();
        let mut heap = BinaryHeap::from([Frontier {
            cost: 0.0,
            node: from,
        }]);

        while let Some(Frontier { cost, node }) = heap.pop() {
            if node == to {
                return Some((Self::trace_back(&prev, to), cost));
            }
            if dist.get(node).is_some_and(|&d| cost > d) {
                continue;
            }
            for next in self.neighbors(node) {
                let Some(w) = self.edge_weight(node, next) else {
                    continue;
                };
                let candidate = cost + w;
                if dist.get(next).map_or(true, |&d| candidate < d) {
                    dist.insert(next, candidate);
                    prev.insert(next, node);
                    heap.push(Frontier {
                        cost: candidate,
                        node: next,
                    });
                }
            }
        }
        None
    }

    /// Hop distance to every node reachable within `k` hops, excluding `id`.
    pub fn within_hops(&self, id: &AgentId, k: usize) -> HashMap<AgentId, usize> {
        let mut out = HashMap::new();
        if !self.contains(id) {
            return out;
        }
        let mut seen: HashSet<&AgentId> = HashSet::from([id]);
        let mut queue = VecDeque::from([(id, 0usize)]);
        while let Some((cur, depth)) = queue.pop_front() {
            if depth == k {
                continue;
            }
            for next in self.neighbors(cur) {
                if seen.insert(next) {
                    out.insert(next.clone(), depth + 1);
                    queue.push_back((next, depth + 1));
                }
            }
        }
        out
    }

    /// Weakly connected components, each in registration order.
    pub fn connected_components(&self) -> Vec<Vec<AgentId>> {
        let mut undirected: HashMap<&AgentId, Vec<&AgentId>> = HashMap::new();
        for from in &self.nodes {
            for to in self.neighbors(from) {
                undirected.entry(from).or_default().push(to);
                undirected.entry(to).or_default().push(from);
            }
        }

        let mut component_of: HashMap<&AgentId, usize> = HashMap::new();
        let mut count = 0;
        for start in &self.nodes {
            if component_of.contains_key(start) {
                continue;
            }
            component_of.insert(start, count);
            let mut queue = VecDeque::from([start]);
            while let Some(cur) = queue.pop_front() {
                for &next in undirected.get(cur).into_iter().flatten() {
                    if !component_of.contains_key(next) {
                        component_of.insert(next, count);
                        queue.push_back(next);
                    }
                }
            }
            count += 1;
        }

        let mut components = vec![Vec::new(); count];
        for node in &self.nodes {
            components[component_of[node]].push(node.clone());
        }
        components
    }

    fn trace_back(prev: &HashMap<&AgentId, &AgentId>, to: &AgentId) -> Vec<AgentId> {
        let mut path = vec![to.clone()];
        let mut cur = to;
        while let Some(&p) = prev.get(cur) {
            path.push(p.clone());
            cur = p;
        }
        path.reverse();
        path
    }
}

/// Min-heap entry for Dijkstra.
#[derive(PartialEq)]
struct Frontier<'a> {
    cost: f32,
    node: &'a AgentId,
}

impl Eq for Frontier<'_> {}

impl Ord for Frontier<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.node.cmp(self.node))
    }
}

impl PartialOrd for Frontier<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
