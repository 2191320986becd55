//! Propagation DAG construction, topological sort, and cycle detection.
//!
//! The graph tracks which tables feed which through propagation rules. It
//! exists to make the cascade explicit and checkable: rule registration
//! rebuilds the graph and rejects any rule that would close a cycle, which
//! is what guarantees the synchronous insert cascade terminates.
//!
//! Cycle detection and ordering use Kahn's algorithm (Kahn, 1962,
//! "Topological sorting of large networks", CACM 5(11)).

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::CascadeError;

/// In-memory dependency graph of tables connected by propagation rules.
#[derive(Debug, Default)]
pub struct PropagationGraph {
    /// Forward edges: source table → downstream target tables.
    edges: HashMap<String, Vec<String>>,
    /// Reverse edges: target table → upstream source tables.
    reverse_edges: HashMap<String, Vec<String>>,
    /// All node names in the graph.
    all_nodes: HashSet<String>,
}

impl PropagationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge from `source` to `target`.
    pub fn add_edge(&mut self, source: &str, target: &str) {
        self.all_nodes.insert(source.to_string());
        self.all_nodes.insert(target.to_string());
        self.edges
            .entry(source.to_string())
            .or_default()
            .push(target.to_string());
        self.reverse_edges
            .entry(target.to_string())
            .or_default()
            .push(source.to_string());
    }

    /// Immediate downstream targets of a node.
    pub fn downstream(&self, node: &str) -> Vec<String> {
        self.edges.get(node).cloned().unwrap_or_default()
    }

    /// Immediate upstream sources of a node.
    pub fn upstream(&self, node: &str) -> Vec<String> {
        self.reverse_edges.get(node).cloned().unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.all_nodes.len()
    }

    /// Detect cycles. Returns `Err(CycleDetected)` naming the nodes stuck
    /// on a cycle.
    pub fn detect_cycles(&self) -> Result<(), CascadeError> {
        let order = self.kahn_order();
        if order.len() < self.all_nodes.len() {
            let processed: HashSet<&String> = order.iter().collect();
            let mut cycle_nodes: Vec<String> = self
                .all_nodes
                .iter()
                .filter(|n| !processed.contains(n))
                .cloned()
                .collect();
            cycle_nodes.sort();
            Err(CascadeError::CycleDetected(cycle_nodes))
        } else {
            Ok(())
        }
    }

    /// Nodes in topological order (upstream first). Deterministic: ties
    /// break alphabetically.
    pub fn topological_order(&self) -> Result<Vec<String>, CascadeError> {
        self.detect_cycles()?;
        Ok(self.kahn_order())
    }

    fn kahn_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<&String, usize> = self
            .all_nodes
            .iter()
            .map(|n| (n, self.reverse_edges.get(n).map_or(0, Vec::len)))
            .collect();

        let mut roots: Vec<&String> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        roots.sort();
        let mut queue: VecDeque<&String> = roots.into_iter().collect();

        let mut order = Vec::with_capacity(self.all_nodes.len());
        while let Some(node) = queue.pop_front() {
            order.push(node.clone());
            if let Some(targets) = self.edges.get(node) {
                let mut unblocked = Vec::new();
                for t in targets {
                    if let Some(d) = in_degree.get_mut(t) {
                        *d -= 1;
                        if *d == 0 {
                            unblocked.push(t);
                        }
                    }
                }
                unblocked.sort();
                queue.extend(unblocked);
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_graph() {
        let g = PropagationGraph::new();
        assert_eq!(g.node_count(), 0);
        assert!(g.detect_cycles().is_ok());
        assert!(g.topological_order().unwrap().is_empty());
    }

    #[test]
    fn test_linear_chain_order() {
        let mut g = PropagationGraph::new();
        g.add_edge("ingest", "facts");
        g.add_edge("facts", "daily");
        g.add_edge("daily", "monthly");

        let order = g.topological_order().unwrap();
        assert_eq!(order, vec!["ingest", "facts", "daily", "monthly"]);
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let mut g = PropagationGraph::new();
        g.add_edge("a", "b");
        g.add_edge("a", "c");
        g.add_edge("b", "d");
        g.add_edge("c", "d");
        assert!(g.detect_cycles().is_ok());

        let order = g.topological_order().unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn test_cycle_detected() {
        let mut g = PropagationGraph::new();
        g.add_edge("a", "b");
        g.add_edge("b", "c");
        g.add_edge("c", "a");

        let err = g.detect_cycles().unwrap_err();
        match err {
            CascadeError::CycleDetected(nodes) => {
                assert_eq!(nodes, vec!["a", "b", "c"]);
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop_detected() {
        let mut g = PropagationGraph::new();
        g.add_edge("a", "a");
        assert!(g.detect_cycles().is_err());
    }

    #[test]
    fn test_upstream_downstream() {
        let mut g = PropagationGraph::new();
        g.add_edge("a", "b");
        g.add_edge("c", "b");
        assert_eq!(g.downstream("a"), vec!["b"]);
        let mut up = g.upstream("b");
        up.sort();
        assert_eq!(up, vec!["a", "c"]);
        assert!(g.upstream("a").is_empty());
    }

    #[test]
    fn test_order_is_deterministic() {
        let mut g = PropagationGraph::new();
        g.add_edge("z", "m");
        g.add_edge("a", "m");
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec!["a", "z", "m"]);
    }
}
