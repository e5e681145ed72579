//! Connectivity of universes through replication configs.

use petgraph::graphmap::UnGraphMap;
use petgraph::visit::Bfs;
use uuid::Uuid;

use super::config::ReplicationConfig;

/// Undirected graph with one edge per replication config.
pub struct ReplicationGraph {
    graph: UnGraphMap<Uuid, ()>,
}

impl ReplicationGraph {
    /// Build the graph from every known config.
    #[must_use]
    pub fn from_configs(configs: &[ReplicationConfig]) -> Self {
        let mut graph = UnGraphMap::new();
        for config in configs {
            graph.add_edge(config.source, config.target, ());
        }
        Self { graph }
    }

    /// Universes reachable from any of `roots`, excluding the roots
    /// themselves, sorted ascending so they can be locked in order.
    #[must_use]
    pub fn connected(&self, roots: &[Uuid]) -> Vec<Uuid> {
        let mut reached = std::collections::BTreeSet::new();
        for &root in roots {
            if !self.graph.contains_node(root) {
                continue;
            }
            let mut bfs = Bfs::new(&self.graph, root);
            while let Some(node) = bfs.next(&self.graph) {
                reached.insert(node);
            }
        }
        for root in roots {
            reached.remove(root);
        }
        reached.into_iter().collect()
    }
}

/// Shorthand for [`ReplicationGraph::connected`] over a config list.
#[must_use]
pub fn connected_universes(configs: &[ReplicationConfig], roots: &[Uuid]) -> Vec<Uuid> {
    ReplicationGraph::from_configs(configs).connected(roots)
}
