// graph/builder.rs
// Graph builder - constructs the link graph from edge records

use super::LinkGraph;
use crate::pipeline::ingest::EdgeRecord;
use tracing::debug;

pub struct GraphBuilder {
    graph: LinkGraph,
    // Track skipped records for the build log
    skipped: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            graph: LinkGraph::new(),
            skipped: 0,
        }
    }

    /// Add one edge record; records with a blank endpoint are skipped
    pub fn add_edge(&mut self, edge: &EdgeRecord) -> &mut Self {
        let source = edge.source_url.trim();
        let target = edge.target_url.trim();

        if source.is_empty() || target.is_empty() {
            self.skipped += 1;
            return self;
        }

        self.graph.add_link(source, target);
        self
    }

    /// Build the graph from every edge record
    pub fn build(mut self, edges: &[EdgeRecord]) -> LinkGraph {
        for edge in edges {
            self.add_edge(edge);
        }

        let stats = self.graph.stats();
        debug!(
            "Built link graph: {} linking pages, {} links ({} records skipped)",
            stats.total_nodes, stats.total_edges, self.skipped
        );

        self.graph
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a fresh link graph for one analysis run
pub fn build_graph(edges: &[EdgeRecord]) -> LinkGraph {
    GraphBuilder::new().build(edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_adjacency_from_records() {
        let edges = vec![
            EdgeRecord::new("https://x/a", "https://x/b"),
            EdgeRecord::new("https://x/a", "https://x/c"),
            EdgeRecord::new("https://x/b", "https://x/c"),
        ];

        let graph = build_graph(&edges);
        assert!(graph.has_link("https://x/a", "https://x/b"));
        assert!(graph.has_link("https://x/b", "https://x/c"));
        assert!(!graph.has_link("https://x/c", "https://x/a"));
        assert_eq!(graph.stats().total_edges, 3);
    }

    #[test]
    fn records_with_missing_endpoint_are_skipped() {
        let edges = vec![
            EdgeRecord::new("", "https://x/b"),
            EdgeRecord::new("https://x/a", "  "),
        ];
        let graph = build_graph(&edges);
        assert!(graph.is_empty());
    }
}
