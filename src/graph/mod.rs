// graph/mod.rs
// The site link graph - directed page-to-page hyperlinks, rebuilt per run

pub mod builder;
pub mod resolver;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

pub use builder::GraphBuilder;
pub use resolver::NodeResolver;

/// Directed adjacency: URL -> set of URLs it links to.
///
/// Only pages with at least one outgoing link appear as keys.
#[derive(Debug, Clone, Default)]
pub struct LinkGraph {
    adjacency: HashMap<String, HashSet<String>>,
}

/// Size of the link graph as reported in analysis results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    /// Pages with at least one outgoing link
    pub total_nodes: usize,
    /// Distinct directed links
    pub total_edges: usize,
}

impl LinkGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a directed link; duplicates collapse into the target set
    pub fn add_link(&mut self, source: &str, target: &str) {
        self.adjacency
            .entry(source.to_string())
            .or_default()
            .insert(target.to_string());
    }

    /// Outgoing links of a page, if it has any
    pub fn targets(&self, source: &str) -> Option<&HashSet<String>> {
        self.adjacency.get(source)
    }

    pub fn has_link(&self, source: &str, target: &str) -> bool {
        self.adjacency
            .get(source)
            .map_or(false, |targets| targets.contains(target))
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    /// Shortest directed hop count from `source` to `target`, bounded by `max_hops`.
    ///
    /// Returns `Some(0)` when both are the same page and `None` when no path
    /// of at most `max_hops` links exists.
    pub fn distance(&self, source: &str, target: &str, max_hops: usize) -> Option<usize> {
        if source == target {
            return Some(0);
        }

        if !self.adjacency.contains_key(source) {
            return None;
        }

        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(source);
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
        queue.push_back((source, 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_hops {
                continue;
            }

            let Some(targets) = self.adjacency.get(current) else {
                continue;
            };

            for next in targets {
                if next == target {
                    return Some(depth + 1);
                }
                if visited.insert(next.as_str()) {
                    queue.push_back((next.as_str(), depth + 1));
                }
            }
        }

        None
    }

    /// Get statistics about the graph
    pub fn stats(&self) -> GraphStats {
        GraphStats {
            total_nodes: self.adjacency.len(),
            total_edges: self.adjacency.values().map(HashSet::len).sum(),
        }
    }
}
