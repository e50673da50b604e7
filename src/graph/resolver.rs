// graph/resolver.rs
// Node resolution - maps embedding node ids back to page URLs

use crate::pipeline::ingest::NodeId;
use std::collections::HashMap;

/// Lookup table from node ids to URLs
#[derive(Debug, Clone, Default)]
pub struct NodeResolver {
    url_by_id: HashMap<NodeId, String>,
}

impl NodeResolver {
    /// Build the table from parallel id and URL columns
    pub fn new(node_ids: &[NodeId], urls: &[String]) -> Self {
        Self {
            url_by_id: node_ids.iter().cloned().zip(urls.iter().cloned()).collect(),
        }
    }

    /// URL of a node, `None` on a lookup miss
    pub fn url(&self, node_id: &str) -> Option<&str> {
        self.url_by_id
            .get(node_id)
            .map(String::as_str)
            .filter(|url| !url.is_empty())
    }

    pub fn len(&self) -> usize {
        self.url_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.url_by_id.is_empty()
    }
}
