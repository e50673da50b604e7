// ingest.rs
// Phase 0: Page and edge records handed over by the crawl importer

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique, stable identifier of a page
pub type NodeId = String;

/// A crawled page as delivered by the importer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub node_id: NodeId,
    pub url: String,
    #[serde(default)]
    pub content: String,
}

/// A directed hyperlink between two pages of the same project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    #[serde(alias = "source")]
    pub source_url: String,
    #[serde(alias = "target", alias = "destination")]
    pub target_url: String,
}

/// Page record as it may appear on disk, with the id still optional
#[derive(Debug, Deserialize)]
struct RawPage {
    #[serde(default)]
    node_id: Option<String>,
    url: String,
    #[serde(default, alias = "contenu")]
    content: Option<String>,
}

/// Derive the stable node id of a URL.
///
/// UUIDv5 in the URL namespace over the trimmed URL, so re-importing the
/// same URL set always yields the same ids.
pub fn node_id_for(url: &str) -> NodeId {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, url.trim().as_bytes()).to_string()
}

impl Page {
    /// Build a page, deriving its node id from the URL
    pub fn new(url: impl Into<String>, content: impl Into<String>) -> Self {
        let url = url.into().trim().to_string();
        Self {
            node_id: node_id_for(&url),
            url,
            content: content.into(),
        }
    }

    /// Text submitted for vectorization; blank content falls back to the URL
    pub fn embedding_text(&self) -> Option<&str> {
        let trimmed = self.content.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

impl EdgeRecord {
    pub fn new(source_url: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            target_url: target_url.into(),
        }
    }
}

/// Validated input of one analysis: ordered pages plus in-project edges
#[derive(Debug, Clone, Default)]
pub struct PageSet {
    pub pages: Vec<Page>,
    pub edges: Vec<EdgeRecord>,
}

impl PageSet {
    /// Validate pages and filter edges down to links between known pages.
    ///
    /// Fails with an input error on an empty page set, a blank URL or a
    /// duplicate node id. Edges with a blank or unknown endpoint and
    /// self-links are dropped.
    pub fn new(pages: Vec<Page>, edges: Vec<EdgeRecord>) -> Result<Self> {
        if pages.is_empty() {
            return Err(PipelineError::Input("no pages to analyze".to_string()));
        }

        let mut seen_ids = HashSet::new();
        for (row, page) in pages.iter().enumerate() {
            if page.url.trim().is_empty() {
                return Err(PipelineError::Input(format!("page {} has an empty URL", row)));
            }
            if page.node_id.trim().is_empty() {
                return Err(PipelineError::Input(format!(
                    "page {} ({}) has an empty node id",
                    row, page.url
                )));
            }
            if !seen_ids.insert(page.node_id.as_str()) {
                return Err(PipelineError::Input(format!(
                    "duplicate node id {} ({})",
                    page.node_id, page.url
                )));
            }
        }

        let known: HashSet<&str> = pages.iter().map(|p| p.url.as_str()).collect();
        let total_edges = edges.len();
        let edges: Vec<EdgeRecord> = edges
            .into_iter()
            .map(|e| EdgeRecord::new(e.source_url.trim(), e.target_url.trim()))
            .filter(|e| {
                !e.source_url.is_empty()
                    && !e.target_url.is_empty()
                    && e.source_url != e.target_url
                    && known.contains(e.source_url.as_str())
                    && known.contains(e.target_url.as_str())
            })
            .collect();

        if edges.len() < total_edges {
            debug!(
                "Dropped {} edges outside the page set",
                total_edges - edges.len()
            );
        }

        Ok(Self { pages, edges })
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Load page records from a JSON array file
pub fn load_pages(path: impl AsRef<Path>) -> Result<Vec<Page>> {
    let path = path.as_ref();
    let json = fs::read_to_string(path)?;
    let raw: Vec<RawPage> = serde_json::from_str(&json)?;

    let pages: Vec<Page> = raw
        .into_iter()
        .map(|r| {
            let url = r.url.trim().to_string();
            Page {
                node_id: r.node_id.unwrap_or_else(|| node_id_for(&url)),
                url,
                content: r.content.unwrap_or_default(),
            }
        })
        .collect();

    info!("Loaded {} pages from {}", pages.len(), path.display());
    Ok(pages)
}

/// Load edge records from a JSON array file
pub fn load_edges(path: impl AsRef<Path>) -> Result<Vec<EdgeRecord>> {
    let path = path.as_ref();
    let json = fs::read_to_string(path)?;
    let edges: Vec<EdgeRecord> = serde_json::from_str(&json)?;
    info!("Loaded {} edges from {}", edges.len(), path.display());
    Ok(edges)
}
