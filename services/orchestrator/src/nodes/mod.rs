//! Node directory: the read-only view of compute nodes the scheduler places
//! work on.
//!
//! The directory is assembled from tagged sources merged by node identity.
//! The first source that reports a node wins.

mod registry;

pub use registry::NodeRegistry;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use convoy_id::NodeId;
use thiserror::Error;
use tracing::warn;

use crate::models::NodeInfo;

/// Node directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to read node file {path}: {message}")]
    File { path: String, message: String },

    #[error("invalid node file {path}: {message}")]
    Parse { path: String, message: String },

    /// One or more sources failed while building a merged view.
    #[error("{} node source(s) failed: {}", .0.len(), join_errors(.0))]
    Sources(Vec<DirectoryError>),
}

fn join_errors(errors: &[DirectoryError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Read contract used by the scheduler.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn list_nodes(&self) -> DirectoryResult<Vec<NodeInfo>>;
}

/// One origin of node information.
#[derive(Clone)]
pub enum NodeSource {
    /// Fixed list, mostly for tests and single-host setups.
    Static(Vec<NodeInfo>),
    /// JSON array of nodes, re-read on every listing.
    File(PathBuf),
    /// Nodes that registered through the API.
    Registry(Arc<NodeRegistry>),
}

impl NodeSource {
    pub fn name(&self) -> &'static str {
        match self {
            NodeSource::Static(_) => "static",
            NodeSource::File(_) => "file",
            NodeSource::Registry(_) => "registry",
        }
    }

    async fn list(&self) -> DirectoryResult<Vec<NodeInfo>> {
        match self {
            NodeSource::Static(nodes) => Ok(nodes.clone()),
            NodeSource::Registry(registry) => Ok(registry.snapshot().await),
            NodeSource::File(path) => {
                let raw = tokio::fs::read(path)
                    .await
                    .map_err(|e| DirectoryError::File {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    })?;
                serde_json::from_slice(&raw).map_err(|e| DirectoryError::Parse {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
}

/// Union of several sources.
pub struct MergedDirectory {
    sources: Vec<NodeSource>,
    ignore_errors: bool,
}

impl MergedDirectory {
    pub fn new(sources: Vec<NodeSource>) -> Self {
        Self {
            sources,
            ignore_errors: false,
        }
    }

    /// When set, failing sources are logged and skipped.
    pub fn ignore_errors(mut self, ignore: bool) -> Self {
        self.ignore_errors = ignore;
        self
    }
}

#[async_trait]
impl NodeDirectory for MergedDirectory {
    async fn list_nodes(&self) -> DirectoryResult<Vec<NodeInfo>> {
        let mut seen: BTreeSet<NodeId> = BTreeSet::new();
        let mut merged = Vec::new();
        let mut errors = Vec::new();

        for source in &self.sources {
            match source.list().await {
                Ok(nodes) => {
                    for node in nodes {
                        if seen.insert(node.id.clone()) {
                            merged.push(node);
                        }
                    }
                }
                Err(e) if self.ignore_errors => {
                    warn!(source = source.name(), error = %e, "Ignoring node source failure");
                }
                Err(e) => errors.push(e),
            }
        }

        if !errors.is_empty() {
            return Err(DirectoryError::Sources(errors));
        }
        Ok(merged)
    }
}

#[async_trait]
impl NodeDirectory for NodeRegistry {
    async fn list_nodes(&self) -> DirectoryResult<Vec<NodeInfo>> {
        Ok(self.snapshot().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Resources;
    use chrono::Utc;

    fn node(name: &str, cpu: f64) -> NodeInfo {
        NodeInfo::new(
            NodeId::new(name).unwrap(),
            &["docker"],
            Resources {
                cpu,
                memory: 1 << 30,
                disk: 0,
                gpu: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_first_source_wins() {
        let registry = Arc::new(NodeRegistry::new());
        registry.upsert(node("a", 8.0), Utc::now()).await;
        registry.upsert(node("b", 8.0), Utc::now()).await;

        let directory = MergedDirectory::new(vec![
            NodeSource::Static(vec![node("a", 1.0)]),
            NodeSource::Registry(registry),
        ]);
        let nodes = directory.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id.as_str(), "a");
        assert_eq!(nodes[0].total_capacity.cpu, 1.0);
    }

    #[tokio::test]
    async fn test_source_errors_aggregate_or_are_ignored() {
        let missing = NodeSource::File(PathBuf::from("/nonexistent/convoy-nodes.json"));
        let directory = MergedDirectory::new(vec![
            NodeSource::Static(vec![node("a", 1.0)]),
            missing.clone(),
            missing.clone(),
        ]);
        match directory.list_nodes().await {
            Err(DirectoryError::Sources(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregated error, got {other:?}"),
        }

        let lenient = MergedDirectory::new(vec![NodeSource::Static(vec![node("a", 1.0)]), missing])
            .ignore_errors(true);
        assert_eq!(lenient.list_nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_source() {
        let path = std::env::temp_dir().join(format!("convoy-nodes-{}.json", convoy_id::Ulid::new()));
        let nodes = vec![node("file-a", 2.0)];
        tokio::fs::write(&path, serde_json::to_vec(&nodes).unwrap())
            .await
            .unwrap();

        let listed = MergedDirectory::new(vec![NodeSource::File(path.clone())])
            .list_nodes()
            .await
            .unwrap();
        assert_eq!(listed, nodes);
        tokio::fs::remove_file(path).await.unwrap();
    }
}
