//! Lineage: the edges linking dataset versions and the read-side tracker
//! that walks and verifies the version tree.

use crate::data::access::{DatasetAccess, DatasetVersion};
use crate::error::{RefineryError, Result};
use crate::pipeline::PipelineSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Links a child version to its parent and records how it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEdge {
    pub from_version: String,
    pub to_version: String,
    pub pipeline: PipelineSnapshot,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
}

/// Hash anchoring a root version.
pub fn root_hash(version_id: &str, name: &str) -> String {
    compute_hash(&format!("{version_id}:{name}"))
}

/// Hash of a derived version: its parent's hash extended by the pipeline.
pub fn chain_hash(parent_hash: &str, pipeline_hash: &str) -> String {
    compute_hash(&format!("{parent_hash}:{pipeline_hash}"))
}

fn compute_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One version on an ancestry path with the edge that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct AncestryEntry {
    pub version: DatasetVersion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge: Option<LineageEdge>,
}

/// Outcome of [`LineageTracker::verify_tree`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct LineageReport {
    pub versions: usize,
    pub roots: Vec<String>,
    pub problems: Vec<String>,
}

impl LineageReport {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Read-side view over versions and edges.
#[derive(Clone)]
pub struct LineageTracker {
    access: Arc<dyn DatasetAccess>,
}

impl LineageTracker {
    pub fn new(access: Arc<dyn DatasetAccess>) -> Self {
        Self { access }
    }

    pub async fn parent(&self, version_id: &str) -> Result<Option<DatasetVersion>> {
        let version = self.access.get_version(version_id).await?;
        match version.parent_id {
            Some(parent) => Ok(Some(self.access.get_version(&parent).await?)),
            None => Ok(None),
        }
    }

    pub async fn children(&self, version_id: &str) -> Result<Vec<DatasetVersion>> {
        let mut children = Vec::new();
        for id in self.access.children(version_id).await? {
            children.push(self.access.get_version(&id).await?);
        }
        Ok(children)
    }

    /// The path from the root down to `version_id`, inclusive.
    pub async fn ancestry(&self, version_id: &str) -> Result<Vec<AncestryEntry>> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(version_id.to_string());
        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                return Err(RefineryError::execution(format!(
                    "lineage cycle detected at version {id}"
                )));
            }
            let version = self.access.get_version(&id).await?;
            let edge = self.access.lineage_edge(&id).await?;
            current = version.parent_id.clone();
            path.push(AncestryEntry { version, edge });
        }
        path.reverse();
        Ok(path)
    }

    /// Check that versions form a tree with intact hash chains: every
    /// non-root has exactly one edge from an existing parent, no version is
    /// its own ancestor, and every lineage hash recomputes.
    pub async fn verify_tree(&self) -> Result<LineageReport> {
        let versions = self.access.list_versions().await?;
        let by_id: HashMap<&str, &DatasetVersion> =
            versions.iter().map(|v| (v.id.as_str(), v)).collect();
        let mut report = LineageReport {
            versions: versions.len(),
            ..LineageReport::default()
        };

        for version in &versions {
            let edge = self.access.lineage_edge(&version.id).await?;
            match (&version.parent_id, edge) {
                (None, None) => {
                    report.roots.push(version.id.clone());
                    if version.lineage_hash != root_hash(&version.id, &version.name) {
                        report
                            .problems
                            .push(format!("{}: root hash does not verify", version.id));
                    }
                }
                (None, Some(_)) => report
                    .problems
                    .push(format!("{}: root version has an incoming edge", version.id)),
                (Some(_), None) => report
                    .problems
                    .push(format!("{}: derived version has no edge", version.id)),
                (Some(parent_id), Some(edge)) => {
                    if edge.from_version != *parent_id || edge.to_version != version.id {
                        report
                            .problems
                            .push(format!("{}: edge does not match parent", version.id));
                    }
                    match by_id.get(parent_id.as_str()) {
                        None => report
                            .problems
                            .push(format!("{}: parent {parent_id} is missing", version.id)),
                        Some(parent) => {
                            let expected =
                                chain_hash(&parent.lineage_hash, &edge.pipeline.content_hash);
                            if version.lineage_hash != expected {
                                report
                                    .problems
                                    .push(format!("{}: lineage hash does not verify", version.id));
                            }
                        }
                    }
                }
            }

            let mut seen = HashSet::new();
            let mut cursor = Some(version);
            while let Some(v) = cursor {
                if !seen.insert(v.id.as_str()) {
                    report
                        .problems
                        .push(format!("{}: lineage cycle", version.id));
                    break;
                }
                cursor = v
                    .parent_id
                    .as_deref()
                    .and_then(|p| by_id.get(p).copied());
            }
        }
        Ok(report)
    }
}
