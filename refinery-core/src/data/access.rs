//! Dataset Access: the narrow interface the engines use to read dataset
//! versions and commit new ones.

use crate::data::batch::DataBatch;
use crate::data::schema::SchemaDefinition;
use crate::data::stats::DatasetStats;
use crate::error::{RefineryError, Result};
use crate::lineage::{self, LineageEdge};
use crate::pipeline::PipelineSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// A finite stream of row chunks in storage order.
pub type ChunkStream<'a> = BoxStream<'a, Result<DataBatch>>;

/// An immutable, committed dataset version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetVersion {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub schema: SchemaDefinition,
    pub row_count: usize,
    pub stats: DatasetStats,
    /// Id of the pipeline that produced this version; `None` for roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produced_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_id: Option<String>,
    /// Hash chained from the parent's hash and the producing pipeline.
    pub lineage_hash: String,
    pub created_at: DateTime<Utc>,
}

impl DatasetVersion {
    /// A root version, as created by an import.
    pub fn root(
        id: String,
        name: &str,
        schema: SchemaDefinition,
        row_count: usize,
        stats: DatasetStats,
    ) -> Self {
        Self {
            lineage_hash: lineage::root_hash(&id, name),
            id,
            name: name.to_string(),
            parent_id: None,
            schema,
            row_count,
            stats,
            produced_by: None,
            recipe_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Everything needed to commit a derived version except its rows.
#[derive(Debug, Clone)]
pub struct VersionDraft {
    pub name: String,
    pub parent_id: String,
    pub schema: SchemaDefinition,
    pub pipeline: PipelineSnapshot,
    pub requested_by: String,
}

impl VersionDraft {
    /// Seal the draft into the version and edge committed together.
    pub fn seal(
        self,
        id: String,
        parent: &DatasetVersion,
        row_count: usize,
        stats: DatasetStats,
    ) -> (DatasetVersion, LineageEdge) {
        let created_at = Utc::now();
        let version = DatasetVersion {
            id: id.clone(),
            name: self.name,
            parent_id: Some(parent.id.clone()),
            schema: self.schema,
            row_count,
            stats,
            produced_by: Some(self.pipeline.pipeline_id.clone()),
            recipe_id: self.pipeline.recipe_id.clone(),
            lineage_hash: lineage::chain_hash(&parent.lineage_hash, &self.pipeline.content_hash),
            created_at,
        };
        let edge = LineageEdge {
            from_version: parent.id.clone(),
            to_version: id,
            pipeline: self.pipeline,
            requested_by: self.requested_by,
            created_at,
        };
        (version, edge)
    }
}

/// Fail unless `batch` is laid out exactly as `schema`.
pub fn check_layout(schema: &SchemaDefinition, batch: &DataBatch) -> Result<()> {
    let expected = schema.names();
    if batch.columns != expected {
        return Err(RefineryError::execution(format!(
            "chunk columns {:?} do not match version schema {:?}",
            batch.columns, expected
        )));
    }
    Ok(())
}

/// Read and commit access to dataset versions.
#[async_trait]
pub trait DatasetAccess: Send + Sync {
    async fn get_version(&self, version_id: &str) -> Result<DatasetVersion>;

    /// The first `limit` rows in storage order, with the version's schema.
    async fn get_sample(
        &self,
        version_id: &str,
        limit: usize,
    ) -> Result<(DataBatch, SchemaDefinition)>;

    /// All rows as a stream of chunks of at most `chunk_size` rows. Every
    /// call starts a fresh pass over the data.
    async fn get_rows_streaming(
        &self,
        version_id: &str,
        chunk_size: usize,
    ) -> Result<ChunkStream<'static>>;

    /// Commit a new version from `chunks`. The version and its lineage edge
    /// become visible together, and only if every chunk arrives intact.
    async fn create_version(&self, draft: VersionDraft, chunks: ChunkStream<'_>)
    -> Result<String>;

    /// The edge that produced `version_id`; `None` for roots.
    async fn lineage_edge(&self, version_id: &str) -> Result<Option<LineageEdge>>;

    /// Ids of versions derived directly from `version_id`.
    async fn children(&self, version_id: &str) -> Result<Vec<String>>;

    /// Every committed version, oldest first.
    async fn list_versions(&self) -> Result<Vec<DatasetVersion>>;
}
