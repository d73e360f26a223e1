//! In-memory Dataset Access, used by tests and embedded callers.

use crate::data::access::{
    check_layout, ChunkStream, DatasetAccess, DatasetVersion, VersionDraft,
};
use crate::data::batch::DataBatch;
use crate::data::schema::{infer_schema, SchemaDefinition};
use crate::data::stats::{BasicStats, StatsProvider};
use crate::error::{RefineryError, Result};
use crate::lineage::LineageEdge;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct State {
    versions: HashMap<String, DatasetVersion>,
    rows: HashMap<String, Arc<DataBatch>>,
    edges: HashMap<String, LineageEdge>,
    order: Vec<String>,
}

/// Dataset Access holding every version in memory.
pub struct InMemoryDatasetAccess {
    state: RwLock<State>,
    stats: Arc<dyn StatsProvider>,
}

impl InMemoryDatasetAccess {
    pub fn new() -> Self {
        Self::with_stats(Arc::new(BasicStats))
    }

    pub fn with_stats(stats: Arc<dyn StatsProvider>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            stats,
        }
    }

    /// Register `batch` as a new root version with an inferred schema.
    pub async fn import(&self, name: &str, batch: DataBatch) -> Result<String> {
        let schema = infer_schema(&batch.columns, &batch.rows);
        self.import_with_schema(name, batch, schema).await
    }

    pub async fn import_with_schema(
        &self,
        name: &str,
        batch: DataBatch,
        schema: SchemaDefinition,
    ) -> Result<String> {
        check_layout(&schema, &batch)?;
        let id = uuid::Uuid::new_v4().to_string();
        let stats = self.stats.compute_stats(&batch, &schema);
        let version = DatasetVersion::root(id.clone(), name, schema, batch.row_count(), stats);
        let mut state = self.state.write().await;
        state.rows.insert(id.clone(), Arc::new(batch));
        state.versions.insert(id.clone(), version);
        state.order.push(id.clone());
        debug!(version = %id, name, "Imported root version");
        Ok(id)
    }

    async fn rows(&self, version_id: &str) -> Result<(Arc<DataBatch>, DatasetVersion)> {
        let state = self.state.read().await;
        let version = state
            .versions
            .get(version_id)
            .cloned()
            .ok_or_else(|| RefineryError::not_found(format!("dataset version {version_id}")))?;
        let rows = state
            .rows
            .get(version_id)
            .cloned()
            .ok_or_else(|| RefineryError::not_found(format!("rows of version {version_id}")))?;
        Ok((rows, version))
    }
}

impl Default for InMemoryDatasetAccess {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatasetAccess for InMemoryDatasetAccess {
    async fn get_version(&self, version_id: &str) -> Result<DatasetVersion> {
        self.state
            .read()
            .await
            .versions
            .get(version_id)
            .cloned()
            .ok_or_else(|| RefineryError::not_found(format!("dataset version {version_id}")))
    }

    async fn get_sample(
        &self,
        version_id: &str,
        limit: usize,
    ) -> Result<(DataBatch, SchemaDefinition)> {
        let (rows, version) = self.rows(version_id).await?;
        let take = limit.min(rows.row_count());
        let sample = DataBatch::new(rows.columns.clone(), rows.rows[..take].to_vec());
        Ok((sample, version.schema))
    }

    async fn get_rows_streaming(
        &self,
        version_id: &str,
        chunk_size: usize,
    ) -> Result<ChunkStream<'static>> {
        let (rows, _) = self.rows(version_id).await?;
        let size = chunk_size.max(1);
        let total = rows.row_count();
        let starts: Vec<usize> = (0..total).step_by(size).collect();
        Ok(stream::iter(starts)
            .map(move |start| {
                let end = (start + size).min(total);
                Ok(DataBatch::new(
                    rows.columns.clone(),
                    rows.rows[start..end].to_vec(),
                ))
            })
            .boxed())
    }

    async fn create_version(
        &self,
        draft: VersionDraft,
        mut chunks: ChunkStream<'_>,
    ) -> Result<String> {
        let parent = self.get_version(&draft.parent_id).await?;
        let mut accumulator = self.stats.accumulator(&draft.schema);
        let mut data = DataBatch::empty(draft.schema.names());
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            check_layout(&draft.schema, &chunk)?;
            accumulator.observe(&chunk);
            data.rows.extend(chunk.rows);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (version, edge) = draft.seal(id.clone(), &parent, data.row_count(), accumulator.finish());
        let mut state = self.state.write().await;
        state.rows.insert(id.clone(), Arc::new(data));
        state.versions.insert(id.clone(), version);
        state.edges.insert(id.clone(), edge);
        state.order.push(id.clone());
        debug!(version = %id, parent = %parent.id, "Committed version");
        Ok(id)
    }

    async fn lineage_edge(&self, version_id: &str) -> Result<Option<LineageEdge>> {
        let state = self.state.read().await;
        if !state.versions.contains_key(version_id) {
            return Err(RefineryError::not_found(format!("dataset version {version_id}")));
        }
        Ok(state.edges.get(version_id).cloned())
    }

    async fn children(&self, version_id: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .filter(|id| {
                state
                    .versions
                    .get(id.as_str())
                    .and_then(|v| v.parent_id.as_deref())
                    == Some(version_id)
            })
            .cloned()
            .collect())
    }

    async fn list_versions(&self) -> Result<Vec<DatasetVersion>> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.versions.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use futures::TryStreamExt;
    use serde_json::json;

    fn people() -> DataBatch {
        DataBatch::from_records(
            json!([
                {"name": "Ann", "age": 31},
                {"name": "Bo", "age": null},
                {"name": "Cy", "age": 40}
            ])
            .as_array()
            .unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_import_and_stream_in_chunks() {
        let access = InMemoryDatasetAccess::new();
        let id = access.import("people", people()).await.unwrap();
        let version = access.get_version(&id).await.unwrap();
        assert_eq!(version.row_count, 3);
        assert!(version.is_root());

        let chunks: Vec<DataBatch> = access
            .get_rows_streaming(&id, 2)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].row_count(), 1);

        let (sample, schema) = access.get_sample(&id, 2).await.unwrap();
        assert_eq!(sample.row_count(), 2);
        assert_eq!(schema.names(), vec!["name", "age"]);
    }

    #[tokio::test]
    async fn test_create_version_rejects_mismatched_chunks() {
        let access = InMemoryDatasetAccess::new();
        let root = access.import("people", people()).await.unwrap();
        let parent = access.get_version(&root).await.unwrap();
        let draft = VersionDraft {
            name: "people-clean".into(),
            parent_id: root.clone(),
            schema: parent.schema.clone(),
            pipeline: Pipeline::new(&root).snapshot(None),
            requested_by: "ann".into(),
        };
        let bad = DataBatch::new(vec!["other".into()], vec![vec![json!(1)]]);
        let result = access
            .create_version(draft, stream::iter(vec![Ok(bad)]).boxed())
            .await;
        assert!(result.is_err());
        assert_eq!(access.list_versions().await.unwrap().len(), 1);
        assert!(access.children(&root).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_version_is_not_found() {
        let access = InMemoryDatasetAccess::new();
        let err = access.get_version("nope").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
