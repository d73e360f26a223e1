//! File-backed Dataset Access.
//!
//! Layout under the store root:
//!
//! ```text
//! versions/{id}/manifest.json   DatasetVersion
//! versions/{id}/rows.jsonl      one JSON array per row, in column order
//! versions/{id}/edge.json       LineageEdge (derived versions only)
//! staging/{id}/                 versions being written
//! ```
//!
//! A version is written completely under `staging/` and then renamed into
//! `versions/`, so a failed write never leaves a visible version or edge.

use crate::data::access::{
    check_layout, ChunkStream, DatasetAccess, DatasetVersion, VersionDraft,
};
use crate::data::batch::DataBatch;
use crate::data::schema::{infer_schema, SchemaDefinition};
use crate::data::stats::{BasicStats, StatsAccumulator, StatsProvider};
use crate::error::{RefineryError, Result};
use crate::lineage::LineageEdge;
use crate::persistence;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

const MANIFEST: &str = "manifest.json";
const ROWS: &str = "rows.jsonl";
const EDGE: &str = "edge.json";

/// Dataset Access over a directory of JSONL files.
pub struct FsDatasetAccess {
    root: PathBuf,
    stats: Arc<dyn StatsProvider>,
}

impl FsDatasetAccess {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_stats(root, Arc::new(BasicStats))
    }

    pub fn with_stats(root: impl Into<PathBuf>, stats: Arc<dyn StatsProvider>) -> Self {
        Self {
            root: root.into(),
            stats,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_dir(&self, id: &str) -> PathBuf {
        self.root.join("versions").join(id)
    }

    fn staging_dir(&self, id: &str) -> PathBuf {
        self.root.join("staging").join(id)
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
        let staging = self.staging_dir(&id);
        let result: Result<()> = async {
            tokio::fs::create_dir_all(&staging).await?;
            let mut writer = RowWriter::create(&staging.join(ROWS)).await?;
            writer.write_batch(&batch).await?;
            writer.finish().await?;
            persistence::atomic_write_json(&staging.join(MANIFEST), &version).await?;
            self.publish(&id).await
        }
        .await;
        if let Err(e) = result {
            self.discard(&id).await;
            return Err(e);
        }
        debug!(version = %id, name, rows = version.row_count, "Imported root version");
        Ok(id)
    }

    async fn publish(&self, id: &str) -> Result<()> {
        let target = self.version_dir(id);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(self.staging_dir(id), target).await?;
        Ok(())
    }

    async fn discard(&self, id: &str) {
        if let Err(e) = persistence::remove_dir_if_exists(&self.staging_dir(id)).await {
            warn!(version = %id, error = %e, "Failed to remove staged version");
        }
    }

    async fn write_rows(
        &self,
        staging: &Path,
        schema: &SchemaDefinition,
        chunks: &mut ChunkStream<'_>,
        accumulator: &mut Box<dyn StatsAccumulator>,
    ) -> Result<usize> {
        tokio::fs::create_dir_all(staging).await?;
        let mut writer = RowWriter::create(&staging.join(ROWS)).await?;
        let mut rows = 0;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            check_layout(schema, &chunk)?;
            accumulator.observe(&chunk);
            rows += chunk.row_count();
            writer.write_batch(&chunk).await?;
        }
        writer.finish().await?;
        Ok(rows)
    }
}

struct RowWriter {
    inner: BufWriter<tokio::fs::File>,
}

impl RowWriter {
    async fn create(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Self {
            inner: BufWriter::new(file),
        })
    }

    async fn write_batch(&mut self, batch: &DataBatch) -> Result<()> {
        for row in &batch.rows {
            let mut line = serde_json::to_vec(row)?;
            line.push(b'\n');
            self.inner.write_all(&line).await?;
        }
        Ok(())
    }

    async fn finish(mut self) -> Result<()> {
        self.inner.flush().await?;
        self.inner.get_ref().sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl DatasetAccess for FsDatasetAccess {
    async fn get_version(&self, version_id: &str) -> Result<DatasetVersion> {
        persistence::load_json(&self.version_dir(version_id).join(MANIFEST))
            .await?
            .ok_or_else(|| RefineryError::not_found(format!("dataset version {version_id}")))
    }

    async fn get_sample(
        &self,
        version_id: &str,
        limit: usize,
    ) -> Result<(DataBatch, SchemaDefinition)> {
        let version = self.get_version(version_id).await?;
        if limit == 0 {
            return Ok((DataBatch::empty(version.schema.names()), version.schema));
        }
        let mut chunks = self.get_rows_streaming(version_id, limit).await?;
        let sample = match chunks.next().await {
            Some(chunk) => chunk?,
            None => DataBatch::empty(version.schema.names()),
        };
        Ok((sample, version.schema))
    }

    async fn get_rows_streaming(
        &self,
        version_id: &str,
        chunk_size: usize,
    ) -> Result<ChunkStream<'static>> {
        let version = self.get_version(version_id).await?;
        let file = tokio::fs::File::open(self.version_dir(version_id).join(ROWS)).await?;
        let columns = version.schema.names();
        let lines = LinesStream::new(BufReader::new(file).lines());
        Ok(lines
            .map(|line| -> Result<Vec<Value>> {
                let line = line?;
                Ok(serde_json::from_str(&line)?)
            })
            .chunks(chunk_size.max(1))
            .map(move |rows| {
                let rows = rows.into_iter().collect::<Result<Vec<_>>>()?;
                Ok(DataBatch::new(columns.clone(), rows))
            })
            .boxed())
    }

    async fn create_version(
        &self,
        draft: VersionDraft,
        mut chunks: ChunkStream<'_>,
    ) -> Result<String> {
        let parent = self.get_version(&draft.parent_id).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let staging = self.staging_dir(&id);
        let mut accumulator = self.stats.accumulator(&draft.schema);

        let written = self
            .write_rows(&staging, &draft.schema, &mut chunks, &mut accumulator)
            .await;
        let rows = match written {
            Ok(rows) => rows,
            Err(e) => {
                self.discard(&id).await;
                return Err(e);
            }
        };

        let (version, edge) = draft.seal(id.clone(), &parent, rows, accumulator.finish());
        let result: Result<()> = async {
            persistence::atomic_write_json(&staging.join(EDGE), &edge).await?;
            persistence::atomic_write_json(&staging.join(MANIFEST), &version).await?;
            self.publish(&id).await
        }
        .await;
        if let Err(e) = result {
            self.discard(&id).await;
            return Err(e);
        }
        debug!(version = %id, parent = %parent.id, rows, "Committed version");
        Ok(id)
    }

    async fn lineage_edge(&self, version_id: &str) -> Result<Option<LineageEdge>> {
        let dir = self.version_dir(version_id);
        if tokio::fs::metadata(&dir).await.is_err() {
            return Err(RefineryError::not_found(format!("dataset version {version_id}")));
        }
        persistence::load_json(&dir.join(EDGE)).await
    }

    async fn children(&self, version_id: &str) -> Result<Vec<String>> {
        Ok(self
            .list_versions()
            .await?
            .into_iter()
            .filter(|v| v.parent_id.as_deref() == Some(version_id))
            .map(|v| v.id)
            .collect())
    }

    async fn list_versions(&self) -> Result<Vec<DatasetVersion>> {
        let dir = self.root.join("versions");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        let mut versions = Vec::with_capacity(ids.len());
        for id in ids {
            versions.push(self.get_version(&id).await?);
        }
        versions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use futures::{stream, TryStreamExt};
    use serde_json::json;
    use tempfile::TempDir;

    fn people() -> DataBatch {
        DataBatch::from_records(
            json!([
                {"name": "Ann", "city": "Oslo"},
                {"name": "Bo", "city": null},
                {"name": "Cy", "city": "Rome"}
            ])
            .as_array()
            .unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_import_roundtrip() {
        let dir = TempDir::new().unwrap();
        let access = FsDatasetAccess::new(dir.path());
        let id = access.import("people", people()).await.unwrap();

        let version = access.get_version(&id).await.unwrap();
        assert_eq!(version.row_count, 3);
        let rows: Vec<DataBatch> = access
            .get_rows_streaming(&id, 2)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].rows[0], vec![json!("Ann"), json!("Oslo")]);
        assert!(!dir.path().join("staging").join(&id).exists());
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let access = FsDatasetAccess::new(dir.path());
        let root = access.import("people", people()).await.unwrap();
        let parent = access.get_version(&root).await.unwrap();
        let draft = VersionDraft {
            name: "people-v2".into(),
            parent_id: root.clone(),
            schema: parent.schema.clone(),
            pipeline: Pipeline::new(&root).snapshot(None),
            requested_by: "ann".into(),
        };
        let chunks = stream::iter(vec![
            Ok(people()),
            Err(RefineryError::execution("disk went away")),
        ])
        .boxed();
        assert!(access.create_version(draft, chunks).await.is_err());
        assert_eq!(access.list_versions().await.unwrap().len(), 1);
        let staging = dir.path().join("staging");
        let leftover = std::fs::read_dir(&staging)
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn test_derived_version_has_edge() {
        let dir = TempDir::new().unwrap();
        let access = FsDatasetAccess::new(dir.path());
        let root = access.import("people", people()).await.unwrap();
        let parent = access.get_version(&root).await.unwrap();
        let pipeline = Pipeline::new(&root);
        let draft = VersionDraft {
            name: "people-v2".into(),
            parent_id: root.clone(),
            schema: parent.schema.clone(),
            pipeline: pipeline.snapshot(None),
            requested_by: "ann".into(),
        };
        let chunks = stream::iter(vec![Ok(people())]).boxed();
        let child = access.create_version(draft, chunks).await.unwrap();

        let edge = access.lineage_edge(&child).await.unwrap().unwrap();
        assert_eq!(edge.from_version, root);
        assert_eq!(edge.requested_by, "ann");
        assert!(access.lineage_edge(&root).await.unwrap().is_none());
        assert_eq!(access.children(&root).await.unwrap(), vec![child]);
    }
}
