//! Tabular data: batches, schemas, cell helpers, statistics, and the
//! Dataset Access interface with its reference implementations.

pub mod access;
pub mod batch;
pub mod fs;
pub mod memory;
pub mod schema;
pub mod stats;
pub mod value;

pub use access::{ChunkStream, DatasetAccess, DatasetVersion, VersionDraft};
pub use batch::DataBatch;
pub use fs::FsDatasetAccess;
pub use memory::InMemoryDatasetAccess;
pub use schema::{ColumnSchema, ColumnType, SchemaDefinition};
pub use stats::{BasicStats, DatasetStats, StatsProvider};
