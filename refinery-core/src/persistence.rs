//! Atomic file writes and JSON loading for the file-backed dataset store.
//!
//! Files are written to a `.tmp` sibling and renamed into place, so readers
//! never observe a partially written manifest.

use crate::error::Result;
use std::io;
use std::path::Path;

/// Atomically write `data` as pretty-printed JSON, creating parent directories.
pub async fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(data)?;
    atomic_write(path, &json).await
}

/// Atomically write raw bytes.
pub async fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Load JSON from `path`. Returns `Ok(None)` if the file does not exist.
pub async fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Remove a directory tree, ignoring a missing directory.
pub async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Manifest {
        name: String,
        rows: u32,
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("manifest.json");
        let data = Manifest {
            name: "customers".into(),
            rows: 42,
        };

        atomic_write_json(&path, &data).await.unwrap();
        let loaded: Option<Manifest> = load_json(&path).await.unwrap();
        assert_eq!(loaded, Some(data));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Manifest> = load_json(&dir.path().join("absent.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        atomic_write(&path, b"{not json").await.unwrap();
        assert!(load_json::<Manifest>(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_dir_if_exists() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("staging").join("v1");
        tokio::fs::create_dir_all(&staged).await.unwrap();
        remove_dir_if_exists(&staged).await.unwrap();
        assert!(!staged.exists());
        remove_dir_if_exists(&staged).await.unwrap();
    }
}
