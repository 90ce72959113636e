//! Local [`ObjectStore`] backends: a directory on disk and an in-memory map.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;

use super::ObjectStore;

/// Objects stored as files under `root`; the location is the relative key.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            bail!("invalid object key '{}'", key);
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(key.to_string())
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>> {
        let path = self.resolve(location)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let path = self.resolve(location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
        }
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, location: &str) -> bool {
        self.objects
            .read()
            .map(|o| o.contains_key(location))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| anyhow!("object map lock poisoned"))?;
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(key.to_string())
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| anyhow!("object map lock poisoned"))?;
        objects
            .get(location)
            .cloned()
            .ok_or_else(|| anyhow!("object '{}' not found", location))
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| anyhow!("object map lock poisoned"))?;
        objects.remove(location);
        Ok(())
    }
}
