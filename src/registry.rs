//! Open projects, keyed by canonical root.
//!
//! A host that edits several projects holds one [`ProjectRegistry`] and
//! passes it by reference; there is no process-wide engine. Opening the same
//! directory twice (by any spelling of its path) yields the same engine.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::{resolve_config, Config};
use crate::engine::RagEngine;

#[derive(Default)]
pub struct ProjectRegistry {
    engines: Mutex<HashMap<PathBuf, Arc<RagEngine>>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine for `root`, opening it with its `.inkwell/rag.toml` (or
    /// defaults) on first use.
    pub async fn open_project(&self, root: impl AsRef<Path>) -> Result<Arc<RagEngine>> {
        let key = canonical(root.as_ref())?;
        let config = resolve_config(&key, None)?;
        self.open_with(&key, config).await
    }

    /// Like [`open_project`](Self::open_project) with an explicit config.
    /// The config is ignored if the project is already open.
    pub async fn open_with(&self, root: impl AsRef<Path>, config: Config) -> Result<Arc<RagEngine>> {
        let key = canonical(root.as_ref())?;
        // Held across the open so two callers cannot build the same engine.
        let mut engines = self.engines.lock().await;
        if let Some(engine) = engines.get(&key) {
            return Ok(engine.clone());
        }
        let engine = Arc::new(RagEngine::open(&key, config).await?);
        tracing::info!(root = %key.display(), "opened project");
        engines.insert(key, engine.clone());
        Ok(engine)
    }

    pub async fn get(&self, root: impl AsRef<Path>) -> Option<Arc<RagEngine>> {
        let key = canonical(root.as_ref()).ok()?;
        self.engines.lock().await.get(&key).cloned()
    }

    /// Drop the registry's handle. In-flight users keep their `Arc`.
    pub async fn close(&self, root: impl AsRef<Path>) -> bool {
        match canonical(root.as_ref()) {
            Ok(key) => self.engines.lock().await.remove(&key).is_some(),
            Err(_) => false,
        }
    }

    /// Open project roots, sorted.
    pub async fn projects(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.engines.lock().await.keys().cloned().collect();
        roots.sort();
        roots
    }

    pub async fn len(&self) -> usize {
        self.engines.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn canonical(root: &Path) -> Result<PathBuf> {
    root.canonicalize()
        .with_context(|| format!("Project root not found: {}", root.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_same_root_shares_engine() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let registry = ProjectRegistry::new();

        let a = registry.open_project(dir.path()).await.unwrap();
        let b = registry
            .open_project(dir.path().join("sub").join(".."))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_projects_are_isolated() {
        let one = TempDir::new().unwrap();
        let two = TempDir::new().unwrap();
        std::fs::write(one.path().join("a.md"), "# A\n\nalpha resonance").unwrap();
        std::fs::write(two.path().join("b.md"), "# B\n\nbeta resonance").unwrap();

        let registry = ProjectRegistry::new();
        let e1 = registry.open_project(one.path()).await.unwrap();
        let e2 = registry.open_project(two.path()).await.unwrap();
        e1.index_project().await.unwrap();
        e2.index_project().await.unwrap();

        assert_eq!(e1.stats().await.files, 1);
        assert_eq!(e1.entries().await[0].source_path, "a.md");
        assert_eq!(e2.entries().await[0].source_path, "b.md");
        assert_eq!(registry.projects().await.len(), 2);
    }

    #[tokio::test]
    async fn test_close_and_missing_root() {
        let dir = TempDir::new().unwrap();
        let registry = ProjectRegistry::new();
        registry.open_project(dir.path()).await.unwrap();

        assert!(registry.get(dir.path()).await.is_some());
        assert!(registry.close(dir.path()).await);
        assert!(!registry.close(dir.path()).await);
        assert!(registry.is_empty().await);
        assert!(registry.open_project(dir.path().join("nope")).await.is_err());
    }
}
