use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::document::IndexEntry;
use crate::fs::{read_optional, write_atomic};

pub const INDEX_FILE_NAME: &str = "index.json";

/// The aggregate `index.json`: relative path → `{summary, highlights}`.
///
/// Every enrichment task of a tick mutates this one file, so each
/// read-modify-write cycle holds `guard` for its whole duration.  Share one
/// instance (behind an `Arc`) between all writers.
#[derive(Debug)]
pub struct SidecarIndex {
    path: PathBuf,
    guard: Mutex<()>,
}

impl SidecarIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Index located in `metadata_root`.
    pub fn in_dir(metadata_root: impl AsRef<Path>) -> Self {
        Self::new(metadata_root.as_ref().join(INDEX_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<BTreeMap<String, IndexEntry>> {
        let _lock = self.guard.lock().await;
        self.read_entries().await
    }

    pub async fn upsert(&self, relative_path: &str, entry: IndexEntry) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut entries = self.read_entries().await?;
        entries.insert(relative_path.to_string(), entry);
        self.write_entries(&entries).await
    }

    /// Drop the entry for `relative_path`.  Returns whether one existed; the
    /// file is left untouched otherwise.
    pub async fn remove(&self, relative_path: &str) -> Result<bool> {
        let _lock = self.guard.lock().await;
        let mut entries = self.read_entries().await?;
        if entries.remove(relative_path).is_none() {
            return Ok(false);
        }
        self.write_entries(&entries).await?;
        Ok(true)
    }

    async fn read_entries(&self) -> Result<BTreeMap<String, IndexEntry>> {
        match read_optional(&self.path).await? {
            Some(bytes) if !bytes.iter().all(u8::is_ascii_whitespace) => {
                serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt metadata index {}", self.path.display()))
            }
            _ => Ok(BTreeMap::new()),
        }
    }

    async fn write_entries(&self, entries: &BTreeMap<String, IndexEntry>) -> Result<()> {
        let rendered = serde_json::to_string_pretty(entries)?;
        write_atomic(&self.path, rendered.as_bytes())
            .await
            .with_context(|| format!("failed to write metadata index {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn entry(summary: &str) -> IndexEntry {
        IndexEntry {
            summary: summary.to_string(),
            highlights: vec![format!("{summary}-h")],
        }
    }

    #[tokio::test]
    async fn upsert_creates_file_and_replaces_entry() {
        let dir = TempDir::new().unwrap();
        let index = SidecarIndex::in_dir(dir.path().join("metadata"));

        index.upsert("AREAS/a.md", entry("one")).await.unwrap();
        index.upsert("AREAS/a.md", entry("two")).await.unwrap();

        let entries = index.load().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["AREAS/a.md"].summary, "two");
        assert!(dir.path().join("metadata/index.json").exists());
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let dir = TempDir::new().unwrap();
        let index = SidecarIndex::in_dir(dir.path());
        index.upsert("RESOURCES/old.pdf", entry("old")).await.unwrap();
        index.upsert("RESOURCES/keep.pdf", entry("keep")).await.unwrap();

        assert!(index.remove("RESOURCES/old.pdf").await.unwrap());
        assert!(!index.remove("RESOURCES/old.pdf").await.unwrap());

        let entries = index.load().await.unwrap();
        assert_eq!(entries.keys().collect::<Vec<_>>(), vec!["RESOURCES/keep.pdf"]);
    }

    #[tokio::test]
    async fn concurrent_upserts_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let index = Arc::new(SidecarIndex::in_dir(dir.path()));

        let mut set = tokio::task::JoinSet::new();
        for i in 0..32 {
            let index = Arc::clone(&index);
            set.spawn(async move { index.upsert(&format!("AREAS/{i}.md"), entry("x")).await });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap().unwrap();
        }

        assert_eq!(index.load().await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn empty_file_loads_as_empty_index() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.json"), "\n").unwrap();
        let index = SidecarIndex::in_dir(dir.path());
        assert!(index.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.json"), "{ not json").unwrap();
        let index = SidecarIndex::in_dir(dir.path());
        assert!(index.upsert("AREAS/a.md", entry("a")).await.is_err());
        // The corrupt file is not overwritten.
        assert_eq!(
            std::fs::read_to_string(dir.path().join("index.json")).unwrap(),
            "{ not json"
        );
    }
}
