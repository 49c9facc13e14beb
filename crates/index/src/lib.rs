//! External vector index holding one record per enriched vault file.
//!
//! The agent never searches the index; it only keeps it in step with the
//! vault: look a record up by its exact `path`, then create, merge-update or
//! delete it.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use babel_config::IndexConfig;
use babel_metadata::MetadataDocument;

mod memory;
mod weaviate;

pub use memory::{MemoryIndex, StoredRecord};
pub use weaviate::WeaviateIndex;

// ── RecordId ─────────────────────────────────────────────────────────────────

/// Identifier the index assigned to a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── VectorIndex ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Id of the record whose `path` equals `path` exactly.  No match is
    /// `Ok(None)`.
    async fn find_by_path(&self, path: &str) -> Result<Option<RecordId>>;

    async fn create(&self, path: &str, document: &MetadataDocument) -> Result<RecordId>;

    /// Merge `document` into the existing record; properties not present in
    /// `document` are kept.
    async fn update(&self, id: &RecordId, path: &str, document: &MetadataDocument) -> Result<()>;

    async fn delete(&self, id: &RecordId) -> Result<()>;

    /// Readiness probe.  Backends without one are always ready.
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Build the backend selected by `config.backend`.
///
/// `openai_api_key` is forwarded to Weaviate for server-side vectorization.
pub fn build_index(
    config: &IndexConfig,
    openai_api_key: Option<&str>,
) -> Result<Arc<dyn VectorIndex>> {
    match config.backend.trim().to_ascii_lowercase().as_str() {
        "weaviate" => Ok(Arc::new(WeaviateIndex::from_config(config, openai_api_key)?)),
        "memory" => Ok(Arc::new(MemoryIndex::new())),
        other => bail!("unknown index backend '{other}'"),
    }
}
