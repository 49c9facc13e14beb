use std::collections::HashMap;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use babel_metadata::MetadataDocument;

use crate::{RecordId, VectorIndex};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub path: String,
    pub properties: Value,
}

/// Process-local index.  Used when no external index is configured and as a
/// test double.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    records: Mutex<HashMap<RecordId, StoredRecord>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn get(&self, id: &RecordId) -> Option<StoredRecord> {
        self.records.lock().await.get(id).cloned()
    }

    /// Insert a record under a caller-chosen id.
    pub async fn insert(&self, id: RecordId, path: &str, document: &MetadataDocument) {
        self.records.lock().await.insert(
            id,
            StoredRecord {
                path: path.to_string(),
                properties: document.record_properties(path),
            },
        );
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn find_by_path(&self, path: &str) -> Result<Option<RecordId>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .find(|(_, record)| record.path == path)
            .map(|(id, _)| id.clone()))
    }

    async fn create(&self, path: &str, document: &MetadataDocument) -> Result<RecordId> {
        let id = RecordId::new(Uuid::new_v4().to_string());
        self.insert(id.clone(), path, document).await;
        Ok(id)
    }

    async fn update(&self, id: &RecordId, path: &str, document: &MetadataDocument) -> Result<()> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(id) else {
            bail!("no record with id {id}");
        };
        if let (Value::Object(stored), Value::Object(incoming)) =
            (&mut record.properties, document.record_properties(path))
        {
            stored.extend(incoming);
        }
        record.path = path.to_string();
        Ok(())
    }

    async fn delete(&self, id: &RecordId) -> Result<()> {
        self.records.lock().await.remove(id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
