use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::document::MetadataDocument;
use crate::fs::{read_optional, write_atomic};

/// Per-file sidecar documents under the metadata root.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<relative_path>.json`; the extension is appended, not replaced.
    pub fn sidecar_path(&self, relative_path: &str) -> PathBuf {
        let mut raw: OsString = self.root.join(relative_path).into_os_string();
        raw.push(".json");
        PathBuf::from(raw)
    }

    /// Write the sidecar for `relative_path`.  Returns `false` when the file
    /// on disk already holds exactly this content.
    pub async fn write(&self, relative_path: &str, document: &MetadataDocument) -> Result<bool> {
        let path = self.sidecar_path(relative_path);
        let rendered = document.to_pretty_json()?;

        if read_optional(&path).await?.as_deref() == Some(rendered.as_bytes()) {
            debug!(path = %relative_path, "sidecar unchanged");
            return Ok(false);
        }

        write_atomic(&path, rendered.as_bytes())
            .await
            .with_context(|| format!("failed to write sidecar {}", path.display()))?;
        Ok(true)
    }

    pub async fn read(&self, relative_path: &str) -> Result<Option<MetadataDocument>> {
        let path = self.sidecar_path(relative_path);
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("corrupt sidecar {}", path.display()))?;
        Ok(Some(MetadataDocument::from_value(value)?))
    }

    /// Remove the sidecar.  A missing sidecar is not an error; returns
    /// whether a file was actually deleted.
    pub async fn remove(&self, relative_path: &str) -> Result<bool> {
        let path = self.sidecar_path(relative_path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove sidecar {}", path.display()))
            }
        }
    }
}
