use std::path::{Path, PathBuf};
use std::sync::Arc;

use babel_git::StagingState;
use babel_index::{RecordId, VectorIndex};
use babel_llm::CompletionService;
use babel_metadata::{MetadataStore, SidecarIndex};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::normalizer::FilenameNormalizer;
use crate::sync::ChangeRecord;

// ── Tasks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Enrich,
    Delete,
}

/// One unit of per-file work dispatched by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentTask {
    pub path: String,
    /// Where the file will live once normalized.  Equal to `path` for
    /// deletions and when normalization is off.
    pub normalized_path: String,
    /// Only set for deletions, where it must be captured before the file is
    /// gone.  Enrich tasks look their record up after normalization.
    pub external_id: Option<RecordId>,
    pub action: TaskAction,
    pub staging: StagingState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Enriched {
        path: String,
        created: bool,
        renamed_from: Option<String>,
    },
    /// Renamed, but enrichment is turned off.
    Normalized { path: String, from: String },
    Deleted { path: String, record_deleted: bool },
    Skipped { path: String, reason: &'static str },
}

impl TaskOutcome {
    pub fn path(&self) -> &str {
        match self {
            TaskOutcome::Enriched { path, .. }
            | TaskOutcome::Normalized { path, .. }
            | TaskOutcome::Deleted { path, .. }
            | TaskOutcome::Skipped { path, .. } => path,
        }
    }
}

// ── Enricher ─────────────────────────────────────────────────────────────────

/// The metadata half of a task: completion service, sidecars and the
/// external index.
#[derive(Clone)]
pub struct Enricher {
    completion: Arc<dyn CompletionService>,
    index: Arc<dyn VectorIndex>,
    store: MetadataStore,
    sidecar_index: Arc<SidecarIndex>,
    max_content_bytes: usize,
}

impl Enricher {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        index: Arc<dyn VectorIndex>,
        metadata_root: impl Into<PathBuf>,
        max_content_bytes: usize,
    ) -> Self {
        let metadata_root = metadata_root.into();
        Self {
            completion,
            index,
            sidecar_index: Arc::new(SidecarIndex::in_dir(&metadata_root)),
            store: MetadataStore::new(metadata_root),
            max_content_bytes,
        }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn sidecar_index(&self) -> &SidecarIndex {
        &self.sidecar_index
    }

    async fn lookup(&self, path: &str) -> EngineResult<Option<RecordId>> {
        self.index
            .find_by_path(path)
            .await
            .map_err(|e| EngineError::enrichment(path, e))
    }

    async fn read_content(&self, absolute: &Path, path: &str) -> EngineResult<String> {
        let bytes = tokio::fs::read(absolute)
            .await
            .map_err(|e| EngineError::enrichment(path, e))?;
        let mut content = String::from_utf8_lossy(&bytes).into_owned();
        if content.len() > self.max_content_bytes {
            let mut cut = self.max_content_bytes;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
            debug!(path = %path, bytes = bytes.len(), "content truncated for completion");
        }
        Ok(content)
    }

    async fn enrich(
        &self,
        root: &Path,
        path: &str,
        staging: StagingState,
        renamed_from: Option<String>,
    ) -> EngineResult<TaskOutcome> {
        // New files have no prior record.
        let mut existing = None;
        if staging != StagingState::Untracked {
            existing = self.lookup(path).await?;
            if existing.is_none() {
                if let Some(old) = &renamed_from {
                    existing = self.lookup(old).await?;
                }
            }
        }

        let content = self.read_content(&root.join(path), path).await?;
        let document = self
            .completion
            .complete(path, &content)
            .await
            .map_err(|e| EngineError::enrichment(path, e))?;

        self.store
            .write(path, &document)
            .await
            .map_err(|e| EngineError::enrichment(path, e))?;
        self.sidecar_index
            .upsert(path, document.index_entry())
            .await
            .map_err(|e| EngineError::enrichment(path, e))?;

        if let Some(old) = &renamed_from {
            self.forget_local(old).await?;
        }

        let created = match existing {
            Some(id) => {
                self.index
                    .update(&id, path, &document)
                    .await
                    .map_err(|e| EngineError::enrichment(path, e))?;
                debug!(path = %path, id = %id, "external record updated");
                false
            }
            None => {
                let id = self
                    .index
                    .create(path, &document)
                    .await
                    .map_err(|e| EngineError::enrichment(path, e))?;
                debug!(path = %path, id = %id, "external record created");
                true
            }
        };

        info!(path = %path, created, "enriched");
        Ok(TaskOutcome::Enriched {
            path: path.to_string(),
            created,
            renamed_from,
        })
    }

    /// Drop the sidecar and the `index.json` entry of `path`.
    async fn forget_local(&self, path: &str) -> EngineResult<()> {
        self.store
            .remove(path)
            .await
            .map_err(|e| EngineError::enrichment(path, e))?;
        self.sidecar_index
            .remove(path)
            .await
            .map_err(|e| EngineError::enrichment(path, e))?;
        Ok(())
    }

    async fn delete(
        &self,
        path: &str,
        external_id: Option<&RecordId>,
    ) -> EngineResult<TaskOutcome> {
        self.forget_local(path).await?;

        let record_deleted = match external_id {
            Some(id) => {
                self.index
                    .delete(id)
                    .await
                    .map_err(|e| EngineError::enrichment(path, e))?;
                true
            }
            None => false,
        };

        info!(path = %path, record_deleted, "metadata removed");
        Ok(TaskOutcome::Deleted {
            path: path.to_string(),
            record_deleted,
        })
    }
}

// ── Coordinator ──────────────────────────────────────────────────────────────

/// Per-file pipeline composed from the enabled capabilities.  Either half may
/// be absent; with neither, every task is skipped.
#[derive(Clone)]
pub struct EnrichmentCoordinator {
    root: PathBuf,
    normalizer: Option<FilenameNormalizer>,
    enricher: Option<Enricher>,
}

impl EnrichmentCoordinator {
    pub fn new(
        root: impl Into<PathBuf>,
        normalizer: Option<FilenameNormalizer>,
        enricher: Option<Enricher>,
    ) -> Self {
        Self {
            root: root.into(),
            normalizer,
            enricher,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn enricher(&self) -> Option<&Enricher> {
        self.enricher.as_ref()
    }

    pub fn planned_path(&self, path: &str) -> String {
        match &self.normalizer {
            Some(normalizer) => normalizer.canonical_path(path),
            None => path.to_string(),
        }
    }

    /// External id for `path`.  A failed lookup is an enrichment error, so a
    /// deletion never goes ahead with its external record unresolved.
    pub async fn resolve_existing(&self, path: &str) -> EngineResult<Option<RecordId>> {
        match &self.enricher {
            Some(enricher) => enricher.lookup(path).await,
            None => Ok(None),
        }
    }

    /// Turn a change record into a task.  A record whose file is already gone
    /// becomes a deletion, and its external id is resolved now.
    pub async fn plan(&self, record: &ChangeRecord) -> EngineResult<EnrichmentTask> {
        let on_disk = tokio::fs::symlink_metadata(self.root.join(&record.path))
            .await
            .is_ok();

        if record.staging == StagingState::Deleted || !on_disk {
            return Ok(EnrichmentTask {
                path: record.path.clone(),
                normalized_path: record.path.clone(),
                external_id: self.resolve_existing(&record.path).await?,
                action: TaskAction::Delete,
                staging: record.staging,
            });
        }

        Ok(EnrichmentTask {
            path: record.path.clone(),
            normalized_path: self.planned_path(&record.path),
            external_id: None,
            action: TaskAction::Enrich,
            staging: record.staging,
        })
    }

    pub async fn process(&self, task: EnrichmentTask) -> EngineResult<TaskOutcome> {
        match task.action {
            TaskAction::Delete => match &self.enricher {
                Some(enricher) => {
                    enricher
                        .delete(&task.path, task.external_id.as_ref())
                        .await
                }
                None => Ok(TaskOutcome::Skipped {
                    path: task.path,
                    reason: "enrichment disabled",
                }),
            },
            TaskAction::Enrich => self.process_enrich(task).await,
        }
    }

    async fn process_enrich(&self, task: EnrichmentTask) -> EngineResult<TaskOutcome> {
        let mut path = task.path.clone();
        let mut renamed_from = None;
        if let Some(normalizer) = &self.normalizer {
            let target = normalizer.apply(&self.root, &task.path).await?;
            if target != task.path {
                renamed_from = Some(task.path.clone());
                path = target;
            }
        }

        let Some(enricher) = &self.enricher else {
            return Ok(match renamed_from {
                Some(from) => TaskOutcome::Normalized { path, from },
                None => TaskOutcome::Skipped {
                    path,
                    reason: "enrichment disabled",
                },
            });
        };

        match tokio::fs::metadata(self.root.join(&path)).await {
            Ok(meta) if meta.is_dir() => {
                return Ok(TaskOutcome::Skipped {
                    path,
                    reason: "directory",
                });
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TaskOutcome::Skipped {
                    path,
                    reason: "file vanished",
                });
            }
            Err(err) => return Err(EngineError::enrichment(path, err)),
        }

        enricher.enrich(&self.root, &path, task.staging, renamed_from).await
    }
}
