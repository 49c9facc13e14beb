use std::sync::Arc;

use babel_git::Revision;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::classifier::PathClassifier;
use crate::enrichment::{EnrichmentCoordinator, TaskOutcome};
use crate::error::EngineResult;
use crate::publisher::CommitPublisher;
use crate::sync::RepositorySync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Syncing,
    Enriching,
    Publishing,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Syncing => "syncing",
            EngineState::Enriching => "enriching",
            EngineState::Publishing => "publishing",
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub pulled: bool,
    /// Records in the merged batch, eligible or not.
    pub changes: usize,
    pub eligible: usize,
    pub enriched: usize,
    pub normalized: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub published: bool,
    pub commit: Option<Revision>,
}

impl TickReport {
    fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Enriched { renamed_from, .. } => {
                self.enriched += 1;
                if renamed_from.is_some() {
                    self.normalized += 1;
                }
            }
            TaskOutcome::Normalized { .. } => self.normalized += 1,
            TaskOutcome::Deleted { .. } => self.deleted += 1,
            TaskOutcome::Skipped { path, reason } => {
                debug!(path = %path, reason, "task skipped");
                self.skipped += 1;
            }
        }
    }
}

/// Runs one reconciliation per [`tick`](Self::tick): sync, classify, fan out
/// per-file tasks, wait for all of them, publish.
pub struct ReconciliationEngine {
    sync: RepositorySync,
    classifier: PathClassifier,
    coordinator: Arc<EnrichmentCoordinator>,
    publisher: CommitPublisher,
    state: watch::Sender<EngineState>,
}

impl ReconciliationEngine {
    pub fn new(
        sync: RepositorySync,
        classifier: PathClassifier,
        coordinator: EnrichmentCoordinator,
        publisher: CommitPublisher,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            sync,
            classifier,
            coordinator: Arc::new(coordinator),
            publisher,
            state,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn coordinator(&self) -> &EnrichmentCoordinator {
        &self.coordinator
    }

    fn enter(&self, next: EngineState) {
        let previous = self.state.send_replace(next);
        debug!(from = previous.as_str(), to = next.as_str(), "engine state");
    }

    /// Run one reconciliation.  Per-file failures are counted in the report;
    /// only sync and publish failures come back as errors.
    pub async fn tick(&self) -> EngineResult<TickReport> {
        self.enter(EngineState::Syncing);
        let batch = match self.sync.pull().await {
            Ok(batch) => batch,
            Err(err) => {
                self.enter(EngineState::Idle);
                return Err(err);
            }
        };

        let mut report = TickReport {
            pulled: batch.pulled(),
            changes: batch.len(),
            ..TickReport::default()
        };

        let eligible: Vec<_> = batch
            .records
            .values()
            .filter(|record| {
                let keep = self.classifier.is_eligible(&record.path);
                if !keep {
                    debug!(path = %record.path, "not eligible");
                }
                keep
            })
            .cloned()
            .collect();
        report.eligible = eligible.len();

        if eligible.is_empty() {
            debug!(changes = report.changes, "nothing eligible; tick ends without publishing");
            self.enter(EngineState::Idle);
            return Ok(report);
        }

        self.enter(EngineState::Enriching);
        let mut tasks = JoinSet::new();
        for record in eligible {
            let coordinator = Arc::clone(&self.coordinator);
            tasks.spawn(async move {
                let task = coordinator.plan(&record).await?;
                coordinator.process(task).await
            });
        }

        // Barrier: nothing below runs while a task is still in flight.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.record(&outcome),
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(error = %err, "file task failed");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(?err, "file task did not finish");
                }
            }
        }

        self.enter(EngineState::Publishing);
        let published = self.publisher.publish(&batch).await;
        self.enter(EngineState::Idle);
        report.commit = published?;
        report.published = true;

        info!(
            pulled = report.pulled,
            eligible = report.eligible,
            enriched = report.enriched,
            normalized = report.normalized,
            deleted = report.deleted,
            failed = report.failed,
            commit = report.commit.as_ref().map(Revision::short).unwrap_or("none"),
            "tick complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::Enricher;
    use crate::error::EngineError;
    use crate::normalizer::FilenameNormalizer;
    use crate::testing::{FakeCompletion, FakeVcs};
    use babel_config::VaultConfig;
    use babel_git::{CommitAuthor, StagingState};
    use babel_index::{MemoryIndex, RecordId};
    use babel_metadata::MetadataDocument;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Setup {
        dir: TempDir,
        vcs: FakeVcs,
        completion: Arc<FakeCompletion>,
        index: Arc<MemoryIndex>,
        engine: ReconciliationEngine,
    }

    fn setup(vcs: FakeVcs, completion: FakeCompletion) -> Setup {
        let dir = TempDir::new().unwrap();
        let vault = VaultConfig::default();
        let completion = Arc::new(completion);
        let index = Arc::new(MemoryIndex::new());
        let shared: Arc<dyn babel_git::VersionControl> = Arc::new(vcs.clone());

        let enricher = Enricher::new(
            completion.clone(),
            index.clone(),
            dir.path().join(&vault.metadata_dir),
            vault.max_content_bytes,
        );
        let coordinator = EnrichmentCoordinator::new(
            dir.path(),
            Some(FilenameNormalizer::from_config(&vault)),
            Some(enricher),
        );
        let engine = ReconciliationEngine::new(
            RepositorySync::new(shared.clone()),
            PathClassifier::from_config(&vault),
            coordinator,
            CommitPublisher::new(
                shared,
                CommitAuthor::new("Babel", "babel@example.com"),
                "Babel update",
            ),
        );
        Setup {
            dir,
            vcs,
            completion,
            index,
            engine,
        }
    }

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn untracked_file_is_renamed_enriched_and_committed() {
        let s = setup(
            FakeVcs::new().with_status(&[("AREAS/My File.txt", StagingState::Untracked)]),
            FakeCompletion::new(),
        );
        write(s.dir.path(), "AREAS/My File.txt", "notes");

        let report = s.engine.tick().await.unwrap();
        assert_eq!(report.eligible, 1);
        assert_eq!(report.enriched, 1);
        assert_eq!(report.normalized, 1);
        assert!(report.commit.is_some());
        assert!(s.dir.path().join("metadata/AREAS/my_file.txt.json").exists());
        assert_eq!(s.index.len().await, 1);
        assert_eq!(s.completion.calls(), 1);
        assert_eq!(
            s.vcs.calls(),
            vec!["head", "pull", "head", "status", "status", "stage_all", "commit", "push"]
        );
    }

    #[tokio::test]
    async fn remote_change_is_reprocessed_on_a_clean_copy() {
        let s = setup(
            FakeVcs::new()
                .with_heads(Some("aaaa"), Some("bbbb"))
                .with_diff(&["PROJECTS/readme.md"]),
            FakeCompletion::new(),
        );
        write(s.dir.path(), "PROJECTS/readme.md", "pulled text");
        let stale = MetadataDocument::new("stale", vec![]);
        s.engine
            .coordinator()
            .enricher()
            .unwrap()
            .store()
            .write("PROJECTS/readme.md", &stale)
            .await
            .unwrap();

        let report = s.engine.tick().await.unwrap();
        assert!(report.pulled);
        assert_eq!(report.enriched, 1);
        let sidecar = s
            .engine
            .coordinator()
            .enricher()
            .unwrap()
            .store()
            .read("PROJECTS/readme.md")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sidecar.summary, "summary of PROJECTS/readme.md");
        assert!(s.vcs.calls().contains(&"push".to_string()));
    }

    #[tokio::test]
    async fn deleted_file_drops_its_metadata() {
        let s = setup(
            FakeVcs::new().with_status(&[("RESOURCES/old.pdf", StagingState::Deleted)]),
            FakeCompletion::new(),
        );
        let doc = MetadataDocument::new("pdf", vec![]);
        let enricher = s.engine.coordinator().enricher().unwrap().clone();
        enricher.store().write("RESOURCES/old.pdf", &doc).await.unwrap();
        enricher
            .sidecar_index()
            .upsert("RESOURCES/old.pdf", doc.index_entry())
            .await
            .unwrap();
        s.index.insert(RecordId::new("pdf"), "RESOURCES/old.pdf", &doc).await;

        let report = s.engine.tick().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(s.completion.calls(), 0);
        assert!(!s.dir.path().join("metadata/RESOURCES/old.pdf.json").exists());
        assert!(enricher.sidecar_index().load().await.unwrap().is_empty());
        assert!(s.index.is_empty().await);
    }

    #[tokio::test]
    async fn ineligible_batch_publishes_nothing() {
        let s = setup(
            FakeVcs::new().with_status(&[
                (".git/config", StagingState::Modified),
                ("README.md", StagingState::Modified),
                ("metadata/index.json", StagingState::Modified),
            ]),
            FakeCompletion::new(),
        );

        let report = s.engine.tick().await.unwrap();
        assert_eq!(report.changes, 3);
        assert_eq!(report.eligible, 0);
        assert!(!report.published);
        assert_eq!(s.completion.calls(), 0);
        let calls = s.vcs.calls();
        for forbidden in ["stage_all", "commit", "push"] {
            assert!(!calls.contains(&forbidden.to_string()), "{forbidden} was called");
        }
    }

    #[tokio::test]
    async fn publish_waits_for_every_task() {
        let paths: Vec<String> = (0..8).map(|i| format!("AREAS/note_{i}.md")).collect();
        let status: Vec<(&str, StagingState)> = paths
            .iter()
            .map(|p| (p.as_str(), StagingState::Untracked))
            .collect();
        let completion = FakeCompletion::new().with_delay(Duration::from_millis(50));
        let vcs = FakeVcs::new()
            .with_status(&status)
            .observing(completion.in_flight());
        let s = setup(vcs, completion);
        for path in &paths {
            write(s.dir.path(), path, "x");
        }

        let report = s.engine.tick().await.unwrap();
        assert_eq!(report.enriched, 8);
        assert_eq!(s.vcs.in_flight_at_stage(), Some(0));
        assert!(s.completion.peak() > 1, "tasks did not overlap");
    }

    #[tokio::test]
    async fn one_failing_file_does_not_stop_the_others() {
        let s = setup(
            FakeVcs::new().with_status(&[
                ("AREAS/good.md", StagingState::Untracked),
                ("AREAS/bad.md", StagingState::Untracked),
            ]),
            FakeCompletion::new().failing_on("AREAS/bad.md"),
        );
        write(s.dir.path(), "AREAS/good.md", "fine");
        write(s.dir.path(), "AREAS/bad.md", "broken");

        let report = s.engine.tick().await.unwrap();
        assert_eq!(report.enriched, 1);
        assert_eq!(report.failed, 1);
        assert!(report.published);
        assert!(s.dir.path().join("metadata/AREAS/good.md.json").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn names_folding_together_never_lose_a_file() {
        for _ in 0..30 {
            let s = setup(
                FakeVcs::new().with_status(&[
                    ("AREAS/My Note.md", StagingState::Untracked),
                    ("AREAS/my note.md", StagingState::Untracked),
                ]),
                FakeCompletion::new(),
            );
            write(s.dir.path(), "AREAS/My Note.md", "FIRST");
            write(s.dir.path(), "AREAS/my note.md", "SECOND");

            let report = s.engine.tick().await.unwrap();
            assert_eq!(report.enriched, 1);
            assert_eq!(report.failed, 1);

            let mut bodies: Vec<String> = fs::read_dir(s.dir.path().join("AREAS"))
                .unwrap()
                .map(|entry| fs::read_to_string(entry.unwrap().path()).unwrap())
                .collect();
            bodies.sort();
            assert_eq!(bodies, vec!["FIRST", "SECOND"]);
        }
    }

    #[tokio::test]
    async fn sync_failure_aborts_before_publishing() {
        let s = setup(FakeVcs::new().failing_pull(), FakeCompletion::new());
        let states = s.engine.subscribe_state();

        let err = s.engine.tick().await.unwrap_err();
        assert!(matches!(err, EngineError::Sync(_)));
        assert!(!s.vcs.calls().contains(&"stage_all".to_string()));
        assert_eq!(*states.borrow(), EngineState::Idle);
    }

    #[tokio::test]
    async fn publish_failure_is_reported_after_enrichment() {
        let s = setup(
            FakeVcs::new()
                .with_status(&[("AREAS/a.md", StagingState::Untracked)])
                .failing_push(),
            FakeCompletion::new(),
        );
        write(s.dir.path(), "AREAS/a.md", "x");

        let err = s.engine.tick().await.unwrap_err();
        assert!(matches!(err, EngineError::Publish(_)));
        assert!(s.dir.path().join("metadata/AREAS/a.md.json").exists());
        assert_eq!(s.engine.state(), EngineState::Idle);
    }
}
