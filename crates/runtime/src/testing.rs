//! Test doubles for the version-control backend, the completion service and
//! the vector index.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use babel_git::{CommitAuthor, PullOutcome, Revision, StagingState, VersionControl};
use babel_index::{MemoryIndex, RecordId, VectorIndex};
use babel_llm::CompletionService;
use babel_metadata::MetadataDocument;
use chrono::{DateTime, Utc};

// ── FakeVcs ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct VcsState {
    head_before: Option<Revision>,
    head_after: Option<Revision>,
    pulled: bool,
    status: BTreeMap<String, StagingState>,
    diff: Vec<String>,
    calls: Vec<String>,
    fail_pull: bool,
    fail_push: bool,
    observed: Option<Arc<AtomicUsize>>,
    in_flight_at_stage: Option<usize>,
    last_message: Option<String>,
}

/// Scripted [`VersionControl`].  Clones share state so a test can keep a
/// handle after giving one to the engine.
#[derive(Clone, Default)]
pub struct FakeVcs {
    state: Arc<Mutex<VcsState>>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default().with_heads(Some("base"), Some("base"))
    }

    fn edit(self, f: impl FnOnce(&mut VcsState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    fn log(&self, call: &str) {
        self.state.lock().unwrap().calls.push(call.to_string());
    }

    pub fn with_heads(self, before: Option<&str>, after: Option<&str>) -> Self {
        self.edit(|s| {
            s.head_before = before.map(|h| Revision(h.to_string()));
            s.head_after = after.map(|h| Revision(h.to_string()));
        })
    }

    pub fn with_status(self, entries: &[(&str, StagingState)]) -> Self {
        self.edit(|s| {
            s.status = entries
                .iter()
                .map(|(path, staging)| (path.to_string(), *staging))
                .collect();
        })
    }

    pub fn with_diff(self, paths: &[&str]) -> Self {
        self.edit(|s| s.diff = paths.iter().map(|p| p.to_string()).collect())
    }

    pub fn failing_pull(self) -> Self {
        self.edit(|s| s.fail_pull = true)
    }

    pub fn failing_push(self) -> Self {
        self.edit(|s| s.fail_push = true)
    }

    /// Record the value of `counter` when `stage_all` runs.
    pub fn observing(self, counter: Arc<AtomicUsize>) -> Self {
        self.edit(|s| s.observed = Some(counter))
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn in_flight_at_stage(&self) -> Option<usize> {
        self.state.lock().unwrap().in_flight_at_stage
    }

    pub fn last_commit_message(&self) -> Option<String> {
        self.state.lock().unwrap().last_message.clone()
    }
}

impl VersionControl for FakeVcs {
    fn head(&self) -> Result<Option<Revision>> {
        self.log("head");
        let s = self.state.lock().unwrap();
        Ok(if s.pulled { s.head_after.clone() } else { s.head_before.clone() })
    }

    fn pull(&self) -> Result<PullOutcome> {
        self.log("pull");
        let mut s = self.state.lock().unwrap();
        if s.fail_pull {
            bail!("remote unreachable");
        }
        s.pulled = true;
        match (&s.head_before, &s.head_after) {
            (before, Some(after)) if before.as_ref() != Some(after) => {
                Ok(PullOutcome::FastForwarded {
                    from: before.clone(),
                    to: after.clone(),
                })
            }
            _ => Ok(PullOutcome::UpToDate),
        }
    }

    fn status(&self) -> Result<BTreeMap<String, StagingState>> {
        self.log("status");
        Ok(self.state.lock().unwrap().status.clone())
    }

    fn diff_revisions(&self, _from: Option<&Revision>, _to: &Revision) -> Result<Vec<String>> {
        self.log("diff");
        Ok(self.state.lock().unwrap().diff.clone())
    }

    fn stage_all(&self) -> Result<()> {
        self.log("stage_all");
        let mut s = self.state.lock().unwrap();
        s.in_flight_at_stage = s.observed.as_ref().map(|c| c.load(Ordering::SeqCst));
        Ok(())
    }

    fn commit(
        &self,
        message: &str,
        _author: &CommitAuthor,
        _at: DateTime<Utc>,
    ) -> Result<Option<Revision>> {
        self.log("commit");
        let mut s = self.state.lock().unwrap();
        if s.status.is_empty() {
            return Ok(None);
        }
        s.last_message = Some(message.to_string());
        Ok(Some(Revision("c0ffee0123456789".to_string())))
    }

    fn push(&self) -> Result<()> {
        self.log("push");
        if self.state.lock().unwrap().fail_push {
            bail!("rejected by remote");
        }
        Ok(())
    }
}

// ── FakeCompletion ───────────────────────────────────────────────────────────

/// Completion service that answers `summary of <path>` and tracks how many
/// calls overlap.
#[derive(Default)]
pub struct FakeCompletion {
    calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
    delay: Option<Duration>,
    fail_on: Option<String>,
    seen: Mutex<Vec<(String, String)>>,
}

impl FakeCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_on(mut self, path: &str) -> Self {
        self.fail_on = Some(path.to_string());
        self
    }

    pub fn in_flight(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.in_flight)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn last_content(&self) -> Option<String> {
        self.seen.lock().unwrap().last().map(|(_, c)| c.clone())
    }
}

#[async_trait]
impl CompletionService for FakeCompletion {
    async fn complete(&self, path: &str, content: &str) -> Result<MetadataDocument> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((path.to_string(), content.to_string()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_on.as_deref() == Some(path) {
            bail!("model returned malformed JSON");
        }
        Ok(MetadataDocument::new(
            format!("summary of {path}"),
            vec![format!("{} bytes", content.len())],
        ))
    }
}

// ── CountingIndex ────────────────────────────────────────────────────────────

/// [`MemoryIndex`] that counts `find_by_path` calls and can be told to fail
/// them.  Derefs to the inner index for inspection.
#[derive(Default)]
pub struct CountingIndex {
    inner: MemoryIndex,
    lookups: AtomicUsize,
    fail_lookups: bool,
}

impl CountingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_lookups(mut self) -> Self {
        self.fail_lookups = true;
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl Deref for CountingIndex {
    type Target = MemoryIndex;

    fn deref(&self) -> &MemoryIndex {
        &self.inner
    }
}

#[async_trait]
impl VectorIndex for CountingIndex {
    async fn find_by_path(&self, path: &str) -> Result<Option<RecordId>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups {
            bail!("index unreachable");
        }
        self.inner.find_by_path(path).await
    }

    async fn create(&self, path: &str, document: &MetadataDocument) -> Result<RecordId> {
        self.inner.create(path, document).await
    }

    async fn update(&self, id: &RecordId, path: &str, document: &MetadataDocument) -> Result<()> {
        self.inner.update(id, path, document).await
    }

    async fn delete(&self, id: &RecordId) -> Result<()> {
        self.inner.delete(id).await
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}
