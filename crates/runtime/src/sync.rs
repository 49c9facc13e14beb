use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use babel_git::{PullOutcome, Revision, StagingState, VersionControl};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};

// ── Change records ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Dirty in the local working copy.
    LocalDirty,
    /// Touched by the commits brought in by the pull.
    RemoteDiff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub path: String,
    pub origin: ChangeOrigin,
    pub staging: StagingState,
}

impl ChangeRecord {
    pub fn local(path: impl Into<String>, staging: StagingState) -> Self {
        Self {
            path: path.into(),
            origin: ChangeOrigin::LocalDirty,
            staging,
        }
    }

    /// Remote changes are always tagged `Modified` so they get reprocessed.
    pub fn remote(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            origin: ChangeOrigin::RemoteDiff,
            staging: StagingState::Modified,
        }
    }
}

/// Merge the local dirty set with the remote diff.  On a path present in
/// both, the remote record wins.
pub fn merge_changes<L, R>(local: L, remote: R) -> BTreeMap<String, ChangeRecord>
where
    L: IntoIterator<Item = ChangeRecord>,
    R: IntoIterator<Item = ChangeRecord>,
{
    let mut merged = BTreeMap::new();
    for record in local.into_iter().chain(remote) {
        merged.insert(record.path.clone(), record);
    }
    merged
}

/// The deduplicated change set of one tick.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationBatch {
    pub records: BTreeMap<String, ChangeRecord>,
    pub head_before: Option<Revision>,
    pub head_after: Option<Revision>,
}

impl ReconciliationBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether the pull moved the head.
    pub fn pulled(&self) -> bool {
        self.head_before != self.head_after
    }

    pub fn remote_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.origin == ChangeOrigin::RemoteDiff)
            .count()
    }
}

// ── RepositorySync ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RepositorySync {
    vcs: Arc<dyn VersionControl>,
}

impl RepositorySync {
    pub fn new(vcs: Arc<dyn VersionControl>) -> Self {
        Self { vcs }
    }

    /// Pull the remote and build the tick's batch.  Every failure is a
    /// [`EngineError::Sync`].
    pub async fn pull(&self) -> EngineResult<ReconciliationBatch> {
        let vcs = Arc::clone(&self.vcs);
        tokio::task::spawn_blocking(move || collect_batch(vcs.as_ref()))
            .await
            .map_err(|e| EngineError::Sync(anyhow!("sync task failed: {e}")))?
            .map_err(EngineError::Sync)
    }
}

fn collect_batch(vcs: &dyn VersionControl) -> anyhow::Result<ReconciliationBatch> {
    let head_before = vcs.head().context("cannot read head before pull")?;

    match vcs.pull().context("pull failed")? {
        PullOutcome::UpToDate => debug!("vault already up to date"),
        PullOutcome::FastForwarded { from, to } => info!(
            from = from.as_ref().map(Revision::short).unwrap_or("(unborn)"),
            to = to.short(),
            "pulled remote changes"
        ),
    }

    let head_after = vcs.head().context("cannot read head after pull")?;

    let pulled = match (&head_before, &head_after) {
        (before, Some(after)) if before.as_ref() != Some(after) => vcs
            .diff_revisions(before.as_ref(), after)
            .context("cannot diff pulled revisions")?,
        _ => Vec::new(),
    };

    let status = vcs.status().context("cannot read working-copy status")?;
    let local = status
        .into_iter()
        .filter(|(_, staging)| *staging != StagingState::Unmodified)
        .map(|(path, staging)| ChangeRecord::local(path, staging));
    let remote = pulled.into_iter().map(ChangeRecord::remote);

    let records = merge_changes(local, remote);
    debug!(changes = records.len(), "merged change set");
    Ok(ReconciliationBatch {
        records,
        head_before,
        head_after,
    })
}
