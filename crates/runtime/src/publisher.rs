use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use babel_git::{CommitAuthor, Revision, StagingState, VersionControl};
use chrono::Utc;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::sync::ReconciliationBatch;

/// Counts of working-copy changes going into a commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeStats {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl ChangeStats {
    pub fn tally(status: &BTreeMap<String, StagingState>) -> Self {
        let mut stats = Self::default();
        for staging in status.values() {
            match staging {
                StagingState::Added | StagingState::Untracked => stats.added += 1,
                StagingState::Modified => stats.modified += 1,
                StagingState::Deleted => stats.deleted += 1,
                StagingState::Unmodified => {}
            }
        }
        stats
    }

    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted
    }
}

/// Stages the whole working copy, commits it as the configured author and
/// pushes.  Only ever runs after every task of the tick has returned.
#[derive(Clone)]
pub struct CommitPublisher {
    vcs: Arc<dyn VersionControl>,
    author: CommitAuthor,
    message: String,
}

impl CommitPublisher {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        author: CommitAuthor,
        message: impl Into<String>,
    ) -> Self {
        Self {
            vcs,
            author,
            message: message.into(),
        }
    }

    /// Returns the new commit, or `None` when there was nothing to commit.
    /// The push runs either way so an earlier unpushed commit still goes out.
    pub async fn publish(&self, batch: &ReconciliationBatch) -> EngineResult<Option<Revision>> {
        let vcs = Arc::clone(&self.vcs);
        let author = self.author.clone();
        let message = self.message.clone();
        let batch_size = batch.len();

        tokio::task::spawn_blocking(move || {
            let status = vcs.status().context("cannot read status before staging")?;
            let stats = ChangeStats::tally(&status);
            vcs.stage_all().context("staging failed")?;
            let commit = vcs
                .commit(&message, &author, Utc::now())
                .context("commit failed")?;
            match &commit {
                Some(revision) => info!(
                    commit = revision.short(),
                    added = stats.added,
                    modified = stats.modified,
                    deleted = stats.deleted,
                    batch = batch_size,
                    "committed vault changes"
                ),
                None => debug!("nothing to commit"),
            }
            vcs.push().context("push failed")?;
            Ok::<_, anyhow::Error>(commit)
        })
        .await
        .map_err(|e| EngineError::Publish(anyhow!("publish task failed: {e}")))?
        .map_err(EngineError::Publish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeVcs;

    #[test]
    fn tally_counts_untracked_as_added() {
        let status = BTreeMap::from([
            ("AREAS/a.md".to_string(), StagingState::Untracked),
            ("AREAS/b.md".to_string(), StagingState::Added),
            ("AREAS/c.md".to_string(), StagingState::Modified),
            ("AREAS/d.md".to_string(), StagingState::Deleted),
        ]);
        let stats = ChangeStats::tally(&status);
        assert_eq!(
            stats,
            ChangeStats {
                added: 2,
                modified: 1,
                deleted: 1
            }
        );
        assert_eq!(stats.total(), 4);
    }

    #[tokio::test]
    async fn publish_stages_commits_and_pushes() {
        let vcs = FakeVcs::new().with_status(&[("AREAS/a.md", StagingState::Untracked)]);
        let publisher = CommitPublisher::new(
            Arc::new(vcs.clone()),
            CommitAuthor::new("Babel", "babel@example.com"),
            "Babel update",
        );

        let commit = publisher.publish(&ReconciliationBatch::default()).await.unwrap();
        assert!(commit.is_some());
        assert_eq!(vcs.calls(), vec!["status", "stage_all", "commit", "push"]);
        assert_eq!(vcs.last_commit_message().as_deref(), Some("Babel update"));
    }

    #[tokio::test]
    async fn push_runs_even_without_a_commit() {
        let vcs = FakeVcs::new();
        let publisher = CommitPublisher::new(
            Arc::new(vcs.clone()),
            CommitAuthor::new("Babel", "babel@example.com"),
            "Babel update",
        );

        let commit = publisher.publish(&ReconciliationBatch::default()).await.unwrap();
        assert!(commit.is_none());
        assert!(vcs.calls().contains(&"push".to_string()));
    }

    #[tokio::test]
    async fn push_failure_is_a_publish_error() {
        let vcs = FakeVcs::new()
            .with_status(&[("AREAS/a.md", StagingState::Modified)])
            .failing_push();
        let publisher = CommitPublisher::new(
            Arc::new(vcs),
            CommitAuthor::new("Babel", "babel@example.com"),
            "Babel update",
        );
        let err = publisher.publish(&ReconciliationBatch::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Publish(_)));
        assert!(err.aborts_tick());
    }
}
