//! Version-control backend for the vault.
//!
//! [`VersionControl`] is the narrow contract the reconciliation engine needs
//! (pull, status, diff, stage, commit, push); [`GitRepository`] implements it
//! in-process with libgit2.  All methods block; async callers run them on the
//! blocking pool.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};

mod credentials;
mod repository;

pub use credentials::Credentials;
pub use repository::GitRepository;

// ── Types ────────────────────────────────────────────────────────────────────

/// Working-copy state of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagingState {
    Added,
    Modified,
    Deleted,
    Untracked,
    Unmodified,
}

impl StagingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingState::Added => "added",
            StagingState::Modified => "modified",
            StagingState::Deleted => "deleted",
            StagingState::Untracked => "untracked",
            StagingState::Unmodified => "unmodified",
        }
    }
}

impl std::fmt::Display for StagingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A commit id in hex form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(pub String);

impl Revision {
    pub fn short(&self) -> &str {
        self.0.get(..7).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<git2::Oid> for Revision {
    fn from(oid: git2::Oid) -> Self {
        Revision(oid.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// The remote had nothing new.
    UpToDate,
    /// The local branch moved forward.  `from` is `None` when the branch was
    /// unborn before the pull.
    FastForwarded {
        from: Option<Revision>,
        to: Revision,
    },
}

/// Name and email recorded as both author and committer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

impl CommitAuthor {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

// ── VersionControl ───────────────────────────────────────────────────────────

pub trait VersionControl: Send + Sync {
    /// Current head commit; `None` on an unborn branch.
    fn head(&self) -> Result<Option<Revision>>;

    /// Fetch the configured branch and fast-forward onto it.  A history that
    /// diverged from the remote is an error.
    fn pull(&self) -> Result<PullOutcome>;

    /// Every path whose working-copy state differs from HEAD, keyed by its
    /// repository-relative path with `/` separators.
    fn status(&self) -> Result<BTreeMap<String, StagingState>>;

    /// Paths touched between two commits.  `from = None` diffs against the
    /// empty tree.
    fn diff_revisions(&self, from: Option<&Revision>, to: &Revision) -> Result<Vec<String>>;

    /// Stage every change in the working copy, deletions included.
    fn stage_all(&self) -> Result<()>;

    /// Commit the index.  Returns `None` without committing when the index
    /// matches the parent tree.
    fn commit(
        &self,
        message: &str,
        author: &CommitAuthor,
        at: DateTime<Utc>,
    ) -> Result<Option<Revision>>;

    fn push(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_short_form() {
        let rev = Revision("0123456789abcdef".to_string());
        assert_eq!(rev.short(), "0123456");
        assert_eq!(Revision("abc".to_string()).short(), "abc");
    }

    #[test]
    fn staging_state_labels() {
        assert_eq!(StagingState::Untracked.to_string(), "untracked");
        assert_eq!(StagingState::Deleted.as_str(), "deleted");
    }
}
