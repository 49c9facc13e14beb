use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::credentials::Credentials;
use crate::{CommitAuthor, PullOutcome, Revision, StagingState, VersionControl};

fn open_repo(path: &Path) -> Result<git2::Repository> {
    git2::Repository::open(path)
        .map_err(|e| anyhow!("cannot open git repository at '{}': {}", path.display(), e))
}

/// libgit2-backed [`VersionControl`] for one working copy, one remote and one
/// branch.  The repository is reopened for every operation so the handle can
/// be shared freely across threads.
#[derive(Debug, Clone)]
pub struct GitRepository {
    path: PathBuf,
    remote: String,
    branch: Option<String>,
    credentials: Credentials,
}

impl GitRepository {
    /// Open the working copy at `path`.  Fails when it is not a git
    /// repository or `remote` is not configured in it.
    pub fn open(
        path: impl Into<PathBuf>,
        remote: impl Into<String>,
        branch: Option<String>,
        credentials: Credentials,
    ) -> Result<Self> {
        let path = path.into();
        let remote = remote.into();
        let repo = open_repo(&path)?;
        if repo.is_bare() {
            bail!("'{}' is a bare repository; a working copy is required", path.display());
        }
        repo.find_remote(&remote).with_context(|| {
            format!("remote '{remote}' is not configured in '{}'", path.display())
        })?;
        Ok(Self {
            path,
            remote,
            branch: branch.filter(|b| !b.trim().is_empty()),
            credentials,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn branch_name(&self, repo: &git2::Repository) -> Result<String> {
        if let Some(branch) = &self.branch {
            return Ok(branch.clone());
        }
        let head = repo.find_reference("HEAD")?;
        let target = head
            .symbolic_target()
            .ok_or_else(|| anyhow!("HEAD is detached; set repository.branch"))?;
        target
            .strip_prefix("refs/heads/")
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("HEAD points outside refs/heads: {target}"))
    }
}

fn head_commit(repo: &git2::Repository) -> Result<Option<git2::Commit<'_>>> {
    match repo.head() {
        Ok(head) => Ok(Some(head.peel_to_commit()?)),
        Err(e) if matches!(e.code(), git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound) => {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn commit_tree<'r>(repo: &'r git2::Repository, rev: &Revision) -> Result<git2::Tree<'r>> {
    let oid = git2::Oid::from_str(&rev.0)?;
    Ok(repo.find_commit(oid)?.tree()?)
}

fn classify(status: git2::Status) -> StagingState {
    use git2::Status;

    if status.contains(Status::INDEX_NEW) {
        StagingState::Added
    } else if status.contains(Status::WT_NEW) {
        StagingState::Untracked
    } else if status.intersects(Status::INDEX_DELETED | Status::WT_DELETED) {
        StagingState::Deleted
    } else if status.intersects(
        Status::INDEX_MODIFIED
            | Status::WT_MODIFIED
            | Status::INDEX_RENAMED
            | Status::WT_RENAMED
            | Status::INDEX_TYPECHANGE
            | Status::WT_TYPECHANGE
            | Status::CONFLICTED,
    ) {
        StagingState::Modified
    } else {
        StagingState::Unmodified
    }
}

impl VersionControl for GitRepository {
    fn head(&self) -> Result<Option<Revision>> {
        let repo = open_repo(&self.path)?;
        Ok(head_commit(&repo)?.map(|c| Revision::from(c.id())))
    }

    fn pull(&self) -> Result<PullOutcome> {
        let repo = open_repo(&self.path)?;
        let branch = self.branch_name(&repo)?;
        let mut remote = repo.find_remote(&self.remote)?;

        let mut fetch_options = git2::FetchOptions::new();
        fetch_options.remote_callbacks(self.credentials.remote_callbacks());
        if let Err(e) = remote.fetch(&[branch.as_str()], Some(&mut fetch_options), None) {
            if e.code() == git2::ErrorCode::NotFound {
                debug!(remote = %self.remote, %branch, "remote branch does not exist yet");
                return Ok(PullOutcome::UpToDate);
            }
            return Err(anyhow!("fetch from '{}' failed: {}", self.remote, e));
        }

        let fetch_head = match repo.find_reference("FETCH_HEAD") {
            Ok(reference) => reference,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(PullOutcome::UpToDate),
            Err(e) => return Err(e.into()),
        };
        let incoming = repo.reference_to_annotated_commit(&fetch_head)?;
        let (analysis, _) = repo.merge_analysis(&[&incoming])?;

        if analysis.is_up_to_date() {
            return Ok(PullOutcome::UpToDate);
        }
        if !analysis.is_fast_forward() && !analysis.is_unborn() {
            bail!(
                "local branch '{branch}' has diverged from '{}'; only fast-forward pulls are supported",
                self.remote
            );
        }

        let from = head_commit(&repo)?.map(|c| Revision::from(c.id()));
        let target = repo.find_commit(incoming.id())?;

        // Update the working copy first so local edits to untouched files
        // survive and conflicting ones abort the pull before any ref moves.
        repo.checkout_tree(target.as_object(), Some(git2::build::CheckoutBuilder::new().safe()))
            .context("checkout of pulled commit failed")?;

        let refname = format!("refs/heads/{branch}");
        match repo.find_reference(&refname) {
            Ok(mut reference) => {
                reference.set_target(target.id(), "babel: fast-forward")?;
            }
            Err(_) => {
                repo.reference(&refname, target.id(), true, "babel: initial pull")?;
            }
        }
        repo.set_head(&refname)?;

        let to = Revision::from(target.id());
        info!(
            from = from.as_ref().map(Revision::short).unwrap_or("(unborn)"),
            to = to.short(),
            %branch,
            "fast-forwarded"
        );
        Ok(PullOutcome::FastForwarded { from, to })
    }

    fn status(&self) -> Result<BTreeMap<String, StagingState>> {
        let repo = open_repo(&self.path)?;
        let statuses = repo.statuses(Some(
            git2::StatusOptions::new()
                .include_untracked(true)
                .recurse_untracked_dirs(true)
                .include_ignored(false),
        ))?;

        let mut out = BTreeMap::new();
        for entry in statuses.iter() {
            let Some(path) = entry.path() else {
                continue;
            };
            let state = classify(entry.status());
            if state != StagingState::Unmodified {
                out.insert(path.to_string(), state);
            }
        }
        Ok(out)
    }

    fn diff_revisions(&self, from: Option<&Revision>, to: &Revision) -> Result<Vec<String>> {
        let repo = open_repo(&self.path)?;
        let old_tree = from.map(|rev| commit_tree(&repo, rev)).transpose()?;
        let new_tree = commit_tree(&repo, to)?;

        let diff = repo.diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), None)?;
        let mut paths = BTreeSet::new();
        for delta in diff.deltas() {
            for file in [delta.old_file(), delta.new_file()] {
                if let Some(path) = file.path().and_then(Path::to_str) {
                    paths.insert(path.to_string());
                }
            }
        }
        Ok(paths.into_iter().collect())
    }

    fn stage_all(&self) -> Result<()> {
        let repo = open_repo(&self.path)?;
        let mut index = repo.index()?;
        // `git add -A`: new and modified files, then removals.
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        Ok(())
    }

    fn commit(
        &self,
        message: &str,
        author: &CommitAuthor,
        at: DateTime<Utc>,
    ) -> Result<Option<Revision>> {
        let repo = open_repo(&self.path)?;
        let mut index = repo.index()?;
        let tree_oid = index.write_tree()?;
        let parent = head_commit(&repo)?;

        let unchanged = match &parent {
            Some(parent) => parent.tree_id() == tree_oid,
            None => index.is_empty(),
        };
        if unchanged {
            debug!("index matches HEAD; nothing to commit");
            return Ok(None);
        }

        let tree = repo.find_tree(tree_oid)?;
        let time = git2::Time::new(at.timestamp(), 0);
        let sig = git2::Signature::new(&author.name, &author.email, &time)?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;

        let revision = Revision::from(oid);
        info!(sha = revision.short(), path = %self.path.display(), "committed");
        Ok(Some(revision))
    }

    fn push(&self) -> Result<()> {
        let repo = open_repo(&self.path)?;
        if head_commit(&repo)?.is_none() {
            debug!("branch is unborn; nothing to push");
            return Ok(());
        }
        let branch = self.branch_name(&repo)?;
        let mut remote = repo.find_remote(&self.remote)?;
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");

        let mut rejection: Option<String> = None;
        {
            let mut callbacks = self.credentials.remote_callbacks();
            callbacks.push_update_reference(|refname, status| {
                if let Some(message) = status {
                    rejection = Some(format!("{refname}: {message}"));
                }
                Ok(())
            });
            let mut push_options = git2::PushOptions::new();
            push_options.remote_callbacks(callbacks);
            remote
                .push(&[refspec.as_str()], Some(&mut push_options))
                .with_context(|| format!("push to '{}' failed", self.remote))?;
        }

        if let Some(reason) = rejection {
            bail!("push to '{}' rejected: {reason}", self.remote);
        }
        info!(remote = %self.remote, %branch, "pushed");
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
