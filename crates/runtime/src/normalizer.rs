use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;

use babel_config::VaultConfig;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::classifier::PathClassifier;
use crate::error::{EngineError, EngineResult};

/// Canonical form of a file name.
///
/// The base name is trimmed, lower-cased, and its spaces and dots become
/// `_`.  The extension (from the last dot on) and any leading dots are kept
/// as they are.  Applying it twice changes nothing.
pub fn normalize_name(name: &str) -> String {
    let rest = name.trim_start_matches('.');
    let hidden = &name[..name.len() - rest.len()];
    let (base, extension) = match rest.rfind('.') {
        Some(idx) if idx > 0 => rest.split_at(idx),
        _ => (rest, ""),
    };
    let base = base.trim().to_lowercase().replace([' ', '.'], "_");
    format!("{hidden}{base}{extension}")
}

fn split_parent(relative_path: &str) -> (&str, &str) {
    match relative_path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", relative_path),
    }
}

/// Renames vault files to their canonical name.  Only the last path segment
/// is folded; directories keep their case.
///
/// Clones share one rename lock, so two files folding to the same name can
/// never both pass the existence check.
#[derive(Debug, Clone, Default)]
pub struct FilenameNormalizer {
    reserved: HashSet<String>,
    renames: Arc<Mutex<()>>,
}

impl FilenameNormalizer {
    pub fn new<R>(reserved: R) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            reserved: reserved.into_iter().map(Into::into).collect(),
            renames: Arc::default(),
        }
    }

    /// Reserved names plus the metadata directory are never renamed.
    pub fn from_config(vault: &VaultConfig) -> Self {
        let mut normalizer = Self::new(vault.reserved_names.iter().cloned());
        normalizer.reserved.insert(vault.metadata_dir.clone());
        normalizer
    }

    /// The relative path `relative_path` would have after [`apply`](Self::apply).
    pub fn canonical_path(&self, relative_path: &str) -> String {
        let (parent, name) = split_parent(relative_path);
        if self.reserved.contains(name) {
            return relative_path.to_string();
        }
        let canonical = normalize_name(name);
        if canonical.is_empty() {
            return relative_path.to_string();
        }
        if parent.is_empty() {
            canonical
        } else {
            format!("{parent}/{canonical}")
        }
    }

    /// Rename `root/relative_path` to its canonical name and return the new
    /// relative path.  Directories and reserved names are left alone.  An
    /// existing, different file at the target is never overwritten.
    pub async fn apply(&self, root: &Path, relative_path: &str) -> EngineResult<String> {
        let target = self.canonical_path(relative_path);
        if target == relative_path {
            return Ok(target);
        }

        let from = root.join(relative_path);
        let to = root.join(&target);
        // Held from the existence check until the rename is done.
        let _guard = self.renames.lock().await;
        let source = tokio::fs::symlink_metadata(&from)
            .await
            .map_err(|e| EngineError::normalization(relative_path, e))?;
        if source.is_dir() {
            debug!(path = %relative_path, "not renaming a directory");
            return Ok(relative_path.to_string());
        }

        match tokio::fs::symlink_metadata(&to).await {
            Ok(existing) if !same_file(&source, &existing, relative_path, &target) => {
                return Err(EngineError::normalization(
                    relative_path,
                    io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("'{target}' already exists"),
                    ),
                ));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(EngineError::normalization(relative_path, e)),
        }

        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| EngineError::normalization(relative_path, e))?;
        info!(from = %relative_path, to = %target, "renamed to canonical name");
        Ok(target)
    }

    /// Normalize every eligible file below `root`.  Returns the renames that
    /// happened as `(from, to)` pairs; failures are logged and skipped.
    pub async fn normalize_tree(
        &self,
        root: &Path,
        classifier: &PathClassifier,
    ) -> Vec<(String, String)> {
        let candidates: Vec<String> = WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !classifier.is_reserved(name))
                    .unwrap_or(false)
            })
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(?err, "skipping unreadable vault entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let relative = entry.path().strip_prefix(root).ok()?.to_str()?;
                let relative = relative.replace(std::path::MAIN_SEPARATOR, "/");
                classifier.is_eligible(&relative).then_some(relative)
            })
            .filter(|relative| self.canonical_path(relative) != *relative)
            .collect();

        let mut renamed = Vec::new();
        for relative in candidates {
            match self.apply(root, &relative).await {
                Ok(target) if target != relative => renamed.push((relative, target)),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "bulk normalization skipped a file"),
            }
        }
        renamed
    }
}

#[cfg(unix)]
fn same_file(a: &std::fs::Metadata, b: &std::fs::Metadata, _from: &str, _to: &str) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

/// Without inode numbers, a target that differs only by case is taken to be
/// the source itself on a case-insensitive filesystem.
#[cfg(not(unix))]
fn same_file(_a: &std::fs::Metadata, _b: &std::fs::Metadata, from: &str, to: &str) -> bool {
    from.to_lowercase() == to.to_lowercase()
}
