use std::collections::HashSet;

use babel_config::VaultConfig;

/// Decides which repository-relative paths take part in enrichment.
///
/// A path is eligible when its first segment is one of the configured vault
/// sections and none of its segments is a reserved name.
#[derive(Debug, Clone)]
pub struct PathClassifier {
    sections: HashSet<String>,
    reserved: HashSet<String>,
}

impl PathClassifier {
    pub fn new<S, R>(sections: S, reserved: R) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            sections: sections.into_iter().map(Into::into).collect(),
            reserved: reserved.into_iter().map(Into::into).collect(),
        }
    }

    /// The metadata directory is always reserved so sidecars never feed back
    /// into enrichment.
    pub fn from_config(vault: &VaultConfig) -> Self {
        let mut classifier = Self::new(
            vault.sections.iter().cloned(),
            vault.reserved_names.iter().cloned(),
        );
        classifier.reserved.insert(vault.metadata_dir.clone());
        classifier
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.contains(name)
    }

    pub fn is_eligible(&self, path: &str) -> bool {
        if path.is_empty() || path.starts_with('/') {
            return false;
        }
        let segments: Vec<&str> = path.split('/').collect();
        // A section root on its own is not a file inside the section.
        if segments.len() < 2 || !self.sections.contains(segments[0]) {
            return false;
        }
        segments.iter().all(|segment| {
            !matches!(*segment, "" | "." | "..") && !self.reserved.contains(*segment)
        })
    }
}
