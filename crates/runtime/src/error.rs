//! Error taxonomy of a reconciliation tick.
//!
//! `Sync` and `Publish` abort the whole tick; `Normalization` and
//! `Enrichment` abort only the task of the file they name.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Opening the repository, pulling, reading status or diffing failed.
    #[error("sync failed: {0:#}")]
    Sync(anyhow::Error),

    /// A file could not be renamed to its canonical name.
    #[error("cannot normalize '{path}': {source}")]
    Normalization {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The completion service, the sidecar store or the vector index failed
    /// for one file.
    #[error("enrichment of '{path}' failed: {cause:#}")]
    Enrichment { path: String, cause: anyhow::Error },

    /// Staging, committing or pushing failed.
    #[error("publish failed: {0:#}")]
    Publish(anyhow::Error),
}

impl EngineError {
    pub fn normalization(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Normalization {
            path: path.into(),
            source,
        }
    }

    pub fn enrichment(path: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self::Enrichment {
            path: path.into(),
            cause: cause.into(),
        }
    }

    /// Whether the error ends the tick rather than a single task.
    pub fn aborts_tick(&self) -> bool {
        matches!(self, Self::Sync(_) | Self::Publish(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn display_names_the_file() {
        let err = EngineError::enrichment("AREAS/a.md", anyhow!("bad json"));
        assert_eq!(err.to_string(), "enrichment of 'AREAS/a.md' failed: bad json");

        let err = EngineError::normalization(
            "AREAS/A.md",
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "target exists"),
        );
        assert!(err.to_string().starts_with("cannot normalize 'AREAS/A.md'"));
    }

    #[test]
    fn only_shared_phases_abort_the_tick() {
        assert!(EngineError::Sync(anyhow!("x")).aborts_tick());
        assert!(EngineError::Publish(anyhow!("x")).aborts_tick());
        assert!(!EngineError::enrichment("p", anyhow!("x")).aborts_tick());
    }
}
