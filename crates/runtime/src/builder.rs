use std::sync::Arc;

use anyhow::{Context, Result};
use babel_config::AppConfig;
use babel_git::{CommitAuthor, Credentials, GitRepository, VersionControl};
use babel_index::{VectorIndex, build_index};
use babel_llm::{CompletionService, LlmRouter, MetadataCompleter, Provider};
use tracing::debug;

use crate::classifier::PathClassifier;
use crate::engine::ReconciliationEngine;
use crate::enrichment::{Enricher, EnrichmentCoordinator};
use crate::normalizer::FilenameNormalizer;
use crate::publisher::CommitPublisher;
use crate::sync::RepositorySync;

/// The two outside systems enrichment talks to.
#[derive(Clone)]
pub struct ExternalServices {
    pub completion: Arc<dyn CompletionService>,
    pub index: Arc<dyn VectorIndex>,
}

/// Build the completion service and vector index, or `None` when enrichment
/// is turned off.
pub fn build_services(config: &AppConfig) -> Result<Option<ExternalServices>> {
    if !config.tools.enrich_enabled {
        return Ok(None);
    }

    let router = LlmRouter::from_config(&config.llm).context("cannot configure the llm client")?;
    // Weaviate vectorizes with OpenAI on its side and needs the same key.
    let openai_key = (router.provider() == Provider::OpenAi)
        .then_some(config.llm.api_key.as_str())
        .filter(|key| !key.trim().is_empty());
    let index =
        build_index(&config.index, openai_key).context("cannot configure the vector index")?;

    debug!(
        provider = %router.provider(),
        model = router.model(),
        index = index.name(),
        "enrichment services ready"
    );
    Ok(Some(ExternalServices {
        completion: Arc::new(MetadataCompleter::new(router)),
        index,
    }))
}

pub fn open_repository(config: &AppConfig) -> Result<GitRepository> {
    let credentials = Credentials::from_ssh(
        &config.ssh.username,
        &config.ssh.key_path,
        &config.ssh.passphrase,
    );
    let branch = Some(config.repository.branch.clone()).filter(|b| !b.trim().is_empty());
    GitRepository::open(
        config.vault_root(),
        config.repository.remote.as_str(),
        branch,
        credentials,
    )
}

/// Assemble an engine for one configuration snapshot.  Fails when the vault
/// cannot be opened as a repository.
pub fn build_engine(
    config: &AppConfig,
    services: Option<ExternalServices>,
) -> Result<ReconciliationEngine> {
    let vcs: Arc<dyn VersionControl> = Arc::new(open_repository(config)?);
    let classifier = PathClassifier::from_config(&config.vault);

    let normalizer = config
        .tools
        .normalize_enabled
        .then(|| FilenameNormalizer::from_config(&config.vault));
    let enricher = services.map(|services| {
        Enricher::new(
            services.completion,
            services.index,
            config.metadata_root(),
            config.vault.max_content_bytes,
        )
    });
    let coordinator = EnrichmentCoordinator::new(config.vault_root(), normalizer, enricher);

    let publisher = CommitPublisher::new(
        Arc::clone(&vcs),
        CommitAuthor::new(&config.user.username, &config.user.email),
        config.repository.message.clone(),
    );

    Ok(ReconciliationEngine::new(
        RepositorySync::new(vcs),
        classifier,
        coordinator,
        publisher,
    ))
}
