use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tracing::debug;

use babel_metadata::MetadataDocument;

use crate::{LlmRouter, extract_json_output};

/// Turns the raw content of a vault file into a metadata document.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, path: &str, content: &str) -> Result<MetadataDocument>;
}

/// [`CompletionService`] backed by a configured LLM provider.
#[derive(Debug, Clone)]
pub struct MetadataCompleter {
    router: LlmRouter,
}

impl MetadataCompleter {
    pub fn new(router: LlmRouter) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &LlmRouter {
        &self.router
    }
}

#[async_trait]
impl CompletionService for MetadataCompleter {
    async fn complete(&self, path: &str, content: &str) -> Result<MetadataDocument> {
        let prompt = build_metadata_prompt(path, content);
        let reply = self.router.chat_json(&prompt).await?;
        debug!(
            path,
            provider = %self.router.provider(),
            reply_len = reply.len(),
            "metadata completion received"
        );

        let value: serde_json::Value = extract_json_output(&reply)
            .ok_or_else(|| anyhow!("completion for {path} did not contain a JSON object"))?;
        MetadataDocument::from_value(value)
    }
}

/// Prompt asking the model to describe one vault file as JSON.
pub fn build_metadata_prompt(path: &str, content: &str) -> String {
    format!(
        "You maintain the metadata catalogue of a personal knowledge vault.\n\
         Describe the file below and reply with a single JSON object only.\n\
         Required keys:\n\
         - \"summary\": two or three sentences describing the file.\n\
         - \"highlights\": a list of at most five short strings with the key facts, names or dates.\n\
         Optional keys: \"tags\" (list of lower-case keywords), \"category\" (one word).\n\
         \n\
         File path: {path}\n\
         File content:\n\
         ---\n\
         {content}\n\
         ---\n"
    )
}
