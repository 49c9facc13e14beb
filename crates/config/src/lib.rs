use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Top-level vault sections that are eligible for enrichment.
pub const DEFAULT_SECTIONS: &[&str] = &["0-INBOX", "AREAS", "PROJECTS", "RESOURCES", "A-ARCHIVES"];

/// Names that are never enriched or renamed, wherever they appear in a path.
pub const DEFAULT_RESERVED_NAMES: &[&str] = &[
    ".git",
    "metadata",
    "metadata_index",
    "0-description",
    "0-babel",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Seconds between two reconciliation ticks.
    pub tick_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "babel-agent".to_string(),
            tick_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Root of the vault working copy.
    pub path: String,
    /// Commit message used for every published tick.
    pub message: String,
    pub remote: String,
    /// Branch to pull and push.  Empty means "whatever HEAD points at".
    pub branch: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: ".".to_string(),
            message: "Babel update".to_string(),
            remote: "origin".to_string(),
            branch: String::new(),
        }
    }
}

/// Commit author identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Private key file.  Empty falls back to the ssh-agent.
    pub key_path: String,
    /// Overridden by `BABEL_SSH_PASSPHRASE` when set.
    pub passphrase: String,
    /// Transport user for ssh remotes (`git@host:...`).
    pub username: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key_path: String::new(),
            passphrase: String::new(),
            username: "git".to_string(),
        }
    }
}

// ── LLM config ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// `openai`, `openrouter` or `ollama`.
    pub provider: String,
    pub model: String,
    /// Empty selects the provider's public endpoint.
    pub base_url: String,
    /// Overridden by `OPENAI_API_KEY` / `OPENROUTER_API_KEY` depending on
    /// the provider.
    pub api_key: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: String::new(),
            api_key: String::new(),
            timeout_secs: 60,
        }
    }
}

// ── Vector index config ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// `weaviate` or `memory`.
    pub backend: String,
    pub url: String,
    /// Weaviate class holding one object per enriched file.
    pub class_name: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: "weaviate".to_string(),
            url: "http://localhost:8080".to_string(),
            class_name: "Babel".to_string(),
            api_key: String::new(),
            timeout_secs: 30,
        }
    }
}

// ── Tools config ─────────────────────────────────────────────────────────────

/// Per-capability switches.  All default to off so that a fresh config does
/// nothing until explicitly enabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Pull, reconcile and publish on every tick.
    pub sync_enabled: bool,
    /// Fold file names to their canonical form before enrichment.
    pub normalize_enabled: bool,
    /// Generate metadata and mirror it to the vector index.
    pub enrich_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub sections: Vec<String>,
    pub reserved_names: Vec<String>,
    /// Directory (relative to the vault root) holding the sidecar mirror.
    pub metadata_dir: String,
    /// File content beyond this many bytes is not sent to the LLM.
    pub max_content_bytes: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            sections: DEFAULT_SECTIONS.iter().map(|s| s.to_string()).collect(),
            reserved_names: DEFAULT_RESERVED_NAMES.iter().map(|s| s.to_string()).collect(),
            metadata_dir: "metadata".to_string(),
            max_content_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// When non-empty, logs go to a daily rolling file here instead of stderr.
    pub log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub repository: RepositoryConfig,
    pub user: UserConfig,
    pub ssh: SshConfig,
    pub llm: LlmConfig,
    pub index: IndexConfig,
    pub tools: ToolsConfig,
    pub vault: VaultConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env();
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Environment variables take precedence over the file.
    fn apply_env(&mut self) {
        let key_var = if self.llm.provider.eq_ignore_ascii_case("openrouter") {
            "OPENROUTER_API_KEY"
        } else {
            "OPENAI_API_KEY"
        };
        if let Some(key) = non_empty_env(key_var) {
            self.llm.api_key = key;
        }

        if let Some(url) = non_empty_env("OLLAMA_BASE_URL") {
            if self.llm.provider.eq_ignore_ascii_case("ollama") {
                self.llm.base_url = url;
            }
        }

        if let Some(url) = non_empty_env("WEAVIATE_URL") {
            self.index.url = url;
        }

        if let Some(passphrase) = non_empty_env("BABEL_SSH_PASSPHRASE") {
            self.ssh.passphrase = passphrase;
        }
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.agent.tick_secs == 0 {
            bail!("agent.tick_secs must be greater than zero");
        }
        if self.repository.path.trim().is_empty() {
            bail!("repository.path is required");
        }
        if self.repository.message.trim().is_empty() {
            bail!("repository.message is required");
        }
        if self.user.username.trim().is_empty() || self.user.email.trim().is_empty() {
            bail!("user.username and user.email are required");
        }
        if self.vault.sections.is_empty() {
            bail!("vault.sections must list at least one top-level section");
        }
        if self.vault.metadata_dir.trim().is_empty() {
            bail!("vault.metadata_dir is required");
        }
        if self.tools.enrich_enabled {
            let provider = self.llm.provider.to_ascii_lowercase();
            if !matches!(provider.as_str(), "openai" | "openrouter" | "ollama") {
                bail!("unknown llm.provider '{}'", self.llm.provider);
            }
            if provider != "ollama" && self.llm.api_key.trim().is_empty() {
                bail!("llm.api_key is required for provider '{provider}'");
            }
            let backend = self.index.backend.to_ascii_lowercase();
            if !matches!(backend.as_str(), "weaviate" | "memory") {
                bail!("unknown index.backend '{}'", self.index.backend);
            }
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.agent.tick_secs)
    }

    pub fn vault_root(&self) -> PathBuf {
        PathBuf::from(&self.repository.path)
    }

    pub fn metadata_root(&self) -> PathBuf {
        self.vault_root().join(&self.vault.metadata_dir)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

// ── Tests ────────────────────────────────────────────────────────────────────
