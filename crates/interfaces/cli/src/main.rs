mod daemon;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use babel_config::{AppConfig, TelemetryConfig};
use babel_git::Credentials;
use babel_index::VectorIndex;
use babel_runtime::{
    FilenameNormalizer, PathClassifier, build_engine, build_services, open_repository,
};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Parser)]
#[command(
    name = "babel-agent",
    version,
    about = "Keeps a git vault in sync, normalizes file names and enriches changed files with metadata"
)]
struct Cli {
    /// TOML configuration file; missing means defaults.
    #[arg(long, short = 'c', global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile on every tick until SIGINT/SIGTERM (default).
    Run,
    /// Run a single reconciliation and exit.
    Once,
    /// Rename every eligible file in the vault to its canonical name.
    Normalize,
    /// Validate the configuration, open the repository and probe the index.
    Check,
    /// Write a configuration file with the defaults and any command-line
    /// values to `--config`.
    Init {
        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },
}

/// Command-line values that take precedence over the configuration file.
#[derive(Debug, Clone, Default, Args)]
struct Overrides {
    /// Seconds between ticks.
    #[arg(long, global = true)]
    tick: Option<u64>,
    /// Path of the vault working copy.
    #[arg(long, global = true)]
    repo: Option<String>,
    /// Commit author name.
    #[arg(long, global = true)]
    user: Option<String>,
    /// Commit author email.
    #[arg(long, global = true)]
    email: Option<String>,
    /// Commit message.
    #[arg(long, global = true)]
    message: Option<String>,
    /// SSH private key used for pull and push.
    #[arg(long = "ssh-path", global = true)]
    ssh_path: Option<String>,
    #[arg(long = "ssh-passphrase", global = true)]
    ssh_passphrase: Option<String>,
    /// API key of the completion provider.
    #[arg(long = "api-key", global = true)]
    api_key: Option<String>,
    /// Turn on pulling, committing and pushing.
    #[arg(long, global = true)]
    sync: bool,
    /// Turn on file name normalization.
    #[arg(long, global = true)]
    normalize: bool,
    /// Turn on metadata enrichment.
    #[arg(long, global = true)]
    enrich: bool,
}

impl Overrides {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(tick) = self.tick {
            config.agent.tick_secs = tick;
        }
        if let Some(repo) = &self.repo {
            config.repository.path = repo.clone();
        }
        if let Some(user) = &self.user {
            config.user.username = user.clone();
        }
        if let Some(email) = &self.email {
            config.user.email = email.clone();
        }
        if let Some(message) = &self.message {
            config.repository.message = message.clone();
        }
        if let Some(path) = &self.ssh_path {
            config.ssh.key_path = path.clone();
        }
        if let Some(passphrase) = &self.ssh_passphrase {
            config.ssh.passphrase = passphrase.clone();
        }
        if let Some(key) = &self.api_key {
            config.llm.api_key = key.clone();
        }
        config.tools.sync_enabled |= self.sync;
        config.tools.normalize_enabled |= self.normalize;
        config.tools.enrich_enabled |= self.enrich;
    }
}

/// File, then environment, then command line; the result must validate.
fn load_config(path: &Path, overrides: &Overrides) -> Result<AppConfig> {
    let mut config = AppConfig::load_from(path)
        .with_context(|| format!("cannot read configuration {}", path.display()))?;
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// `RUST_LOG` wins over `telemetry.log_level`.  With a log directory the
/// output goes to a daily file; the returned guard must outlive `main`.
fn init_tracing(telemetry: &TelemetryConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&telemetry.log_level));

    if telemetry.log_dir.trim().is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    }

    fs::create_dir_all(&telemetry.log_dir)
        .with_context(|| format!("cannot create log directory {}", telemetry.log_dir))?;
    let appender = tracing_appender::rolling::daily(&telemetry.log_dir, "babel-agent.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);
    // The file being written need not exist or validate yet.
    if let Commands::Init { force } = command {
        return write_config(&cli.config, &cli.overrides, force);
    }

    let config = load_config(&cli.config, &cli.overrides)?;
    let _log_guard = init_tracing(&config.telemetry)?;

    match command {
        Commands::Run => daemon::run_agent(cli.config, cli.overrides, config).await,
        Commands::Once => run_once(&config).await,
        Commands::Normalize => run_normalize(&config).await,
        Commands::Check => run_check(&config).await,
        Commands::Init { .. } => Ok(()),
    }
}

fn write_config(path: &Path, overrides: &Overrides, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to replace it", path.display());
    }
    let mut config = AppConfig::default();
    overrides.apply(&mut config);
    config
        .save_to(path)
        .with_context(|| format!("cannot write configuration {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

/// One tick regardless of `tools.sync_enabled`.
async fn run_once(config: &AppConfig) -> Result<()> {
    let _lock = daemon::acquire_lock(&config.vault_root())?;
    let engine = build_engine(config, build_services(config)?)?;
    let report = engine.tick().await?;

    println!("changes   : {}", report.changes);
    println!("eligible  : {}", report.eligible);
    println!("enriched  : {}", report.enriched);
    println!("renamed   : {}", report.normalized);
    println!("deleted   : {}", report.deleted);
    println!("failed    : {}", report.failed);
    match &report.commit {
        Some(commit) => println!("commit    : {}", commit.short()),
        None => println!("commit    : none"),
    }
    Ok(())
}

async fn run_normalize(config: &AppConfig) -> Result<()> {
    let root = config.vault_root();
    let _lock = daemon::acquire_lock(&root)?;
    let classifier = PathClassifier::from_config(&config.vault);
    let normalizer = FilenameNormalizer::from_config(&config.vault);

    let renamed = normalizer.normalize_tree(&root, &classifier).await;
    for (from, to) in &renamed {
        println!("{from} -> {to}");
    }
    println!("renamed {} file(s)", renamed.len());
    Ok(())
}

async fn run_check(config: &AppConfig) -> Result<()> {
    println!("configuration : ok");

    let repository = open_repository(config)?;
    let credentials = Credentials::from_ssh(
        &config.ssh.username,
        &config.ssh.key_path,
        &config.ssh.passphrase,
    );
    println!("vault         : {}", repository.path().display());
    println!("remote        : {}", config.repository.remote);
    println!("credentials   : {}", credentials.describe());
    println!("sections      : {}", config.vault.sections.join(", "));
    println!(
        "tools         : sync={} normalize={} enrich={}",
        config.tools.sync_enabled, config.tools.normalize_enabled, config.tools.enrich_enabled
    );

    match build_services(config)? {
        Some(services) => match services.index.ready().await {
            Ok(()) => println!("index         : {} ready", services.index.name()),
            Err(err) => println!("index         : {} not ready ({err:#})", services.index.name()),
        },
        None => println!("index         : not used (enrichment disabled)"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn overrides_take_precedence_over_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");
        fs::write(
            &path,
            "[agent]\ntick_secs = 30\n[user]\nusername = \"file\"\nemail = \"file@example.com\"\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "babel-agent",
            "--config",
            path.to_str().unwrap(),
            "--tick",
            "5",
            "--user",
            "cli",
            "--enrich",
            "--api-key",
            "sk-test",
            "once",
        ]);
        let config = load_config(&cli.config, &cli.overrides).unwrap();
        assert_eq!(config.agent.tick_secs, 5);
        assert_eq!(config.user.username, "cli");
        assert_eq!(config.user.email, "file@example.com");
        assert!(config.tools.enrich_enabled);
        assert!(!config.tools.sync_enabled);
        assert!(matches!(cli.command, Some(Commands::Once)));
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cli = Cli::parse_from([
            "babel-agent",
            "--config",
            dir.path().join("missing.toml").to_str().unwrap(),
            "--tick",
            "0",
        ]);
        assert!(load_config(&cli.config, &cli.overrides).is_err());
    }

    #[test]
    fn init_writes_a_loadable_file_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config/agent.toml");
        let cli = Cli::parse_from([
            "babel-agent",
            "--config",
            path.to_str().unwrap(),
            "--user",
            "Babel",
            "--email",
            "babel@example.com",
            "--tick",
            "30",
            "init",
        ]);
        assert!(matches!(cli.command, Some(Commands::Init { force: false })));

        write_config(&cli.config, &cli.overrides, false).unwrap();
        let config = load_config(&path, &Overrides::default()).unwrap();
        assert_eq!(config.agent.tick_secs, 30);
        assert_eq!(config.user.username, "Babel");

        assert!(write_config(&path, &Overrides::default(), false).is_err());
        write_config(&path, &Overrides::default(), true).unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap().agent.tick_secs, 10);
    }

    #[test]
    fn run_is_the_default_command() {
        let cli = Cli::parse_from(["babel-agent"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }
}
