use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use tokio::sync::watch;
use tracing::{info, warn};

use babel_config::AppConfig;
use babel_index::VectorIndex;
use babel_runtime::{Scheduler, build_engine, build_services};

use crate::{Overrides, load_config};

const LOCK_FILE_NAME: &str = "babel-agent.lock";

pub(crate) fn lock_path(vault_root: &Path) -> PathBuf {
    vault_root.join(".git").join(LOCK_FILE_NAME)
}

/// Hold an exclusive lock inside the vault's `.git` so two agents never
/// reconcile the same working copy.  The lock lives as long as the file.
pub(crate) fn acquire_lock(vault_root: &Path) -> Result<File> {
    let path = lock_path(vault_root);
    let file = File::create(&path)
        .with_context(|| format!("cannot create lock file {}", path.display()))?;
    file.try_lock_exclusive()
        .map_err(|_| anyhow!("another babel-agent already holds the lock at {}", path.display()))?;
    Ok(file)
}

fn log_banner(config: &AppConfig) {
    let os_user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    info!(
        agent = %config.agent.name,
        vault = %config.vault_root().display(),
        remote = %config.repository.remote,
        tick_secs = config.agent.tick_secs,
        os_user = %os_user,
        ssh_agent = std::env::var_os("SSH_AUTH_SOCK").is_some(),
        sync = config.tools.sync_enabled,
        normalize = config.tools.normalize_enabled,
        enrich = config.tools.enrich_enabled,
        "babel-agent starting"
    );
}

async fn probe_index(config: &AppConfig) -> Result<()> {
    let Some(services) = build_services(config)? else {
        return Ok(());
    };
    match services.index.ready().await {
        Ok(()) => info!(index = services.index.name(), "vector index ready"),
        Err(err) => warn!(
            ?err,
            index = services.index.name(),
            "vector index not ready; enrichment will retry each tick"
        ),
    }
    Ok(())
}

/// Run the scheduler until SIGINT or SIGTERM.  SIGHUP reloads the
/// configuration file; a snapshot that does not validate is ignored.
pub(crate) async fn run_agent(
    config_path: PathBuf,
    overrides: Overrides,
    config: AppConfig,
) -> Result<()> {
    let _lock = acquire_lock(&config.vault_root())?;
    log_banner(&config);
    probe_index(&config).await?;

    let signals = Signals::install()?;
    let (config_tx, config_rx) = watch::channel(Arc::new(config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(signals.forward(config_path, overrides, config_tx, shutdown_tx));

    let scheduler = Scheduler::new(config_rx, shutdown_rx, |snapshot: &AppConfig| {
        build_engine(snapshot, build_services(snapshot)?)
    });
    scheduler.run().await?;

    info!("babel-agent stopped");
    Ok(())
}

#[cfg(unix)]
struct Signals {
    hangup: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    async fn forward(
        mut self,
        config_path: PathBuf,
        overrides: Overrides,
        config_tx: watch::Sender<Arc<AppConfig>>,
        shutdown_tx: watch::Sender<bool>,
    ) {
        loop {
            tokio::select! {
                _ = self.hangup.recv() => match load_config(&config_path, &overrides) {
                    Ok(next) => {
                        info!(path = %config_path.display(), "SIGHUP: configuration reloaded");
                        config_tx.send_replace(Arc::new(next));
                    }
                    Err(err) => {
                        warn!(?err, "SIGHUP: configuration rejected; keeping the current one")
                    }
                },
                _ = self.terminate.recv() => break,
                _ = self.interrupt.recv() => break,
            }
        }
        info!("shutdown requested; the current tick will finish first");
        shutdown_tx.send_replace(true);
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn forward(
        self,
        _config_path: PathBuf,
        _overrides: Overrides,
        _config_tx: watch::Sender<Arc<AppConfig>>,
        shutdown_tx: watch::Sender<bool>,
    ) {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(?err, "cannot listen for ctrl-c");
            return;
        }
        info!("shutdown requested; the current tick will finish first");
        shutdown_tx.send_replace(true);
    }
}
