use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use babel_config::AppConfig;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::ReconciliationEngine;

fn tick_timer(period: Duration) -> Interval {
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    // A tick that outlives the period delays the next one instead of
    // stacking up.
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

fn period_of(config: &AppConfig) -> Duration {
    config.tick_interval().max(Duration::from_secs(1))
}

/// Drives the engine on a fixed interval, one tick at a time.
///
/// Each tick sees one immutable configuration snapshot.  A new snapshot on
/// the config channel rebuilds the engine between ticks; if the rebuild
/// fails the previous engine keeps running.  Shutdown is only observed
/// between ticks, so an in-flight tick always completes.
pub struct Scheduler<F> {
    config: watch::Receiver<Arc<AppConfig>>,
    shutdown: watch::Receiver<bool>,
    build: F,
}

impl<F> Scheduler<F>
where
    F: FnMut(&AppConfig) -> Result<ReconciliationEngine>,
{
    pub fn new(
        config: watch::Receiver<Arc<AppConfig>>,
        shutdown: watch::Receiver<bool>,
        build: F,
    ) -> Self {
        Self {
            config,
            shutdown,
            build,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut snapshot = Arc::clone(&self.config.borrow_and_update());
        let mut engine = (self.build)(&snapshot).context("cannot start the reconciliation engine")?;
        let mut period = period_of(&snapshot);
        let mut ticker = tick_timer(period);
        let mut config_open = true;
        info!(tick_secs = period.as_secs(), "scheduler started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    if !snapshot.tools.sync_enabled {
                        debug!("sync disabled; tick skipped");
                        continue;
                    }
                    match engine.tick().await {
                        Ok(report) => debug!(?report, "tick finished"),
                        Err(err) => warn!(error = %err, "tick aborted"),
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                changed = self.config.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                        continue;
                    }
                    let next = Arc::clone(&self.config.borrow_and_update());
                    match (self.build)(&next) {
                        Ok(rebuilt) => {
                            engine = rebuilt;
                            let next_period = period_of(&next);
                            if next_period != period {
                                period = next_period;
                                ticker = tick_timer(period);
                            }
                            snapshot = next;
                            info!(tick_secs = period.as_secs(), "configuration reloaded");
                        }
                        Err(err) => {
                            warn!(?err, "reloaded configuration rejected; keeping the previous one")
                        }
                    }
                }
            }
        }

        info!("scheduler stopped");
        Ok(())
    }
}
