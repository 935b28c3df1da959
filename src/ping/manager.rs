//! Coordination for the ping engines: waits for the first config and
//! resolution, starts one engine per address family, then feeds both
//! with interval and target updates.

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{PingEngine, Sample, SAMPLE_BUFFER};
use crate::config::Config;
use crate::icmp::Family;
use crate::resolve::ResolveResult;

pub struct PingManager {
    configs: mpsc::Receiver<Config>,
    resolutions: mpsc::Receiver<ResolveResult>,
    samples: mpsc::Sender<Sample>,
}

impl PingManager {
    pub fn new(
        configs: mpsc::Receiver<Config>,
        resolutions: mpsc::Receiver<ResolveResult>,
    ) -> (Self, mpsc::Receiver<Sample>) {
        let (tx, rx) = mpsc::channel(SAMPLE_BUFFER);
        (
            Self {
                configs,
                resolutions,
                samples: tx,
            },
            rx,
        )
    }

    /// Run until cancelled. Fatal only when no engine can start at all.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        // Nothing to probe before the first config and resolution.
        let cfg = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            maybe = self.configs.recv() => match maybe {
                Some(cfg) => cfg,
                None => return Ok(()),
            },
        };
        let first = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            maybe = self.resolutions.recv() => match maybe {
                Some(result) => result,
                None => return Ok(()),
            },
        };

        let mut engines = Vec::new();
        for family in [Family::V4, Family::V6] {
            match PingEngine::start(
                family,
                cfg.ping_interval,
                self.samples.clone(),
                cancel.child_token(),
            ) {
                Ok(engine) => engines.push(engine),
                // A host may simply not have this family, or lack the
                // capability; the other engine can still run.
                Err(err) => warn!(?family, error = %err, "could not start ping engine"),
            }
        }
        if engines.is_empty() {
            bail!("no ping engine could be started");
        }
        for engine in &engines {
            engine.update_targets(&first);
        }
        info!(
            engines = engines.len(),
            targets = first.items.len(),
            "ping engines running"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = self.configs.recv() => match maybe {
                    Some(cfg) => {
                        for engine in &engines {
                            engine.set_interval(cfg.ping_interval);
                        }
                    }
                    None => break,
                },
                maybe = self.resolutions.recv() => match maybe {
                    Some(result) => {
                        for engine in &engines {
                            engine.update_targets(&result);
                        }
                    }
                    None => break,
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn exits_on_cancel_before_first_config() {
        let (_cfg_tx, cfg_rx) = mpsc::channel(1);
        let (_res_tx, res_rx) = mpsc::channel(1);
        let (manager, _samples) = PingManager::new(cfg_rx, res_rx);

        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_millis(10), manager.run(cancel))
            .await
            .expect("manager should exit promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn exits_when_config_channel_closes() {
        let (cfg_tx, cfg_rx) = mpsc::channel::<Config>(1);
        let (_res_tx, res_rx) = mpsc::channel(1);
        let (manager, _samples) = PingManager::new(cfg_rx, res_rx);

        drop(cfg_tx);

        tokio::time::timeout(Duration::from_millis(10), manager.run(CancellationToken::new()))
            .await
            .expect("manager should exit promptly")
            .unwrap();
    }
}
