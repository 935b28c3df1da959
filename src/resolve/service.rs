//! The periodic resolution service: takes config snapshots in, emits a
//! [`ResolveResult`] per cycle, carrying last-good answers across
//! transient failures.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Resolution, ResolveResult, Resolver};
use crate::config::{Config, Target};

/// Buffered capacity of the resolution output channel.
const RESULT_BUFFER: usize = 100;

pub struct ResolverService<R> {
    configs: mpsc::Receiver<Config>,
    resolver: R,
    results: mpsc::Sender<ResolveResult>,
}

impl<R: Resolver> ResolverService<R> {
    pub fn new(
        configs: mpsc::Receiver<Config>,
        resolver: R,
    ) -> (Self, mpsc::Receiver<ResolveResult>) {
        let (tx, rx) = mpsc::channel(RESULT_BUFFER);
        (
            Self {
                configs,
                resolver,
                results: tx,
            },
            rx,
        )
    }

    /// Run until cancelled. The output channel closes when this returns.
    pub async fn run(mut self, cancel: CancellationToken) {
        // Nothing to do until the first config shows up.
        let mut cfg = tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = self.configs.recv() => match maybe {
                Some(cfg) => cfg,
                None => return,
            },
        };

        // Force the first resolution essentially immediately.
        let timer = tokio::time::sleep(Duration::from_millis(1));
        tokio::pin!(timer);

        let mut cache: HashMap<Target, Vec<IpAddr>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = self.configs.recv() => match maybe {
                    Some(new_cfg) => cfg = new_cfg,
                    None => break,
                },
                () = &mut timer => {}
            }
            timer
                .as_mut()
                .reset(tokio::time::Instant::now() + cfg.resolve_interval);

            // If we cannot resolve everything quickly relative to the
            // interval, there was no point in trying to resolve it all.
            let deadline = cfg.resolve_interval / 2;
            let resolved = self.resolve_all(&cfg.targets, deadline).await;

            let mut result = ResolveResult::default();
            let mut new_cache = HashMap::with_capacity(resolved.len());
            for (target, outcome) in resolved {
                let addrs = match outcome {
                    Ok(addrs) => {
                        debug!(%target, ?addrs, "resolved");
                        addrs
                    }
                    Err(err) => {
                        warn!(%target, error = %err, "failed to resolve, keeping previous addresses");
                        cache.get(&target).cloned().unwrap_or_default()
                    }
                };
                if !addrs.is_empty() {
                    result.items.push(Resolution {
                        target: target.clone(),
                        addrs: addrs.clone(),
                    });
                }
                new_cache.insert(target, addrs);
            }
            cache = new_cache;

            // A caller could forever avoid reading the result, and not
            // reading it out in a timely manner is not okay; time the
            // write out rather than stalling resolution.
            tokio::select! {
                sent = self.results.send(result) => {
                    if sent.is_err() {
                        // Consumer went away entirely.
                        break;
                    }
                }
                _ = tokio::time::sleep(cfg.resolve_interval / 4) => {
                    warn!(
                        timeout = ?(cfg.resolve_interval / 4),
                        "timed out writing resolve result, reader hung?"
                    );
                }
                _ = cancel.cancelled() => {
                    // Handled at the top of the loop.
                }
            }
        }
    }

    /// Resolve every target concurrently, each bounded by `deadline`.
    async fn resolve_all(
        &self,
        targets: &[Target],
        deadline: Duration,
    ) -> Vec<(Target, anyhow::Result<Vec<IpAddr>>)> {
        let lookups = targets.iter().map(|target| async move {
            let outcome = match tokio::time::timeout(deadline, self.resolver.resolve(target)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow::anyhow!("resolution deadline {deadline:?} exceeded")),
            };
            (target.clone(), outcome)
        });
        join_all(lookups).await
    }
}
