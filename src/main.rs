use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::Args;
use netmon::config::Config;
use netmon::metrics;
use netmon::ping::PingManager;
use netmon::resolve::{DnsResolver, ResolverService};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let first = Config::load(&args.config)
        .with_context(|| format!("could not load config {}", args.config))?;

    let cancel = CancellationToken::new();

    // Config snapshots fan out to the resolver and the ping engines;
    // resolutions flow from the resolver into the engines; samples flow
    // out to the sink. Strictly acyclic plumbing.
    let (cfg_tx, cfg_rx) = mpsc::channel::<Config>(1);
    let (resolver_cfg_tx, resolver_cfg_rx) = mpsc::channel(1);
    let (ping_cfg_tx, ping_cfg_rx) = mpsc::channel(1);
    cfg_tx.send(first).await.expect("channel just created");

    tokio::spawn(fan_out_configs(
        cfg_rx,
        resolver_cfg_tx,
        ping_cfg_tx,
        cancel.clone(),
    ));
    tokio::spawn(handle_signals(
        args.config.clone(),
        cfg_tx,
        cancel.clone(),
    ));

    let resolver = DnsResolver::new(args.family_filter(), cancel.clone());
    let (service, resolutions) = ResolverService::new(resolver_cfg_rx, resolver);
    let resolver_task = tokio::spawn(service.run(cancel.clone()));

    let (manager, samples) = PingManager::new(ping_cfg_rx, resolutions);
    let manager_task = tokio::spawn(manager.run(cancel.clone()));

    let sink_task = tokio::spawn(metrics::run_sink(samples, cancel.clone()));

    info!("running...");

    // The manager returns on cancellation or a fatal start-up error;
    // either way everything else gets torn down behind it.
    let outcome = match manager_task.await {
        Ok(result) => result,
        Err(err) => Err(anyhow::anyhow!("ping manager panicked: {err}")),
    };
    if let Err(err) = &outcome {
        error!(error = %err, "ping manager failed");
    }
    cancel.cancel();

    let _ = resolver_task.await;
    let _ = sink_task.await;
    info!("shutdown complete");
    outcome
}

/// Duplicate every config snapshot to each consumer, in arrival order.
async fn fan_out_configs(
    mut configs: mpsc::Receiver<Config>,
    resolver: mpsc::Sender<Config>,
    ping: mpsc::Sender<Config>,
    cancel: CancellationToken,
) {
    loop {
        let cfg = tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = configs.recv() => match maybe {
                Some(cfg) => cfg,
                None => return,
            },
        };
        if resolver.send(cfg.clone()).await.is_err() || ping.send(cfg).await.is_err() {
            return;
        }
    }
}

/// Interrupt or terminate tears the process down; hangup reloads the
/// config file and pushes a fresh snapshot downstream.
async fn handle_signals(
    config_path: String,
    configs: mpsc::Sender<Config>,
    cancel: CancellationToken,
) {
    let (mut sigint, mut sigterm, mut sighup) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(int), Ok(term), Ok(hup)) => (int, term, hup),
        _ => {
            error!("could not install signal handlers");
            cancel.cancel();
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sigint.recv() => {
                info!("interrupted, stopping...");
                break;
            }
            _ = sigterm.recv() => {
                info!("terminated, stopping...");
                break;
            }
            _ = sighup.recv() => {
                info!("hangup received, reloading config...");
                match Config::load(&config_path) {
                    // The previous config stays in force on a bad reload.
                    Err(err) => warn!(error = %err, "failed to reload config"),
                    Ok(cfg) => {
                        if configs.send(cfg).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    cancel.cancel();
}
