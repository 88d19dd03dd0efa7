use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pull_integrator::config::EngineConfig;
use pull_integrator::git::workspace::cleanup_stale_workspaces;
use pull_integrator::persistence::JsonFileStore;
use pull_integrator::policy::{Services, StaticPolicy};
use pull_integrator::pull::Engine;
use pull_integrator::trigger::{DEFAULT_CHANNEL_CAPACITY, Dispatcher, Trigger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pull_integrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();

    let policy = match &config.policy_file {
        Some(path) => StaticPolicy::load(path)
            .with_context(|| format!("loading policy from {}", path.display()))?,
        None => {
            tracing::warn!("no policy file configured, every user has read access only");
            StaticPolicy::new()
        }
    };
    let store = JsonFileStore::open(&config.state_file)
        .with_context(|| format!("opening store at {}", config.state_file.display()))?;

    match cleanup_stale_workspaces(&config.git) {
        Ok(removed) if !removed.is_empty() => {
            tracing::info!(count = removed.len(), "removed stale workspaces");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "failed to clean up stale workspaces"),
    }

    let services = Services::uniform(Arc::new(policy));
    let engine = Arc::new(Engine::new(config, Arc::new(store), services)?);

    let shutdown = CancellationToken::new();
    // The daemon has no event source of its own: it sweeps once at startup
    // and then on the dispatcher's interval. `tx` is held until shutdown so
    // the channel stays open.
    let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    tx.send(Trigger::Sweep)
        .await
        .context("queueing startup sweep")?;
    let dispatcher = Dispatcher::new(engine, shutdown.clone());
    let running = tokio::spawn(dispatcher.run(rx));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutting down");
    shutdown.cancel();
    drop(tx);
    running.await.context("dispatcher task failed")?;
    Ok(())
}
