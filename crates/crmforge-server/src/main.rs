//! crmforge host process
//!
//! Starts the reload engine over the configured manifest and module tree,
//! logs every engine event, and stops cleanly on Ctrl+C / SIGTERM.
//!
//! Usage:
//!   crmforge-server [payload.json ...]
//!
//! Each argument is a generation payload (`{config, files}`) scaffolded into
//! a module once the engine is running.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use crmforge_plugin::{
    EngineConfig, EngineEvent, ManifestStore, ModulePayload, ModuleScaffolder, ReloadEngine,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::from_env();
    tracing::info!(
        base_dir = %config.base_dir.display(),
        manifest = %config.manifest_path.display(),
        modules_dir = %config.modules_dir.display(),
        "loading configuration"
    );

    let store = Arc::new(ManifestStore::new(&config.manifest_path));
    let engine = ReloadEngine::new(config.clone(), Arc::clone(&store));
    let scaffolder = ModuleScaffolder::new(config, store);

    let logger = tokio::spawn(log_events(engine.subscribe()));

    engine
        .start()
        .await
        .context("failed to start reload engine")?;

    for arg in std::env::args().skip(1) {
        if let Err(e) = scaffold_from_file(&scaffolder, Path::new(&arg)).await {
            tracing::error!(payload = %arg, "scaffolding failed: {e:#}");
        }
    }

    let status = engine.status();
    tracing::info!(
        plugins = status.plugin_count,
        watchers = status.watcher_count,
        "watching for changes"
    );

    shutdown_signal().await;

    engine.stop().await;
    logger.abort();
    tracing::info!("shutdown complete");
    Ok(())
}

async fn scaffold_from_file(scaffolder: &ModuleScaffolder, path: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    let payload: ModulePayload =
        serde_json::from_str(&raw).with_context(|| format!("invalid payload {}", path.display()))?;

    let module = scaffolder.create_module(payload).await?;
    tracing::info!(
        slug = %module.config.slug,
        files = module.files.len(),
        "module scaffolded from payload file"
    );
    Ok(())
}

async fn log_events(mut rx: tokio::sync::broadcast::Receiver<EngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(event = event.name(), "{json}"),
                Err(e) => tracing::warn!(event = event.name(), "unserializable event: {e}"),
            },
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event logger fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = until_signal(tokio::signal::ctrl_c(), "Ctrl+C");

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

/// Resolve when `listener` reports a signal. A listener that fails to install
/// never resolves, so the failure cannot be mistaken for a shutdown request.
async fn until_signal<F>(listener: F, name: &str)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    if let Err(e) = listener.await {
        tracing::error!("failed to listen for {name}: {e}");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // ── Signal listeners ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_until_signal_resolves_on_signal() {
        let fired = tokio::time::timeout(
            Duration::from_millis(200),
            until_signal(async { Ok(()) }, "test signal"),
        )
        .await;
        assert!(fired.is_ok());
    }

    #[tokio::test]
    async fn test_until_signal_waits_when_listener_fails() {
        let failed = until_signal(
            async { Err(std::io::Error::other("no signal driver")) },
            "test signal",
        );
        let outcome = tokio::time::timeout(Duration::from_millis(50), failed).await;
        assert!(outcome.is_err(), "a failed listener must not trigger shutdown");
    }
}
