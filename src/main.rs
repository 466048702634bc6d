use std::sync::Arc;

use anyhow::Context;
use durable_fanout::activities::activity_registry;
use durable_fanout::config::HostConfig;
use durable_fanout::logging::init_logging;
use durable_fanout::orchestrations::orchestration_registry;
use durable_fanout::providers::fs::FsProvider;
use durable_fanout::providers::in_memory::InMemoryProvider;
use durable_fanout::providers::Provider;
use durable_fanout::server::{self, AppState};
use durable_fanout::{Client, Runtime, RuntimeOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HostConfig::from_env();
    init_logging(&config.logging).map_err(anyhow::Error::msg)?;
    for warning in &config.warnings {
        tracing::warn!(%warning, "ignoring configuration value");
    }

    let store: Arc<dyn Provider> = match &config.data_dir {
        Some(dir) => Arc::new(
            FsProvider::open(dir)
                .await
                .with_context(|| format!("opening data directory {}", dir.display()))?,
        ),
        None => Arc::new(InMemoryProvider::new()),
    };

    let options = RuntimeOptions {
        activity_timeout: config.activity_timeout,
        ..RuntimeOptions::default()
    };
    let rt = Runtime::start_with_options(
        store.clone(),
        activity_registry(config.activity),
        orchestration_registry(config.max_parallelism),
        options,
    )
    .await;

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    let state = Arc::new(AppState::new(Client::new(store)));

    tokio::select! {
        res = server::serve(listener, state) => res.context("server error")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    rt.shutdown().await;
    Ok(())
}
