//! tickd entry point: the composition root.
//!
//! Everything process-wide (clock, store pool, lock client, dispatcher,
//! runner) is constructed here once and passed down as explicit handles.

use anyhow::Context as _;
use std::sync::Arc;

use tickd::api::{self, ApiState};
use tickd::clock::{Clock, SystemClock};
use tickd::config::Config;
use tickd::dispatcher::Dispatcher;
use tickd::lock::{LockService, RedisLockService};
use tickd::recovery;
use tickd::runner::{ExecutedAtWorkload, Runner};
use tickd::store::TaskStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    init_tracing(&config.log_level);

    let store = TaskStore::connect(&config.db_url)
        .await
        .context("failed to open task store")?;
    store
        .init_schema()
        .await
        .context("failed to initialize store schema")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let lock: Arc<dyn LockService> = Arc::new(
        RedisLockService::connect(&config.redis_url, clock.clone())
            .await
            .context("failed to connect to lock coordinator")?,
    );

    let dispatcher = Dispatcher::new(clock.clone());
    let runner = Runner::new(
        store.clone(),
        lock,
        clock.clone(),
        dispatcher.clone(),
        Arc::new(ExecutedAtWorkload),
    );
    dispatcher.set_runner(runner);

    // Rebuild the schedule before accepting admin traffic.
    recovery::recover(
        &store,
        &dispatcher,
        clock.as_ref(),
        config.recover_past_tasks,
    )
    .await
    .context("failed to recover scheduled tasks")?;

    let state = Arc::new(ApiState {
        store,
        dispatcher: dispatcher.clone(),
        clock,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (_addr, server) = api::start_http_server(config.bind_addr, state, shutdown_rx)
        .await
        .context("failed to start HTTP server")?;

    tracing::info!("tickd ready");

    shutdown_signal().await?;
    tracing::info!("shutting down");

    let _ = shutdown_tx.send(true);
    dispatcher.shutdown().await;
    let _ = server.await;

    Ok(())
}

fn init_tracing(directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(directive)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    Ok(())
}
