//! Tern server entry point.

mod http;
mod objects;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tern_common::Config;
use tern_common::config::LoggingConfig;
use tern_queue::{
    DeliveryExecutor, Federator, FsJobStore, JobRunner, JobStore, Notifier, RetryConfig,
    RetryScheduler, ServerState, SweepLoop, WorkItem, WorkQueue, WorkerPool,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::http::{AppState, HttpConnectionHandler, router};
use crate::objects::FsObjectStore;

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tern=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Accept connections until cancelled, handing each one to the workers
/// ahead of any queued job.
async fn accept_loop(listener: TcpListener, queue: Arc<WorkQueue>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    queue.post(WorkItem::Connection(stream, peer), true).await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    info!("Stopped accepting connections");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting tern server...");

    // Durable storage
    let base_dir = &config.storage.base_dir;
    let store = Arc::new(
        FsJobStore::open(base_dir)
            .await
            .context("Failed to open job store")?,
    );
    store
        .recover()
        .await
        .context("Failed to recover claimed jobs")?;

    // Runtime state and dispatch
    let state = Arc::new(ServerState::new(config.queue.worker_count()));
    let queue = Arc::new(WorkQueue::new(state.clone()));

    // Job execution
    let user_agent = format!(
        "tern/{} (+{})",
        env!("CARGO_PKG_VERSION"),
        config.server.url
    );
    let executor = DeliveryExecutor::new(&config.queue, &user_agent)?;
    let objects = Arc::new(
        FsObjectStore::open(base_dir, config.server.url.clone())
            .await
            .context("Failed to open object cache")?
            .with_fetcher(Arc::new(executor.clone())),
    );
    let notifier = Notifier::new(&config.notify, executor.client().clone())?;
    let retry = RetryScheduler::new(
        store.clone(),
        RetryConfig::from(&config.queue),
        state.clone(),
    );
    let runner = Arc::new(JobRunner::new(
        store.clone(),
        executor,
        notifier,
        objects.clone(),
        retry,
        state.clone(),
    ));

    // HTTP surface
    let app = router(AppState {
        federator: Federator::new(store.clone(), objects),
        state: state.clone(),
    });
    let connections = Arc::new(HttpConnectionHandler::new(
        app,
        config.queue.request_timeout(),
    ));

    let pool = WorkerPool::spawn(queue.clone(), runner, connections, state.clone());

    let cancel = CancellationToken::new();
    let sweep = tokio::spawn(
        SweepLoop::new(store, queue.clone(), state.clone(), &config.queue).run(cancel.clone()),
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr, workers = pool.len(), "Listening");

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    accept_loop(listener, queue, cancel).await;

    state.stop();
    if let Err(e) = sweep.await {
        error!(error = %e, "Sweep loop task failed");
    }
    pool.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
