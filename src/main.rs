use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use previewd::config::Config;
use previewd::driver::LoggingDriver;
use previewd::events::DesiredStateSource;
use previewd::gc::GarbageCollector;
use previewd::identity::IdentityResolver;
use previewd::promotion::PromotionCoordinator;
use previewd::reconcile::{ReconcileDispatcher, ReconcileEngine};
use previewd::routing::RoutingAllocator;
use previewd::server::{build_router, AppState};
use previewd::store::{load_snapshot, save_snapshot_atomic, snapshot::SNAPSHOT_FILE, StateStore};

/// How often the state snapshot is persisted.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "previewd=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let snapshot_path = config.store.state_dir.join(SNAPSHOT_FILE);

    // Recover the store and the routing pool from the last snapshot.
    let store = match load_snapshot(&snapshot_path) {
        Ok(Some(snapshot)) => {
            info!(path = %snapshot_path.display(), environments = snapshot.environments.len(), "Recovered state snapshot");
            Arc::new(StateStore::from_snapshot(snapshot))
        }
        Ok(None) => {
            info!(path = %snapshot_path.display(), "No snapshot found, starting fresh");
            Arc::new(StateStore::new())
        }
        Err(e) => {
            error!(path = %snapshot_path.display(), error = %e, "Failed to load state snapshot");
            std::process::exit(1);
        }
    };
    let allocator = Arc::new(RoutingAllocator::recover(
        config.routing.clone(),
        store.held_routing_keys(),
    ));
    let resolver = IdentityResolver::new(config.naming.clone());

    // Real substrate drivers plug in through the InfrastructureDriver
    // trait; the logging driver makes a bare invocation a safe dry run.
    let driver = Arc::new(LoggingDriver);
    let engine = Arc::new(ReconcileEngine::new(
        Arc::clone(&store),
        Arc::clone(&allocator),
        driver,
        resolver.clone(),
        config.reconcile.clone(),
        config.gc.retain_log_sinks,
    ));
    let dispatcher = Arc::new(ReconcileDispatcher::new(engine, &config.reconcile));

    let (source, mut triggers) = DesiredStateSource::new(Arc::clone(&store), resolver);
    let source = Arc::new(source);
    let promotions = Arc::new(PromotionCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&source),
        config.promotion.clone(),
    ));

    let cancel = CancellationToken::new();

    // Forward intake triggers to the reconcile workers.
    let trigger_pump = {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    id = triggers.recv() => match id {
                        Some(id) => dispatcher.notify(&id),
                        None => break,
                    },
                }
            }
        })
    };

    // Resume whatever the last process left unconverged.
    let unconverged: Vec<_> = store
        .list()
        .into_iter()
        .filter(|env| !env.is_terminal() && !env.is_converged())
        .map(|env| env.id)
        .collect();
    if !unconverged.is_empty() {
        info!(count = unconverged.len(), "Resuming unconverged environments");
        dispatcher.notify_all(unconverged);
    }

    let gc_task = {
        let gc = GarbageCollector::new(
            Arc::clone(&store),
            Arc::clone(&source),
            config.gc.clone(),
        );
        tokio::spawn(gc.run(cancel.clone()))
    };

    let promotion_watcher = tokio::spawn(Arc::clone(&promotions).run(cancel.clone()));

    let snapshot_task = {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        let path = snapshot_path.clone();
        let retention = config.store.destroyed_retention;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        store.prune_destroyed(retention);
                        if let Err(e) = save_snapshot_atomic(&path, &store.to_snapshot()) {
                            warn!(error = %e, "Snapshot write failed");
                        }
                    }
                }
            }
        })
    };

    let app = build_router(AppState::new(
        Arc::clone(&store),
        Arc::clone(&source),
        promotions,
        config.server.event_secret.clone().map(String::into_bytes),
    ));

    info!(addr = %config.server.bind_addr, "Listening");
    let listener = match tokio::net::TcpListener::bind(config.server.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.server.bind_addr, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };

    let serve_cancel = cancel.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = serve_cancel.cancelled() => {}
                _ = shutdown_signal() => {}
            }
        })
        .await;
    if let Err(e) = result {
        error!(error = %e, "Server error");
    }

    info!("Shutting down");
    cancel.cancel();
    dispatcher.shutdown().await;
    let _ = trigger_pump.await;
    let _ = gc_task.await;
    let _ = promotion_watcher.await;
    let _ = snapshot_task.await;

    // Final snapshot so a restart resumes exactly where we stopped.
    if let Err(e) = save_snapshot_atomic(&snapshot_path, &store.to_snapshot()) {
        error!(error = %e, "Final snapshot write failed");
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
    }
}
