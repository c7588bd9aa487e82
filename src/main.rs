use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seatguard::{
    booking::BookingFinalizer,
    config::Config,
    controllers,
    database::Database,
    engine::ReservationEngine,
    lock::DistributedLock,
    notify::NotificationHub,
    queue::{request_status::RequestStatusStore, worker::QueueWorker, PriorityQueue},
    redis_client::RedisClient,
    sweeper::ExpirationSweeper,
    AppState,
};

/// Exit codes per the CLI runner contract: 0 normal shutdown, 1 fatal
/// startup error, 2 config error.
#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.app.rust_log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal startup error");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("starting seatguard");

    let db = Database::new(&config.database.url, config.database.pool_size).await?;
    info!("database connected");

    db.run_migrations().await?;

    let redis = RedisClient::new(&config.redis.url).await?;
    info!("redis connected");

    let lock = DistributedLock::new(redis.clone(), config.lock.clone());
    let engine = ReservationEngine::new(
        db.pool.clone(),
        lock.clone(),
        config.reservation.clone(),
        config.lock.clone(),
    );
    let queue = PriorityQueue::new(redis.clone(), config.queue.clone());
    let status_store = RequestStatusStore::new(redis.clone(), &config.queue);
    let notify = Arc::new(NotificationHub::new());
    notify.attach_redis(redis.clone());
    tokio::spawn(notify.clone().run_redis_bridge(redis.clone()));
    let booking = BookingFinalizer::new(db.pool.clone(), lock.clone());

    let app_state = Arc::new(AppState {
        db: db.clone(),
        redis: redis.clone(),
        config: config.clone(),
        lock: lock.clone(),
        engine: engine.clone(),
        queue: queue.clone(),
        status_store: status_store.clone(),
        notify: notify.clone(),
        booking: booking.clone(),
    });

    let sweeper = ExpirationSweeper::new(db.pool.clone(), lock.clone(), config.sweeper.clone());
    tokio::spawn(sweeper.run_forever());

    let new_worker = || {
        QueueWorker::new(
            "worker-1".to_string(),
            db.pool.clone(),
            queue.clone(),
            status_store.clone(),
            engine.clone(),
            notify.clone(),
        )
    };
    tokio::spawn(new_worker().run_forever());
    tokio::spawn(Arc::new(new_worker()).reclaim_forever());

    let app = Router::new()
        .route("/", get(|| async { "seatguard" }))
        .route("/health", get(|| async { "OK" }))
        .nest("/api", controllers::routes())
        .with_state(app_state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.port));
    info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM so a deliberate shutdown exits 0 rather
/// than being torn down by an uncaught signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
