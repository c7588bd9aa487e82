pub mod booking;
pub mod config;
pub mod controllers;
pub mod database;
pub mod engine;
pub mod error;
pub mod lock;
pub mod middleware;
pub mod models;
pub mod notify;
pub mod queue;
pub mod redis_client;
pub mod sweeper;

use std::sync::Arc;

/// Shared state handed to every handler and background task.
#[derive(Clone)]
pub struct AppState {
    pub db: database::Database,
    pub redis: redis_client::RedisClient,
    pub config: config::Config,
    pub lock: lock::DistributedLock,
    pub engine: engine::ReservationEngine,
    pub queue: queue::PriorityQueue,
    pub status_store: queue::request_status::RequestStatusStore,
    pub notify: Arc<notify::NotificationHub>,
    pub booking: booking::BookingFinalizer,
}
