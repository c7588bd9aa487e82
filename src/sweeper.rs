//! sweeper.rs
//!
//! Periodic scan that releases seats whose hold has timed out.
//! Runs independently of the reservation engine's request path; each
//! reservation is swept under its own seat lock so a failure on one
//! reservation never blocks the rest of the batch.

use crate::config::SweeperConfig;
use crate::lock::DistributedLock;
use chrono::Utc;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct ExpirationSweeper {
    pool: PgPool,
    lock: DistributedLock,
    config: SweeperConfig,
}

impl ExpirationSweeper {
    pub fn new(pool: PgPool, lock: DistributedLock, config: SweeperConfig) -> Self {
        Self { pool, lock, config }
    }

    /// Runs forever on `config.interval_seconds`. Spawn this as a
    /// background task from `main`, the same way the teacher spawns the
    /// payment-cleanup loop.
    pub async fn run_forever(self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_seconds));
        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(n) if n > 0 => info!(swept = n, "expiration sweeper reclaimed reservations"),
                Ok(_) => debug!("expiration sweeper: nothing to reclaim"),
                Err(e) => error!(error = %e, "expiration sweeper cycle failed"),
            }
        }
    }

    /// One cycle: select up to `batch_size` lapsed Active reservations and
    /// reclaim each under its seat's lock. Returns the number reclaimed.
    pub async fn sweep_once(&self) -> Result<usize, sqlx::Error> {
        let now = Utc::now().naive_utc();

        let candidates: Vec<(i64, i64, i64, String)> = sqlx::query_as(
            "SELECT id, event_id, seat_id, holder
             FROM reservations
             WHERE status = 'ACTIVE' AND expires_at <= $1
             ORDER BY expires_at
             LIMIT $2",
        )
        .bind(now)
        .bind(self.config.batch_size)
        .fetch_all(&self.pool)
        .await?;

        let mut reclaimed = 0;
        for (reservation_id, event_id, seat_id, holder) in candidates {
            match self.reclaim_one(reservation_id, event_id, seat_id, &holder, now).await {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(e) => warn!(reservation_id, error = %e, "failed to reclaim reservation"),
            }
        }
        Ok(reclaimed)
    }

    async fn reclaim_one(
        &self,
        reservation_id: i64,
        event_id: i64,
        seat_id: i64,
        holder: &str,
        now: chrono::NaiveDateTime,
    ) -> Result<bool, sqlx::Error> {
        let key = DistributedLock::seat_key(seat_id);
        let guard = match self.lock.acquire(&key).await {
            Ok(g) => g,
            Err(_) => return Ok(false),
        };

        let mut tx = self.pool.begin().await?;

        // Seat may have been promoted to Booked (or re-extended) between
        // selection and lock acquisition -- leave it alone.
        let reset = sqlx::query(
            "UPDATE seats
             SET status = 'AVAILABLE', holder = NULL, hold_expiry = NULL, version = version + 1
             WHERE id = $1 AND status = 'RESERVED' AND holder = $2 AND hold_expiry <= $3",
        )
        .bind(seat_id)
        .bind(holder)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let did_reclaim = reset.rows_affected() > 0;
        if did_reclaim {
            sqlx::query("UPDATE events SET available_seats = available_seats + 1 WHERE id = $1")
                .bind(event_id)
                .execute(&mut *tx)
                .await?;

            sqlx::query("UPDATE reservations SET status = 'EXPIRED' WHERE id = $1 AND status = 'ACTIVE'")
                .bind(reservation_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        self.lock.release(&guard).await;
        Ok(did_reclaim)
    }
}
