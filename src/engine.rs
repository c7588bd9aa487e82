//! engine.rs
//!
//! The reservation engine: the single entry point both the synchronous
//! (Path A) HTTP handlers and the asynchronous (Path B) queue worker call
//! to transition seats. All state changes happen inside one database
//! transaction guarded by a distributed lock over the affected seats, so
//! either every requested seat becomes Reserved or nothing changes.

use crate::config::{LockConfig, ReservationConfig};
use crate::error::{EngineError, EngineResult};
use crate::lock::DistributedLock;
use crate::models::{Reservation, ReservationOutcome, ReservationStatus, SaleStatus, SeatStatus};
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use tracing::{error, warn};

#[derive(Clone)]
pub struct ReservationEngine {
    pool: PgPool,
    lock: DistributedLock,
    reservation: ReservationConfig,
    #[allow(dead_code)]
    lock_config: LockConfig,
}

impl ReservationEngine {
    pub fn new(
        pool: PgPool,
        lock: DistributedLock,
        reservation: ReservationConfig,
        lock_config: LockConfig,
    ) -> Self {
        Self {
            pool,
            lock,
            reservation,
            lock_config,
        }
    }

    /// All-or-nothing: every seat becomes Reserved by `user`, or no
    /// state changes at all.
    pub async fn reserve(
        &self,
        event_id: i64,
        seat_ids: &[i64],
        user: &str,
    ) -> EngineResult<ReservationOutcome> {
        if seat_ids.is_empty() {
            return Err(EngineError::EmptySeatList);
        }
        if seat_ids.len() > self.reservation.max_seats_per_booking {
            return Err(EngineError::TooManySeats {
                requested: seat_ids.len(),
                max: self.reservation.max_seats_per_booking,
            });
        }

        let mut sorted_ids = seat_ids.to_vec();
        sorted_ids.sort();
        let original_len = sorted_ids.len();
        sorted_ids.dedup();
        if sorted_ids.len() != original_len {
            return Err(EngineError::DuplicateSeatId);
        }

        let lock_keys: Vec<String> = sorted_ids.iter().map(|id| DistributedLock::seat_key(*id)).collect();
        let guards = self.lock.acquire_all(&lock_keys).await?;

        let result = self.reserve_locked(event_id, &sorted_ids, user).await;

        self.lock.release_all(&guards).await;
        result
    }

    async fn reserve_locked(
        &self,
        event_id: i64,
        seat_ids: &[i64],
        user: &str,
    ) -> EngineResult<ReservationOutcome> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().naive_utc();

        let sale_status: Option<SaleStatus> =
            sqlx::query_scalar("SELECT status FROM events WHERE id = $1 FOR UPDATE")
                .bind(event_id)
                .fetch_optional(&mut *tx)
                .await?;
        let sale_status = match sale_status {
            Some(s) => s,
            None => {
                tx.rollback().await.ok();
                return Err(EngineError::EventNotFound(event_id));
            }
        };
        if sale_status != SaleStatus::OnSale {
            tx.rollback().await.ok();
            return Err(EngineError::EventNotOnSale(event_id));
        }

        // Row-level exclusive lock on every target seat, in the same
        // ascending order we took the distributed locks in.
        let rows = sqlx::query_as::<_, (i64, i64, i64, SeatStatus, Option<chrono::NaiveDateTime>)>(
            "SELECT id, event_id, version, status, hold_expiry
             FROM seats
             WHERE id = ANY($1)
             ORDER BY id
             FOR UPDATE",
        )
        .bind(seat_ids)
        .fetch_all(&mut *tx)
        .await?;

        if rows.len() != seat_ids.len() {
            tx.rollback().await.ok();
            let missing = seat_ids
                .iter()
                .find(|id| !rows.iter().any(|r| r.0 == **id))
                .copied()
                .unwrap_or(seat_ids[0]);
            return Err(EngineError::SeatUnavailable(missing));
        }

        for (seat_id, row_event_id, _version, status, hold_expiry) in &rows {
            if *row_event_id != event_id {
                tx.rollback().await.ok();
                return Err(EngineError::SeatNotInEvent(*seat_id));
            }
            let reservable = match status {
                SeatStatus::Available => true,
                SeatStatus::Reserved => hold_expiry.map(|exp| exp <= now).unwrap_or(false),
                SeatStatus::Booked | SeatStatus::Blocked => false,
            };
            if !reservable {
                tx.rollback().await.ok();
                return Err(EngineError::SeatUnavailable(*seat_id));
            }
        }

        let expires_at = now + ChronoDuration::seconds(self.reservation.timeout_seconds);
        let mut reservation_ids = Vec::with_capacity(seat_ids.len());

        for (seat_id, _event_id, version, _status, _hold_expiry) in &rows {
            let updated = sqlx::query(
                "UPDATE seats
                 SET status = 'RESERVED', holder = $1, hold_expiry = $2, version = version + 1
                 WHERE id = $3 AND version = $4",
            )
            .bind(user)
            .bind(expires_at)
            .bind(seat_id)
            .bind(version)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                tx.rollback().await.ok();
                return Err(EngineError::OptimisticConflict);
            }

            let reservation: Reservation = sqlx::query_as(
                "INSERT INTO reservations (event_id, seat_id, holder, expires_at, status, created_at)
                 VALUES ($1, $2, $3, $4, 'ACTIVE', $5)
                 RETURNING id, event_id, seat_id, holder, expires_at, status, created_at",
            )
            .bind(event_id)
            .bind(seat_id)
            .bind(user)
            .bind(expires_at)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            reservation_ids.push(reservation.id);
        }

        let sold_out = sqlx::query_scalar::<_, i32>(
            "UPDATE events
             SET available_seats = available_seats - $1,
                 status = CASE WHEN available_seats - $1 <= 0 THEN 'SOLDOUT' ELSE status END
             WHERE id = $2
             RETURNING available_seats",
        )
        .bind(seat_ids.len() as i32)
        .bind(event_id)
        .fetch_one(&mut *tx)
        .await?;

        if sold_out < 0 {
            error!(event_id, "available_seats went negative, invariant violated");
        }

        tx.commit().await?;

        Ok(ReservationOutcome {
            reservation_ids,
            seat_ids: seat_ids.to_vec(),
            expires_at,
        })
    }

    /// Re-derives the outcome of a `reserve` call that may have already
    /// committed without the caller observing it -- the crash window where
    /// a queue worker commits the transaction, then dies before writing
    /// `Completed` to the status store. The retried delivery must not call
    /// `reserve` again (it would
    /// legitimately fail with `SeatUnavailable` against the seats it just
    /// won) -- it first checks whether every requested seat is already
    /// Reserved by this exact user with a still-live Active reservation,
    /// and if so reports that as a success instead of re-attempting.
    pub async fn already_held(
        &self,
        event_id: i64,
        seat_ids: &[i64],
        user: &str,
    ) -> EngineResult<Option<ReservationOutcome>> {
        if seat_ids.is_empty() {
            return Ok(None);
        }

        let rows: Vec<(i64, i64, chrono::NaiveDateTime)> = sqlx::query_as(
            "SELECT r.id, r.seat_id, r.expires_at
             FROM reservations r
             JOIN seats s ON s.id = r.seat_id
             WHERE r.event_id = $1
               AND r.seat_id = ANY($2)
               AND r.holder = $3
               AND r.status = 'ACTIVE'
               AND s.status = 'RESERVED'
               AND s.holder = $3",
        )
        .bind(event_id)
        .bind(seat_ids)
        .bind(user)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() != seat_ids.len() {
            return Ok(None);
        }

        let expires_at = rows.iter().map(|(_, _, exp)| *exp).min().unwrap();
        let reservation_ids = rows.iter().map(|(id, _, _)| *id).collect();
        Ok(Some(ReservationOutcome {
            reservation_ids,
            seat_ids: seat_ids.to_vec(),
            expires_at,
        }))
    }

    /// Verifies ownership, reverts the seat under its lock.
    pub async fn cancel(&self, reservation_id: i64, user: &str) -> EngineResult<()> {
        let reservation: Option<Reservation> = sqlx::query_as(
            "SELECT id, event_id, seat_id, holder, expires_at, status, created_at
             FROM reservations WHERE id = $1",
        )
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await?;

        let reservation = reservation.ok_or(EngineError::ReservationNotFound(reservation_id))?;
        if reservation.holder != user {
            return Err(EngineError::NotOwner(reservation_id));
        }
        if reservation.status != ReservationStatus::Active {
            return Err(EngineError::AlreadyExpired(reservation_id));
        }

        let key = DistributedLock::seat_key(reservation.seat_id);
        let guard = self.lock.acquire(&key).await?;
        let result = self.cancel_locked(&reservation).await;
        self.lock.release(&guard).await;
        result
    }

    async fn cancel_locked(&self, reservation: &Reservation) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE seats
             SET status = 'AVAILABLE', holder = NULL, hold_expiry = NULL, version = version + 1
             WHERE id = $1 AND status = 'RESERVED' AND holder = $2",
        )
        .bind(reservation.seat_id)
        .bind(&reservation.holder)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() > 0 {
            sqlx::query(
                "UPDATE events SET available_seats = available_seats + 1 WHERE id = $1",
            )
            .bind(reservation.event_id)
            .execute(&mut *tx)
            .await?;
        } else {
            warn!(
                reservation_id = reservation.id,
                "seat already advanced past Reserved during cancel; leaving seat state alone"
            );
        }

        sqlx::query("UPDATE reservations SET status = 'CANCELLED' WHERE id = $1 AND status = 'ACTIVE'")
            .bind(reservation.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Pushes expiry forward by RESERVATION_TIMEOUT_SECONDS.
    pub async fn extend(
        &self,
        reservation_id: i64,
        user: &str,
    ) -> EngineResult<chrono::NaiveDateTime> {
        let reservation: Option<Reservation> = sqlx::query_as(
            "SELECT id, event_id, seat_id, holder, expires_at, status, created_at
             FROM reservations WHERE id = $1",
        )
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await?;

        let reservation = reservation.ok_or(EngineError::ReservationNotFound(reservation_id))?;
        if reservation.holder != user {
            return Err(EngineError::NotOwner(reservation_id));
        }
        let now = Utc::now().naive_utc();
        if reservation.status != ReservationStatus::Active || reservation.expires_at <= now {
            return Err(EngineError::AlreadyExpired(reservation_id));
        }

        let key = DistributedLock::seat_key(reservation.seat_id);
        let guard = self.lock.acquire(&key).await?;
        let result = self.extend_locked(&reservation, now).await;
        self.lock.release(&guard).await;
        result
    }

    async fn extend_locked(
        &self,
        reservation: &Reservation,
        now: chrono::NaiveDateTime,
    ) -> EngineResult<chrono::NaiveDateTime> {
        let new_expiry = now + ChronoDuration::seconds(self.reservation.timeout_seconds);
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE seats SET hold_expiry = $1, version = version + 1
             WHERE id = $2 AND status = 'RESERVED' AND holder = $3",
        )
        .bind(new_expiry)
        .bind(reservation.seat_id)
        .bind(&reservation.holder)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(EngineError::AlreadyExpired(reservation.id));
        }

        sqlx::query("UPDATE reservations SET expires_at = $1 WHERE id = $2 AND status = 'ACTIVE'")
            .bind(new_expiry)
            .bind(reservation.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(new_expiry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_many_seats_rejected_before_touching_locks() {
        let err = EngineError::TooManySeats { requested: 11, max: 10 };
        assert_eq!(err.kind(), "too_many_seats");
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn empty_seat_list_is_validation_error() {
        let err = EngineError::EmptySeatList;
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }
}
