//! booking.rs
//!
//! The booking finalizer: converts a set of held reservations into
//! a confirmed booking under a multi-key lock, then mediates the opaque
//! payment-confirm/cancel transitions. Payment processing itself is an
//! external collaborator; this module only owns the state
//! transition payment success/failure triggers.

use crate::error::{EngineError, EngineResult};
use crate::lock::DistributedLock;
use crate::models::{Booking, BookingStatus, ReservationStatus};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct BookingFinalizer {
    pool: PgPool,
    lock: DistributedLock,
}

impl BookingFinalizer {
    pub fn new(pool: PgPool, lock: DistributedLock) -> Self {
        Self { pool, lock }
    }

    fn generate_reference() -> String {
        format!("BK-{}", Uuid::new_v4().simple())
    }

    /// Every reservation must be Active, owned by `user`, and unexpired,
    /// or the whole attempt fails with no state changes.
    pub async fn create_booking(
        &self,
        reservation_ids: &[i64],
        user: &str,
    ) -> EngineResult<Booking> {
        if reservation_ids.is_empty() {
            return Err(EngineError::EmptySeatList);
        }

        let seat_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT seat_id FROM reservations WHERE id = ANY($1) ORDER BY seat_id",
        )
        .bind(reservation_ids)
        .fetch_all(&self.pool)
        .await?;

        let lock_keys: Vec<String> = seat_ids.iter().map(|id| DistributedLock::seat_key(*id)).collect();
        let guards = self.lock.acquire_all(&lock_keys).await?;
        let result = self.create_booking_locked(reservation_ids, user).await;
        self.lock.release_all(&guards).await;
        result
    }

    async fn create_booking_locked(
        &self,
        reservation_ids: &[i64],
        user: &str,
    ) -> EngineResult<Booking> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().naive_utc();

        let rows = sqlx::query_as::<_, (i64, i64, i64, String, chrono::NaiveDateTime, ReservationStatus, f64)>(
            "SELECT r.id, r.event_id, r.seat_id, r.holder, r.expires_at, r.status, s.price
             FROM reservations r
             JOIN seats s ON s.id = r.seat_id
             WHERE r.id = ANY($1)
             ORDER BY r.seat_id
             FOR UPDATE OF r",
        )
        .bind(reservation_ids)
        .fetch_all(&mut *tx)
        .await?;

        if rows.len() != reservation_ids.len() {
            tx.rollback().await.ok();
            return Err(EngineError::ReservationNotFound(reservation_ids[0]));
        }

        let event_id = rows[0].1;
        let mut total = 0.0f64;
        for (res_id, row_event_id, _seat_id, holder, expires_at, status, price) in &rows {
            if *row_event_id != event_id {
                tx.rollback().await.ok();
                return Err(EngineError::SeatNotInEvent(*res_id));
            }
            if holder != user {
                tx.rollback().await.ok();
                return Err(EngineError::NotOwner(*res_id));
            }
            if *status != ReservationStatus::Active || *expires_at <= now {
                tx.rollback().await.ok();
                return Err(EngineError::AlreadyExpired(*res_id));
            }
            total += price;
        }

        let reference = Self::generate_reference();
        let booking: Booking = sqlx::query_as(
            "INSERT INTO bookings
                (event_id, user_id, total, booking_reference, status, payment_status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, 'PENDING', 'PENDING', $5, $5)
             RETURNING id, event_id, user_id, total, booking_reference, status, payment_status,
                       payment_id, created_at, updated_at",
        )
        .bind(event_id)
        .bind(user)
        .bind(total)
        .bind(&reference)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for (res_id, _event_id, seat_id, _holder, _expires_at, _status, _price) in &rows {
            let updated = sqlx::query(
                "UPDATE seats SET status = 'BOOKED', owning_booking_id = $1, version = version + 1
                 WHERE id = $2 AND status = 'RESERVED'",
            )
            .bind(booking.id)
            .bind(seat_id)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                tx.rollback().await.ok();
                return Err(EngineError::OptimisticConflict);
            }

            sqlx::query("INSERT INTO booking_seats (booking_id, seat_id) VALUES ($1, $2)")
                .bind(booking.id)
                .bind(seat_id)
                .execute(&mut *tx)
                .await?;

            sqlx::query("UPDATE reservations SET status = 'CONFIRMED' WHERE id = $1")
                .bind(res_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(booking)
    }

    /// Idempotent on identical `payment_id` -- repeating the call after the
    /// first success is a no-op.
    pub async fn confirm_payment(&self, booking_id: i64, payment_id: &str) -> EngineResult<()> {
        let booking: Option<Booking> = sqlx::query_as(
            "SELECT id, event_id, user_id, total, booking_reference, status, payment_status,
                    payment_id, created_at, updated_at
             FROM bookings WHERE id = $1",
        )
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await?;
        let booking = booking.ok_or(EngineError::BookingNotFound(booking_id))?;

        if booking.status == BookingStatus::Confirmed && booking.payment_id.as_deref() == Some(payment_id) {
            return Ok(());
        }
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::InvalidBookingState(booking_id));
        }

        sqlx::query(
            "UPDATE bookings
             SET status = 'CONFIRMED', payment_status = 'SUCCESS', payment_id = $1, updated_at = $2
             WHERE id = $3 AND status = 'PENDING'",
        )
        .bind(payment_id)
        .bind(Utc::now().naive_utc())
        .bind(booking_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A Confirmed booking is final (seats stay Booked, audit trail); a
    /// Pending booking reverts its seats to Available.
    pub async fn cancel_booking(&self, booking_id: i64, user: &str) -> EngineResult<()> {
        let booking: Option<Booking> = sqlx::query_as(
            "SELECT id, event_id, user_id, total, booking_reference, status, payment_status,
                    payment_id, created_at, updated_at
             FROM bookings WHERE id = $1",
        )
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await?;
        let booking = booking.ok_or(EngineError::BookingNotFound(booking_id))?;
        if booking.user_id != user {
            return Err(EngineError::NotOwner(booking_id));
        }

        if booking.status == BookingStatus::Confirmed {
            sqlx::query("UPDATE bookings SET status = 'CANCELLED', updated_at = $1 WHERE id = $2")
                .bind(Utc::now().naive_utc())
                .bind(booking_id)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::InvalidBookingState(booking_id));
        }

        let seat_ids: Vec<i64> =
            sqlx::query_scalar("SELECT seat_id FROM booking_seats WHERE booking_id = $1 ORDER BY seat_id")
                .bind(booking_id)
                .fetch_all(&self.pool)
                .await?;
        let lock_keys: Vec<String> = seat_ids.iter().map(|id| DistributedLock::seat_key(*id)).collect();
        let guards = self.lock.acquire_all(&lock_keys).await?;
        let result = self.cancel_pending_locked(&booking, &seat_ids).await;
        self.lock.release_all(&guards).await;
        result
    }

    async fn cancel_pending_locked(&self, booking: &Booking, seat_ids: &[i64]) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        let released = sqlx::query(
            "UPDATE seats
             SET status = 'AVAILABLE', owning_booking_id = NULL, version = version + 1
             WHERE id = ANY($1) AND status = 'BOOKED' AND owning_booking_id = $2",
        )
        .bind(seat_ids)
        .bind(booking.id)
        .execute(&mut *tx)
        .await?;

        if released.rows_affected() > 0 {
            sqlx::query("UPDATE events SET available_seats = available_seats + $1 WHERE id = $2")
                .bind(released.rows_affected() as i32)
                .bind(booking.event_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE bookings SET status = 'CANCELLED', updated_at = $1 WHERE id = $2 AND status = 'PENDING'")
            .bind(Utc::now().naive_utc())
            .bind(booking.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_reference_is_unique_per_call() {
        let a = BookingFinalizer::generate_reference();
        let b = BookingFinalizer::generate_reference();
        assert_ne!(a, b);
        assert!(a.starts_with("BK-"));
    }
}
