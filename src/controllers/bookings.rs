//! Booking endpoints: turn held reservations into a booking, mediate the
//! opaque payment-confirm transition, and handle cancellation. All business
//! logic lives in [`crate::booking::BookingFinalizer`]; these handlers only
//! parse requests and check ownership at the HTTP edge.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::middleware::UserId;
use crate::models::Booking;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", post(create_booking).get(list_bookings))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/reference/{reference}", get(get_booking_by_reference))
        .route("/bookings/{id}/confirm-payment", post(confirm_payment))
        .route("/bookings/{id}/cancel", post(cancel_booking))
}

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub reservation_ids: Vec<i64>,
}

async fn create_booking(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Json(req): Json<CreateBookingRequest>,
) -> EngineResult<(StatusCode, Json<Booking>)> {
    let booking = state.booking.create_booking(&req.reservation_ids, &user.0).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

async fn list_bookings(
    State(state): State<Arc<AppState>>,
    user: UserId,
) -> EngineResult<Json<Vec<Booking>>> {
    let bookings: Vec<Booking> = sqlx::query_as(
        "SELECT id, event_id, user_id, total, booking_reference, status, payment_status,
                payment_id, created_at, updated_at
         FROM bookings WHERE user_id = $1 ORDER BY id",
    )
    .bind(&user.0)
    .fetch_all(&state.db.pool)
    .await
    .map_err(EngineError::Database)?;

    Ok(Json(bookings))
}

async fn get_booking(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> EngineResult<Json<Booking>> {
    let booking: Option<Booking> = sqlx::query_as(
        "SELECT id, event_id, user_id, total, booking_reference, status, payment_status,
                payment_id, created_at, updated_at
         FROM bookings WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&state.db.pool)
    .await
    .map_err(EngineError::Database)?;

    booking.map(Json).ok_or(EngineError::BookingNotFound(id))
}

async fn get_booking_by_reference(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> EngineResult<Json<Booking>> {
    let booking: Option<Booking> = sqlx::query_as(
        "SELECT id, event_id, user_id, total, booking_reference, status, payment_status,
                payment_id, created_at, updated_at
         FROM bookings WHERE booking_reference = $1",
    )
    .bind(&reference)
    .fetch_optional(&state.db.pool)
    .await
    .map_err(EngineError::Database)?;

    booking.map(Json).ok_or_else(|| EngineError::BookingNotFound(0))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmPaymentRequest {
    pub payment_id: String,
}

async fn confirm_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ConfirmPaymentRequest>,
) -> EngineResult<StatusCode> {
    state.booking.confirm_payment(id, &req.payment_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(id): Path<i64>,
) -> EngineResult<StatusCode> {
    state.booking.cancel_booking(id, &user.0).await?;
    Ok(StatusCode::NO_CONTENT)
}
