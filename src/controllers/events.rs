//! Event and seat catalog endpoints. Catalog management itself is out of
//! scope beyond what is needed to exercise the reservation invariants, so
//! these handlers stay thin: validate, write, return.

use axum::{
    extract::{Path, State},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::models::{Event, Seat};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/events", post(create_event).get(list_events))
        .route("/events/{id}", get(get_event).patch(update_event))
        .route("/events/{id}/start-sale", post(start_sale))
        .route("/events/{id}/seats", post(create_seat).get(list_seats))
        .route("/events/{id}/seats/available", get(list_available_seats))
}

#[derive(Debug, Deserialize)]
pub struct CreateEventRequest {
    pub title: String,
    pub description: Option<String>,
    #[serde(rename = "type", default = "default_event_type")]
    pub event_type: String,
    pub capacity: i32,
    pub sale_start_time: NaiveDateTime,
    pub datetime_start: NaiveDateTime,
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_event_type() -> String {
    "GENERAL".to_string()
}

fn default_provider() -> String {
    "internal".to_string()
}

async fn create_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateEventRequest>,
) -> EngineResult<Json<Event>> {
    let event: Event = sqlx::query_as(
        "INSERT INTO events
            (title, description, type, capacity, available_seats, status, sale_start_time, datetime_start, provider)
         VALUES ($1, $2, $3, $4, $4, 'UPCOMING', $5, $6, $7)
         RETURNING id, title, description, type, capacity, available_seats, status, sale_start_time, datetime_start, provider",
    )
    .bind(&req.title)
    .bind(&req.description)
    .bind(&req.event_type)
    .bind(req.capacity)
    .bind(req.sale_start_time)
    .bind(req.datetime_start)
    .bind(&req.provider)
    .fetch_one(&state.db.pool)
    .await
    .map_err(EngineError::Database)?;

    Ok(Json(event))
}

async fn list_events(State(state): State<Arc<AppState>>) -> EngineResult<Json<Vec<Event>>> {
    let events: Vec<Event> = sqlx::query_as(
        "SELECT id, title, description, type, capacity, available_seats, status, sale_start_time, datetime_start, provider
         FROM events ORDER BY id",
    )
    .fetch_all(&state.db.pool)
    .await
    .map_err(EngineError::Database)?;

    Ok(Json(events))
}

async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> EngineResult<Json<Event>> {
    let event: Option<Event> = sqlx::query_as(
        "SELECT id, title, description, type, capacity, available_seats, status, sale_start_time, datetime_start, provider
         FROM events WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&state.db.pool)
    .await
    .map_err(EngineError::Database)?;

    event.map(Json).ok_or(EngineError::EventNotFound(id))
}

#[derive(Debug, Deserialize)]
pub struct UpdateEventRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub sale_start_time: Option<NaiveDateTime>,
    pub datetime_start: Option<NaiveDateTime>,
}

async fn update_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateEventRequest>,
) -> EngineResult<Json<Event>> {
    let event: Option<Event> = sqlx::query_as(
        "UPDATE events SET
            title = COALESCE($1, title),
            description = COALESCE($2, description),
            sale_start_time = COALESCE($3, sale_start_time),
            datetime_start = COALESCE($4, datetime_start)
         WHERE id = $5
         RETURNING id, title, description, type, capacity, available_seats, status, sale_start_time, datetime_start, provider",
    )
    .bind(&req.title)
    .bind(&req.description)
    .bind(req.sale_start_time)
    .bind(req.datetime_start)
    .bind(id)
    .fetch_optional(&state.db.pool)
    .await
    .map_err(EngineError::Database)?;

    event.map(Json).ok_or(EngineError::EventNotFound(id))
}

/// Sets status OnSale; requires sale_start_time <= now.
async fn start_sale(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> EngineResult<Json<Event>> {
    let event: Option<Event> = sqlx::query_as(
        "SELECT id, title, description, type, capacity, available_seats, status, sale_start_time, datetime_start, provider
         FROM events WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&state.db.pool)
    .await
    .map_err(EngineError::Database)?;
    let event = event.ok_or(EngineError::EventNotFound(id))?;

    if !event.sale_has_started() {
        return Err(EngineError::EventNotOnSale(id));
    }

    let updated: Event = sqlx::query_as(
        "UPDATE events SET status = 'ONSALE' WHERE id = $1
         RETURNING id, title, description, type, capacity, available_seats, status, sale_start_time, datetime_start, provider",
    )
    .bind(id)
    .fetch_one(&state.db.pool)
    .await
    .map_err(EngineError::Database)?;

    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
pub struct CreateSeatRequest {
    pub seat_number: String,
    pub row: i32,
    pub number: i32,
    pub price: f64,
}

async fn create_seat(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<i64>,
    Json(req): Json<CreateSeatRequest>,
) -> EngineResult<Json<Seat>> {
    let seat: Seat = sqlx::query_as(
        "INSERT INTO seats (event_id, seat_number, row, number, price, status, version)
         VALUES ($1, $2, $3, $4, $5, 'AVAILABLE', 0)
         RETURNING id, event_id, seat_number, row, number, price, status, version, holder, hold_expiry, owning_booking_id",
    )
    .bind(event_id)
    .bind(&req.seat_number)
    .bind(req.row)
    .bind(req.number)
    .bind(req.price)
    .fetch_one(&state.db.pool)
    .await
    .map_err(EngineError::Database)?;

    Ok(Json(seat))
}

async fn list_seats(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<i64>,
) -> EngineResult<Json<Vec<Seat>>> {
    let seats: Vec<Seat> = sqlx::query_as(
        "SELECT id, event_id, seat_number, row, number, price, status, version, holder, hold_expiry, owning_booking_id
         FROM seats WHERE event_id = $1 ORDER BY id",
    )
    .bind(event_id)
    .fetch_all(&state.db.pool)
    .await
    .map_err(EngineError::Database)?;

    Ok(Json(seats))
}

async fn list_available_seats(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<i64>,
) -> EngineResult<Json<Vec<Seat>>> {
    let seats: Vec<Seat> = sqlx::query_as(
        "SELECT id, event_id, seat_number, row, number, price, status, version, holder, hold_expiry, owning_booking_id
         FROM seats WHERE event_id = $1 AND status = 'AVAILABLE' ORDER BY id",
    )
    .bind(event_id)
    .fetch_all(&state.db.pool)
    .await
    .map_err(EngineError::Database)?;

    Ok(Json(seats))
}
