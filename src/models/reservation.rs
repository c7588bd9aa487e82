use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum ReservationStatus {
    Active,
    Confirmed,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Reservation {
    pub id: i64,
    pub event_id: i64,
    pub seat_id: i64,
    pub holder: String,
    pub expires_at: NaiveDateTime,
    pub status: ReservationStatus,
    pub created_at: NaiveDateTime,
}

/// Outcome of [`crate::engine::ReservationEngine::reserve`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationOutcome {
    pub reservation_ids: Vec<i64>,
    pub seat_ids: Vec<i64>,
    pub expires_at: NaiveDateTime,
}
