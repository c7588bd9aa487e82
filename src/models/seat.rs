use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Status of a single [`Seat`]. Each variant implies a consistency rule
/// tying it to the holder/hold_expiry/owning_booking_id fields below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum SeatStatus {
    Available,
    Reserved,
    Booked,
    Blocked,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Seat {
    pub id: i64,
    pub event_id: i64,
    pub seat_number: String,
    pub row: i32,
    pub number: i32,
    pub price: f64,
    pub status: SeatStatus,
    pub version: i64,
    pub holder: Option<String>,
    pub hold_expiry: Option<NaiveDateTime>,
    pub owning_booking_id: Option<i64>,
}

impl Seat {
    /// A seat is reservable if Available, or Reserved with a hold that has
    /// already lapsed (defends against a stuck lock/TTL).
    pub fn is_reservable(&self, now: NaiveDateTime) -> bool {
        match self.status {
            SeatStatus::Available => true,
            SeatStatus::Reserved => self.hold_expiry.map(|exp| exp <= now).unwrap_or(false),
            SeatStatus::Booked | SeatStatus::Blocked => false,
        }
    }
}
