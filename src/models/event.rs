use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Sale status of an [`Event`]. Only `OnSale` events accept reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum SaleStatus {
    Upcoming,
    OnSale,
    SoldOut,
    Cancelled,
}

impl fmt::Display for SaleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SaleStatus::Upcoming => "UPCOMING",
            SaleStatus::OnSale => "ONSALE",
            SaleStatus::SoldOut => "SOLDOUT",
            SaleStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub capacity: i32,
    pub available_seats: i32,
    pub status: SaleStatus,
    pub sale_start_time: NaiveDateTime,
    pub datetime_start: NaiveDateTime,
    pub provider: String,
}

impl Event {
    /// Whether this event currently accepts reservations -- only events
    /// with status OnSale do.
    pub fn accepts_reservations(&self) -> bool {
        self.status == SaleStatus::OnSale
    }

    pub fn sale_has_started(&self) -> bool {
        self.sale_start_time <= Utc::now().naive_utc()
    }
}
