use axum::{http::StatusCode, Json};
use serde_json::json;

/// Domain error taxonomy for the reservation engine and everything built on
/// top of it (queue, sweeper, booking finalizer). Each variant maps to one
/// HTTP status via [`EngineError::status_code`] and to one
/// [`crate::models::RequestErrorDescriptor`] kind for the queue path.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("event {0} not found")]
    EventNotFound(i64),

    #[error("event {0} is not on sale")]
    EventNotOnSale(i64),

    #[error("seat {0} does not belong to the requested event")]
    SeatNotInEvent(i64),

    #[error("seat {0} is unavailable")]
    SeatUnavailable(i64),

    #[error("reservation {0} not found")]
    ReservationNotFound(i64),

    #[error("reservation {0} already expired")]
    AlreadyExpired(i64),

    #[error("reservation {0} does not belong to user")]
    NotOwner(i64),

    #[error("booking {0} not found")]
    BookingNotFound(i64),

    #[error("booking {0} is not in a state that allows this operation")]
    InvalidBookingState(i64),

    #[error("seat update lost a concurrent race (optimistic conflict)")]
    OptimisticConflict,

    #[error("too many seats requested: {requested}, max {max}")]
    TooManySeats { requested: usize, max: usize },

    #[error("no seats requested")]
    EmptySeatList,

    #[error("duplicate seat id in request")]
    DuplicateSeatId,

    #[error("timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("request {0} not found")]
    RequestNotFound(String),

    #[error("request {0} is already processing or in a terminal state")]
    RequestNotCancelable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::EventNotFound(_) => "event_not_found",
            EngineError::EventNotOnSale(_) => "event_not_on_sale",
            EngineError::SeatNotInEvent(_) => "seat_not_in_event",
            EngineError::SeatUnavailable(_) => "seat_unavailable",
            EngineError::ReservationNotFound(_) => "reservation_not_found",
            EngineError::AlreadyExpired(_) => "already_expired",
            EngineError::NotOwner(_) => "not_owner",
            EngineError::BookingNotFound(_) => "booking_not_found",
            EngineError::InvalidBookingState(_) => "invalid_booking_state",
            EngineError::OptimisticConflict => "optimistic_conflict",
            EngineError::TooManySeats { .. } => "too_many_seats",
            EngineError::EmptySeatList => "empty_seat_list",
            EngineError::DuplicateSeatId => "duplicate_seat_id",
            EngineError::LockTimeout(_) => "lock_timeout",
            EngineError::RequestNotFound(_) => "request_not_found",
            EngineError::RequestNotCancelable(_) => "request_not_cancelable",
            EngineError::Database(_) => "database_error",
            EngineError::Cache(_) => "cache_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::EventNotFound(_)
            | EngineError::ReservationNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::RequestNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::SeatNotInEvent(_)
            | EngineError::TooManySeats { .. }
            | EngineError::EmptySeatList
            | EngineError::DuplicateSeatId => StatusCode::BAD_REQUEST,
            EngineError::EventNotOnSale(_)
            | EngineError::SeatUnavailable(_)
            | EngineError::OptimisticConflict
            | EngineError::AlreadyExpired(_)
            | EngineError::InvalidBookingState(_)
            | EngineError::RequestNotCancelable(_) => StatusCode::CONFLICT,
            EngineError::NotOwner(_) => StatusCode::FORBIDDEN,
            EngineError::LockTimeout(_) => StatusCode::CONFLICT,
            EngineError::Database(_) | EngineError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True if retrying the same request shortly afterwards could succeed
    /// (transient condition) rather than a condition that will keep failing
    /// for this exact request (domain rejection).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::OptimisticConflict
                | EngineError::LockTimeout(_)
                | EngineError::Database(_)
                | EngineError::Cache(_)
        )
    }
}

impl axum::response::IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
