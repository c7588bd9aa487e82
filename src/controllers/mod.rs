//! Root routing module. Every route requires the `X-User-ID` header
//! (enforced per-handler by the [`crate::middleware::UserId`] extractor,
//! not by a blanket middleware layer, since a few read-only endpoints --
//! event/seat catalog browsing, queue health -- stay open).

pub mod bookings;
pub mod events;
pub mod reservations;

use axum::Router;
use std::sync::Arc;

use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(events::routes())
        .merge(reservations::routes())
        .merge(bookings::routes())
}
