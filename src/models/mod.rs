pub mod booking;
pub mod event;
pub mod queued_request;
pub mod reservation;
pub mod seat;

pub use booking::{Booking, BookingSeat, BookingStatus, PaymentStatus};
pub use event::{Event, SaleStatus};
pub use queued_request::{
    Priority, RequestErrorDescriptor, RequestState, RequestStatusRecord,
    ReservationRequestPayload,
};
pub use reservation::{Reservation, ReservationOutcome, ReservationStatus};
pub use seat::{Seat, SeatStatus};
