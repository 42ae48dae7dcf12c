use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use diesel::result::DatabaseErrorKind;
use serde::Serialize;
use uuid::Uuid;

/// Broad class of a failure. Only `Transient` failures are ever retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Authorization,
    Transient,
}

#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("room {0} not found")]
    RoomNotFound(Uuid),

    #[error("booking {0} not found")]
    BookingNotFound(Uuid),

    #[error("payment for booking {0} not found")]
    PaymentNotFound(Uuid),

    #[error("room is already booked for the requested dates")]
    RoomUnavailableForDates,

    #[error("room is sold out")]
    RoomSoldOut,

    #[error("booking {0} is already cancelled")]
    AlreadyCancelled(Uuid),

    #[error("booking {0} is completed and cannot be cancelled")]
    CannotCancelCompleted(Uuid),

    #[error("not authorized to modify booking {0}")]
    NotAuthorized(Uuid),

    #[error("booking failed: {0}")]
    BookingFailed(String),

    #[error("cancellation failed: {0}")]
    CancelFailed(String),

    #[error("payment callback failed: {0}")]
    CallbackFailed(String),

    /// Retryable storage failure: serialization conflict, deadlock, pool exhaustion.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store error: {0}")]
    Store(String),
}

impl ReservationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::Validation,
            Self::RoomNotFound(_) | Self::BookingNotFound(_) | Self::PaymentNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::RoomUnavailableForDates
            | Self::RoomSoldOut
            | Self::AlreadyCancelled(_)
            | Self::CannotCancelCompleted(_) => ErrorKind::Conflict,
            Self::NotAuthorized(_) => ErrorKind::Authorization,
            Self::BookingFailed(_)
            | Self::CancelFailed(_)
            | Self::CallbackFailed(_)
            | Self::StoreUnavailable(_)
            | Self::Store(_) => ErrorKind::Transient,
        }
    }

    /// Whether another attempt of the same unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::RoomNotFound(_) => "ROOM_NOT_FOUND",
            Self::BookingNotFound(_) => "BOOKING_NOT_FOUND",
            Self::PaymentNotFound(_) => "PAYMENT_NOT_FOUND",
            Self::RoomUnavailableForDates => "ROOM_UNAVAILABLE_FOR_DATES",
            Self::RoomSoldOut => "ROOM_SOLD_OUT",
            Self::AlreadyCancelled(_) => "ALREADY_CANCELLED",
            Self::CannotCancelCompleted(_) => "CANNOT_CANCEL_COMPLETED",
            Self::NotAuthorized(_) => "NOT_AUTHORIZED",
            Self::BookingFailed(_) => "BOOKING_FAILED",
            Self::CancelFailed(_) => "CANCEL_FAILED",
            Self::CallbackFailed(_) => "CALLBACK_FAILED",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    /// Collapses storage failures into the operation-level failure surfaced to callers.
    /// Domain failures pass through untouched.
    pub fn surface_as(self, wrap: fn(String) -> ReservationError) -> ReservationError {
        match self {
            Self::StoreUnavailable(msg) | Self::Store(msg) => wrap(msg),
            other => other,
        }
    }
}

impl From<diesel::result::Error> for ReservationError {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::Error;

        match err {
            Error::DatabaseError(kind, info) => {
                let constraint = info.constraint_name().unwrap_or_default();
                match kind {
                    DatabaseErrorKind::SerializationFailure
                    | DatabaseErrorKind::ClosedConnection => {
                        Self::StoreUnavailable(info.message().to_string())
                    }
                    DatabaseErrorKind::CheckViolation
                        if constraint == "rooms_availability_non_negative" =>
                    {
                        Self::RoomSoldOut
                    }
                    _ if constraint == "bookings_no_overlap" => Self::RoomUnavailableForDates,
                    // deadlock_detected has no dedicated kind
                    _ if info.message().contains("deadlock detected") => {
                        Self::StoreUnavailable(info.message().to_string())
                    }
                    _ => Self::Store(info.message().to_string()),
                }
            }
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<r2d2::Error> for ReservationError {
    fn from(err: r2d2::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.to_string(),
            message: message.into(),
        }
    }
}

impl ResponseError for ReservationError {
    fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::Transient if self.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Transient => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody::new(self.code(), self.to_string()))
    }
}
