use chrono::{DateTime, Duration, Utc};
use diesel::{
    deserialize::{self, FromSql},
    pg::{Pg, PgValue},
    serialize::{self, Output, ToSql},
    sql_types::Text,
    Insertable, Queryable, Selectable,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ReservationError;
use crate::schema::{bookings, payments, rooms};

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = rooms)]
pub struct Room {
    pub id: Uuid,
    pub hotel_id: Uuid,
    pub room_type: String,
    pub price_per_night_minor: i64,
    pub availability: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = crate::schema::sql_types::BookingStatus)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Statuses that hold a unit of inventory and block the room's dates.
    pub const ACTIVE: [BookingStatus; 2] = [BookingStatus::Pending, BookingStatus::Confirmed];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Completed => "COMPLETED",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

impl ToSql<crate::schema::sql_types::BookingStatus, Pg> for BookingStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<crate::schema::sql_types::BookingStatus, Pg> for BookingStatus {
    fn from_sql(bytes: PgValue) -> deserialize::Result<Self> {
        match <String as FromSql<Text, Pg>>::from_sql(bytes)?.as_str() {
            "PENDING" => Ok(BookingStatus::Pending),
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "CANCELLED" => Ok(BookingStatus::Cancelled),
            "COMPLETED" => Ok(BookingStatus::Completed),
            s => Err(format!("Unrecognized booking status: {}", s).into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = crate::schema::sql_types::PaymentStatus)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// The gateway only distinguishes `SUCCESS` from everything else.
    pub fn from_gateway(status: &str) -> Self {
        if status == "SUCCESS" {
            PaymentStatus::Success
        } else {
            PaymentStatus::Failed
        }
    }
}

impl ToSql<crate::schema::sql_types::PaymentStatus, Pg> for PaymentStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<crate::schema::sql_types::PaymentStatus, Pg> for PaymentStatus {
    fn from_sql(bytes: PgValue) -> deserialize::Result<Self> {
        match <String as FromSql<Text, Pg>>::from_sql(bytes)?.as_str() {
            "PENDING" => Ok(PaymentStatus::Pending),
            "SUCCESS" => Ok(PaymentStatus::Success),
            "FAILED" => Ok(PaymentStatus::Failed),
            s => Err(format!("Unrecognized payment status: {}", s).into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = bookings)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub room_id: Uuid,
    pub check_in: DateTime<Utc>,
    pub check_out: DateTime<Utc>,
    pub total_price_minor: i64,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn overlaps(&self, check_in: DateTime<Utc>, check_out: DateTime<Utc>) -> bool {
        self.check_in < check_out && self.check_out > check_in
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = bookings)]
pub struct NewBooking {
    pub user_id: Uuid,
    pub room_id: Uuid,
    pub check_in: DateTime<Utc>,
    pub check_out: DateTime<Utc>,
    pub total_price_minor: i64,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = payments)]
pub struct Payment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub amount_minor: i64,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = payments)]
pub struct NewPayment {
    pub booking_id: Uuid,
    pub amount_minor: i64,
    pub status: PaymentStatus,
}

/// A validated `[check_in, check_out)` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stay {
    pub check_in: DateTime<Utc>,
    pub check_out: DateTime<Utc>,
}

impl Stay {
    pub fn new(
        check_in: DateTime<Utc>,
        check_out: DateTime<Utc>,
        now: DateTime<Utc>,
        max_stay_days: i64,
    ) -> Result<Self, ReservationError> {
        if check_out <= check_in {
            return Err(ReservationError::InvalidRequest(
                "check_out must be after check_in".to_string(),
            ));
        }
        if check_in.date_naive() < now.date_naive() {
            return Err(ReservationError::InvalidRequest(
                "check_in cannot be in the past".to_string(),
            ));
        }
        let max_stay_seconds = max_stay_days.saturating_mul(Duration::days(1).num_seconds());
        if (check_out - check_in).num_seconds() > max_stay_seconds {
            return Err(ReservationError::InvalidRequest(format!(
                "stay cannot exceed {} days",
                max_stay_days
            )));
        }
        Ok(Self { check_in, check_out })
    }

    /// Started days count as a full night; every stay is at least one night.
    pub fn nights(&self) -> i64 {
        let seconds = (self.check_out - self.check_in).num_seconds();
        let per_day = Duration::days(1).num_seconds();
        ((seconds + per_day - 1) / per_day).max(1)
    }

    pub fn total_price(&self, price_per_night_minor: i64) -> Result<i64, ReservationError> {
        self.nights()
            .checked_mul(price_per_night_minor)
            .ok_or_else(|| ReservationError::InvalidRequest("total price exceeds the supported range".to_string()))
    }
}

// Request/Response models for API
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBookingRequest {
    pub room_id: Uuid,
    pub check_in: DateTime<Utc>,
    pub check_out: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaymentCallback {
    pub booking_id: Uuid,
    #[serde(default)]
    pub transaction_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingDetails {
    #[serde(flatten)]
    pub booking: Booking,
    pub room: Option<Room>,
    pub payment: Option<Payment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub booking: Booking,
    /// False when the room row was missing and availability could not be restored.
    pub inventory_restored: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackOutcome {
    pub booking: Booking,
    pub payment: Payment,
    /// The payment was already settled; nothing was changed.
    pub already_settled: bool,
    pub inventory_released: bool,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: &str, data: T) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            data: Some(data),
        }
    }
}
