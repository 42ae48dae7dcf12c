use chrono::Utc;
use diesel::prelude::*;
use uuid::Uuid;

use crate::errors::ReservationError;
use crate::models::{self, BookingStatus, PaymentStatus, Stay};

pub fn lock_room(conn: &mut PgConnection, rid: Uuid) -> QueryResult<Option<models::Room>> {
    use crate::schema::rooms::dsl::rooms;

    rooms
        .find(rid)
        .for_update()
        .first::<models::Room>(conn)
        .optional()
}

pub fn get_room(conn: &mut PgConnection, rid: Uuid) -> QueryResult<Option<models::Room>> {
    use crate::schema::rooms::dsl::rooms;

    rooms.find(rid).first::<models::Room>(conn).optional()
}

pub fn find_overlapping_bookings(
    conn: &mut PgConnection,
    rid: Uuid,
    stay: &Stay,
    statuses: &[BookingStatus],
) -> QueryResult<Vec<models::Booking>> {
    use crate::schema::bookings::dsl::{bookings, check_in, check_out, room_id, status};

    bookings
        .filter(room_id.eq(rid))
        .filter(status.eq_any(statuses.to_vec()))
        // Overlap: (start1 < end2) AND (end1 > start2)
        .filter(check_in.lt(stay.check_out).and(check_out.gt(stay.check_in)))
        .load::<models::Booking>(conn)
}

pub fn adjust_availability(
    conn: &mut PgConnection,
    rid: Uuid,
    delta: i32,
) -> Result<models::Room, ReservationError> {
    use crate::schema::rooms::dsl::{availability, rooms, updated_at};

    let updated = diesel::update(rooms.find(rid))
        .filter((availability + delta).ge(0))
        .set((availability.eq(availability + delta), updated_at.eq(Utc::now())))
        .get_result::<models::Room>(conn)
        .optional()?;

    match updated {
        Some(room) => Ok(room),
        None if get_room(conn, rid)?.is_some() => Err(ReservationError::RoomSoldOut),
        None => Err(ReservationError::RoomNotFound(rid)),
    }
}

pub fn get_booking(conn: &mut PgConnection, bid: Uuid) -> QueryResult<Option<models::Booking>> {
    use crate::schema::bookings::dsl::bookings;

    bookings.find(bid).first::<models::Booking>(conn).optional()
}

pub fn bookings_for_user(conn: &mut PgConnection, uid: Uuid) -> QueryResult<Vec<models::Booking>> {
    use crate::schema::bookings::dsl::{bookings, created_at, user_id};

    bookings
        .filter(user_id.eq(uid))
        .order(created_at.desc())
        .load::<models::Booking>(conn)
}

pub fn insert_booking(conn: &mut PgConnection, new_booking: &models::NewBooking) -> QueryResult<models::Booking> {
    use crate::schema::bookings::dsl::bookings;

    diesel::insert_into(bookings)
        .values(new_booking)
        .get_result::<models::Booking>(conn)
}

pub fn set_booking_status(
    conn: &mut PgConnection,
    bid: Uuid,
    new_status: BookingStatus,
) -> QueryResult<models::Booking> {
    use crate::schema::bookings::dsl::{bookings, status, updated_at};

    diesel::update(bookings.find(bid))
        .set((status.eq(new_status), updated_at.eq(Utc::now())))
        .get_result::<models::Booking>(conn)
}

pub fn get_payment_by_booking(conn: &mut PgConnection, bid: Uuid) -> QueryResult<Option<models::Payment>> {
    use crate::schema::payments::dsl::{booking_id, payments};

    payments
        .filter(booking_id.eq(bid))
        .first::<models::Payment>(conn)
        .optional()
}

pub fn insert_payment(conn: &mut PgConnection, new_payment: &models::NewPayment) -> QueryResult<models::Payment> {
    use crate::schema::payments::dsl::payments;

    diesel::insert_into(payments)
        .values(new_payment)
        .get_result::<models::Payment>(conn)
}

pub fn settle_payment(
    conn: &mut PgConnection,
    pid: Uuid,
    new_status: PaymentStatus,
    txid: Option<&str>,
) -> QueryResult<models::Payment> {
    use crate::schema::payments::dsl::{payments, status, transaction_id, updated_at};

    diesel::update(payments.find(pid))
        .set((
            status.eq(new_status),
            transaction_id.eq(txid),
            updated_at.eq(Utc::now()),
        ))
        .get_result::<models::Payment>(conn)
}
