use diesel::{
    prelude::*,
    r2d2::{ConnectionManager, Pool},
};
use uuid::Uuid;

use crate::actions;
use crate::errors::ReservationError;
use crate::memory::MemoryStore;
use crate::models::{Booking, BookingStatus, NewBooking, NewPayment, Payment, PaymentStatus, Room, Stay};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

/// Reads and writes available inside one atomic unit scoped to a single room.
/// Nothing written through it is visible to others until the unit commits, and
/// returning an error from the unit discards every write.
pub trait UnitOfWork {
    fn find_overlapping_bookings(
        &mut self,
        room_id: Uuid,
        stay: &Stay,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>, ReservationError>;

    fn get_room(&mut self, room_id: Uuid) -> Result<Option<Room>, ReservationError>;

    /// Fails with `RoomSoldOut` rather than letting availability go negative.
    fn adjust_availability(&mut self, room_id: Uuid, delta: i32) -> Result<Room, ReservationError>;

    fn get_booking(&mut self, booking_id: Uuid) -> Result<Option<Booking>, ReservationError>;

    fn get_payment_by_booking(&mut self, booking_id: Uuid) -> Result<Option<Payment>, ReservationError>;

    fn create_booking(&mut self, booking: &NewBooking) -> Result<Booking, ReservationError>;

    fn update_booking_status(
        &mut self,
        booking_id: Uuid,
        status: BookingStatus,
    ) -> Result<Booking, ReservationError>;

    fn create_payment(&mut self, payment: &NewPayment) -> Result<Payment, ReservationError>;

    fn update_payment(
        &mut self,
        payment_id: Uuid,
        status: PaymentStatus,
        transaction_id: Option<&str>,
    ) -> Result<Payment, ReservationError>;
}

pub trait InventoryStore: Send + Sync {
    /// Runs `work` serialized against every other unit on the same room.
    /// Units on different rooms proceed in parallel.
    fn in_room_unit<T, F>(&self, room_id: Uuid, work: F) -> Result<T, ReservationError>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, ReservationError>;

    fn find_room(&self, room_id: Uuid) -> Result<Option<Room>, ReservationError>;

    fn find_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, ReservationError>;

    fn find_payment_by_booking(&self, booking_id: Uuid) -> Result<Option<Payment>, ReservationError>;

    fn bookings_for_user(&self, user_id: Uuid) -> Result<Vec<Booking>, ReservationError>;
}

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

struct PgUnit<'a> {
    conn: &'a mut PgConnection,
}

impl UnitOfWork for PgUnit<'_> {
    fn find_overlapping_bookings(
        &mut self,
        room_id: Uuid,
        stay: &Stay,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>, ReservationError> {
        Ok(actions::find_overlapping_bookings(self.conn, room_id, stay, statuses)?)
    }

    fn get_room(&mut self, room_id: Uuid) -> Result<Option<Room>, ReservationError> {
        Ok(actions::get_room(self.conn, room_id)?)
    }

    fn adjust_availability(&mut self, room_id: Uuid, delta: i32) -> Result<Room, ReservationError> {
        actions::adjust_availability(self.conn, room_id, delta)
    }

    fn get_booking(&mut self, booking_id: Uuid) -> Result<Option<Booking>, ReservationError> {
        Ok(actions::get_booking(self.conn, booking_id)?)
    }

    fn get_payment_by_booking(&mut self, booking_id: Uuid) -> Result<Option<Payment>, ReservationError> {
        Ok(actions::get_payment_by_booking(self.conn, booking_id)?)
    }

    fn create_booking(&mut self, booking: &NewBooking) -> Result<Booking, ReservationError> {
        Ok(actions::insert_booking(self.conn, booking)?)
    }

    fn update_booking_status(
        &mut self,
        booking_id: Uuid,
        status: BookingStatus,
    ) -> Result<Booking, ReservationError> {
        Ok(actions::set_booking_status(self.conn, booking_id, status)?)
    }

    fn create_payment(&mut self, payment: &NewPayment) -> Result<Payment, ReservationError> {
        Ok(actions::insert_payment(self.conn, payment)?)
    }

    fn update_payment(
        &mut self,
        payment_id: Uuid,
        status: PaymentStatus,
        transaction_id: Option<&str>,
    ) -> Result<Payment, ReservationError> {
        Ok(actions::settle_payment(self.conn, payment_id, status, transaction_id)?)
    }
}

impl InventoryStore for PgStore {
    fn in_room_unit<T, F>(&self, room_id: Uuid, work: F) -> Result<T, ReservationError>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, ReservationError>,
    {
        let mut conn = self.pool.get()?;

        conn.transaction(|conn| {
            // Row lock on the room serializes every unit touching it until commit.
            // A missing room is left to `work` to report.
            actions::lock_room(conn, room_id)?;
            let mut unit = PgUnit { conn };
            work(&mut unit)
        })
    }

    fn find_room(&self, room_id: Uuid) -> Result<Option<Room>, ReservationError> {
        let mut conn = self.pool.get()?;
        Ok(actions::get_room(&mut conn, room_id)?)
    }

    fn find_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, ReservationError> {
        let mut conn = self.pool.get()?;
        Ok(actions::get_booking(&mut conn, booking_id)?)
    }

    fn find_payment_by_booking(&self, booking_id: Uuid) -> Result<Option<Payment>, ReservationError> {
        let mut conn = self.pool.get()?;
        Ok(actions::get_payment_by_booking(&mut conn, booking_id)?)
    }

    fn bookings_for_user(&self, user_id: Uuid) -> Result<Vec<Booking>, ReservationError> {
        let mut conn = self.pool.get()?;
        Ok(actions::bookings_for_user(&mut conn, user_id)?)
    }
}

/// Store selected at startup.
pub enum Backend {
    Postgres(PgStore),
    Memory(MemoryStore),
}

impl InventoryStore for Backend {
    fn in_room_unit<T, F>(&self, room_id: Uuid, work: F) -> Result<T, ReservationError>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, ReservationError>,
    {
        match self {
            Backend::Postgres(store) => store.in_room_unit(room_id, work),
            Backend::Memory(store) => store.in_room_unit(room_id, work),
        }
    }

    fn find_room(&self, room_id: Uuid) -> Result<Option<Room>, ReservationError> {
        match self {
            Backend::Postgres(store) => store.find_room(room_id),
            Backend::Memory(store) => store.find_room(room_id),
        }
    }

    fn find_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, ReservationError> {
        match self {
            Backend::Postgres(store) => store.find_booking(booking_id),
            Backend::Memory(store) => store.find_booking(booking_id),
        }
    }

    fn find_payment_by_booking(&self, booking_id: Uuid) -> Result<Option<Payment>, ReservationError> {
        match self {
            Backend::Postgres(store) => store.find_payment_by_booking(booking_id),
            Backend::Memory(store) => store.find_payment_by_booking(booking_id),
        }
    }

    fn bookings_for_user(&self, user_id: Uuid) -> Result<Vec<Booking>, ReservationError> {
        match self {
            Backend::Postgres(store) => store.bookings_for_user(user_id),
            Backend::Memory(store) => store.bookings_for_user(user_id),
        }
    }
}
