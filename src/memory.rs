//! In-process inventory store.
//!
//! Every room owns a shard guarded by its own mutex, so units on different rooms
//! never contend. A unit works on a copy of the shard and swaps it back in only
//! when the work succeeds, which gives all-or-nothing commits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::ReservationError;
use crate::models::{Booking, BookingStatus, NewBooking, NewPayment, Payment, PaymentStatus, Room, Stay};
use crate::store::{InventoryStore, UnitOfWork};

#[derive(Debug, Clone, Default)]
struct RoomShard {
    room: Option<Room>,
    bookings: Vec<Booking>,
    payments: Vec<Payment>,
}

/// Room definition accepted by the seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedRoom {
    pub id: Uuid,
    pub hotel_id: Uuid,
    pub room_type: String,
    pub price_per_night_minor: i64,
    pub availability: i32,
}

#[derive(Default)]
pub struct MemoryStore {
    shards: RwLock<HashMap<Uuid, Arc<Mutex<RoomShard>>>>,
    booking_rooms: RwLock<HashMap<Uuid, Uuid>>,
}

fn poisoned<T>(_: T) -> ReservationError {
    ReservationError::Store("memory store lock poisoned".to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(rooms: Vec<SeedRoom>) -> Result<Self, ReservationError> {
        let store = Self::new();
        for seed in rooms {
            let now = Utc::now();
            store.insert_room(Room {
                id: seed.id,
                hotel_id: seed.hotel_id,
                room_type: seed.room_type,
                price_per_night_minor: seed.price_per_night_minor,
                availability: seed.availability,
                created_at: now,
                updated_at: now,
            })?;
        }
        Ok(store)
    }

    pub fn insert_room(&self, room: Room) -> Result<(), ReservationError> {
        if room.price_per_night_minor <= 0 || room.availability < 0 {
            return Err(ReservationError::InvalidRequest(format!(
                "room {} needs a positive price and non-negative availability",
                room.id
            )));
        }
        let shard = self.shard_or_insert(room.id)?;
        let mut guard = shard.lock().map_err(poisoned)?;
        guard.room = Some(room);
        Ok(())
    }

    /// Drops the room row but keeps its bookings, like a hard delete that skipped the cascade.
    #[cfg(test)]
    pub fn remove_room(&self, room_id: Uuid) -> Result<(), ReservationError> {
        if let Some(shard) = self.shard(room_id)? {
            shard.lock().map_err(poisoned)?.room = None;
        }
        Ok(())
    }

    fn shard(&self, room_id: Uuid) -> Result<Option<Arc<Mutex<RoomShard>>>, ReservationError> {
        Ok(self.shards.read().map_err(poisoned)?.get(&room_id).cloned())
    }

    fn shard_or_insert(&self, room_id: Uuid) -> Result<Arc<Mutex<RoomShard>>, ReservationError> {
        if let Some(shard) = self.shard(room_id)? {
            return Ok(shard);
        }
        let mut shards = self.shards.write().map_err(poisoned)?;
        Ok(shards.entry(room_id).or_default().clone())
    }
}

struct MemoryUnit<'a> {
    room_id: Uuid,
    shard: &'a mut RoomShard,
    created_bookings: Vec<Uuid>,
}

impl MemoryUnit<'_> {
    fn ensure_scope(&self, room_id: Uuid) -> Result<(), ReservationError> {
        if room_id != self.room_id {
            return Err(ReservationError::Store(format!(
                "room {} is outside the unit locked on room {}",
                room_id, self.room_id
            )));
        }
        Ok(())
    }

    fn booking_mut(&mut self, booking_id: Uuid) -> Result<&mut Booking, ReservationError> {
        self.shard
            .bookings
            .iter_mut()
            .find(|b| b.id == booking_id)
            .ok_or(ReservationError::BookingNotFound(booking_id))
    }
}

impl UnitOfWork for MemoryUnit<'_> {
    fn find_overlapping_bookings(
        &mut self,
        room_id: Uuid,
        stay: &Stay,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>, ReservationError> {
        self.ensure_scope(room_id)?;
        Ok(self
            .shard
            .bookings
            .iter()
            .filter(|b| statuses.contains(&b.status) && b.overlaps(stay.check_in, stay.check_out))
            .cloned()
            .collect())
    }

    fn get_room(&mut self, room_id: Uuid) -> Result<Option<Room>, ReservationError> {
        self.ensure_scope(room_id)?;
        Ok(self.shard.room.clone())
    }

    fn adjust_availability(&mut self, room_id: Uuid, delta: i32) -> Result<Room, ReservationError> {
        self.ensure_scope(room_id)?;
        let room = self
            .shard
            .room
            .as_mut()
            .ok_or(ReservationError::RoomNotFound(room_id))?;

        let next = room.availability + delta;
        if next < 0 {
            return Err(ReservationError::RoomSoldOut);
        }
        room.availability = next;
        room.updated_at = Utc::now();
        Ok(room.clone())
    }

    fn get_booking(&mut self, booking_id: Uuid) -> Result<Option<Booking>, ReservationError> {
        Ok(self.shard.bookings.iter().find(|b| b.id == booking_id).cloned())
    }

    fn get_payment_by_booking(&mut self, booking_id: Uuid) -> Result<Option<Payment>, ReservationError> {
        Ok(self
            .shard
            .payments
            .iter()
            .find(|p| p.booking_id == booking_id)
            .cloned())
    }

    fn create_booking(&mut self, booking: &NewBooking) -> Result<Booking, ReservationError> {
        self.ensure_scope(booking.room_id)?;
        let now = Utc::now();
        let created = Booking {
            id: Uuid::new_v4(),
            user_id: booking.user_id,
            room_id: booking.room_id,
            check_in: booking.check_in,
            check_out: booking.check_out,
            total_price_minor: booking.total_price_minor,
            status: booking.status,
            created_at: now,
            updated_at: now,
        };
        self.shard.bookings.push(created.clone());
        self.created_bookings.push(created.id);
        Ok(created)
    }

    fn update_booking_status(
        &mut self,
        booking_id: Uuid,
        status: BookingStatus,
    ) -> Result<Booking, ReservationError> {
        let booking = self.booking_mut(booking_id)?;
        booking.status = status;
        booking.updated_at = Utc::now();
        Ok(booking.clone())
    }

    fn create_payment(&mut self, payment: &NewPayment) -> Result<Payment, ReservationError> {
        if !self.shard.bookings.iter().any(|b| b.id == payment.booking_id) {
            return Err(ReservationError::BookingNotFound(payment.booking_id));
        }
        if self.shard.payments.iter().any(|p| p.booking_id == payment.booking_id) {
            return Err(ReservationError::Store(format!(
                "payment for booking {} already exists",
                payment.booking_id
            )));
        }
        let now = Utc::now();
        let created = Payment {
            id: Uuid::new_v4(),
            booking_id: payment.booking_id,
            amount_minor: payment.amount_minor,
            status: payment.status,
            transaction_id: None,
            created_at: now,
            updated_at: now,
        };
        self.shard.payments.push(created.clone());
        Ok(created)
    }

    fn update_payment(
        &mut self,
        payment_id: Uuid,
        status: PaymentStatus,
        transaction_id: Option<&str>,
    ) -> Result<Payment, ReservationError> {
        let payment = self
            .shard
            .payments
            .iter_mut()
            .find(|p| p.id == payment_id)
            .ok_or_else(|| ReservationError::Store(format!("payment {} not found", payment_id)))?;
        payment.status = status;
        payment.transaction_id = transaction_id.map(str::to_string);
        payment.updated_at = Utc::now();
        Ok(payment.clone())
    }
}

impl InventoryStore for MemoryStore {
    fn in_room_unit<T, F>(&self, room_id: Uuid, work: F) -> Result<T, ReservationError>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, ReservationError>,
    {
        let Some(shard) = self.shard(room_id)? else {
            // Unknown room: run against an empty scratch shard that is never committed.
            let mut scratch = RoomShard::default();
            let mut unit = MemoryUnit {
                room_id,
                shard: &mut scratch,
                created_bookings: Vec::new(),
            };
            return work(&mut unit);
        };

        let mut guard = shard.lock().map_err(poisoned)?;
        let mut working = guard.clone();
        let mut unit = MemoryUnit {
            room_id,
            shard: &mut working,
            created_bookings: Vec::new(),
        };

        let result = work(&mut unit)?;
        let created = std::mem::take(&mut unit.created_bookings);

        // Index new bookings before the shard lock is released so lookups by id
        // never miss a committed booking.
        if !created.is_empty() {
            let mut index = self.booking_rooms.write().map_err(poisoned)?;
            for booking_id in created {
                index.insert(booking_id, room_id);
            }
        }
        *guard = working;
        Ok(result)
    }

    fn find_room(&self, room_id: Uuid) -> Result<Option<Room>, ReservationError> {
        match self.shard(room_id)? {
            Some(shard) => Ok(shard.lock().map_err(poisoned)?.room.clone()),
            None => Ok(None),
        }
    }

    fn find_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, ReservationError> {
        let room_id = match self.booking_rooms.read().map_err(poisoned)?.get(&booking_id) {
            Some(room_id) => *room_id,
            None => return Ok(None),
        };
        match self.shard(room_id)? {
            Some(shard) => Ok(shard
                .lock()
                .map_err(poisoned)?
                .bookings
                .iter()
                .find(|b| b.id == booking_id)
                .cloned()),
            None => Ok(None),
        }
    }

    fn find_payment_by_booking(&self, booking_id: Uuid) -> Result<Option<Payment>, ReservationError> {
        let room_id = match self.booking_rooms.read().map_err(poisoned)?.get(&booking_id) {
            Some(room_id) => *room_id,
            None => return Ok(None),
        };
        match self.shard(room_id)? {
            Some(shard) => Ok(shard
                .lock()
                .map_err(poisoned)?
                .payments
                .iter()
                .find(|p| p.booking_id == booking_id)
                .cloned()),
            None => Ok(None),
        }
    }

    fn bookings_for_user(&self, user_id: Uuid) -> Result<Vec<Booking>, ReservationError> {
        let shards: Vec<_> = self.shards.read().map_err(poisoned)?.values().cloned().collect();
        let mut found = Vec::new();
        for shard in shards {
            let guard = shard.lock().map_err(poisoned)?;
            found.extend(guard.bookings.iter().filter(|b| b.user_id == user_id).cloned());
        }
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }
}
