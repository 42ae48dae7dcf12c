use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::coordinator::ReservationCoordinator;
use crate::memory::MemoryStore;
use crate::models::{Booking, CreateBookingRequest, Room};
use crate::reconciler::PaymentReconciler;
use crate::retry::RetryPolicy;

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: StdDuration::from_millis(1),
    }
}

pub fn seeded_room(store: &MemoryStore, availability: i32, price_per_night_minor: i64) -> Room {
    let now = Utc::now();
    let room = Room {
        id: Uuid::new_v4(),
        hotel_id: Uuid::new_v4(),
        room_type: "DELUXE".to_string(),
        price_per_night_minor,
        availability,
        created_at: now,
        updated_at: now,
    };
    store.insert_room(room.clone()).unwrap();
    room
}

pub fn coordinator(store: &Arc<MemoryStore>) -> ReservationCoordinator<MemoryStore> {
    ReservationCoordinator::new(Arc::clone(store), fast_retry(), 30)
}

pub fn reconciler(store: &Arc<MemoryStore>) -> PaymentReconciler<MemoryStore> {
    PaymentReconciler::new(Arc::clone(store), fast_retry())
}

/// Stay of `nights` starting `days_from_now` days ahead.
pub fn request(room_id: Uuid, days_from_now: i64, nights: i64) -> CreateBookingRequest {
    let check_in = Utc::now() + Duration::days(days_from_now);
    CreateBookingRequest {
        room_id,
        check_in,
        check_out: check_in + Duration::days(nights),
    }
}

pub fn active_bookings_overlap(bookings: &[Booking]) -> bool {
    let active: Vec<_> = bookings.iter().filter(|b| b.status.is_active()).collect();
    active.iter().enumerate().any(|(i, a)| {
        active[i + 1..]
            .iter()
            .any(|b| a.room_id == b.room_id && a.overlaps(b.check_in, b.check_out))
    })
}
