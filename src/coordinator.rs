use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use uuid::Uuid;

use crate::errors::ReservationError;
use crate::models::{
    Booking, BookingDetails, BookingStatus, CancelOutcome, CreateBookingRequest, NewBooking,
    NewPayment, PaymentStatus, Stay,
};
use crate::retry::RetryPolicy;
use crate::store::InventoryStore;

pub struct ReservationCoordinator<S> {
    store: Arc<S>,
    retry: RetryPolicy,
    max_stay_days: i64,
}

impl<S: InventoryStore> ReservationCoordinator<S> {
    pub fn new(store: Arc<S>, retry: RetryPolicy, max_stay_days: i64) -> Self {
        Self {
            store,
            retry,
            max_stay_days,
        }
    }

    /// Accepts a booking if the room is free for the whole stay and has a unit left.
    ///
    /// The overlap check, the availability check and the three writes (booking,
    /// availability decrement, pending payment) run in one unit serialized on the
    /// room, so two racing requests can never both observe the last unit.
    pub fn create_booking(
        &self,
        user_id: Uuid,
        request: &CreateBookingRequest,
    ) -> Result<BookingDetails, ReservationError> {
        let stay = Stay::new(request.check_in, request.check_out, Utc::now(), self.max_stay_days)?;
        let room_id = request.room_id;

        let details = self
            .retry
            .run("create_booking", || {
                self.store.in_room_unit(room_id, |unit| {
                    let overlapping = unit.find_overlapping_bookings(room_id, &stay, &BookingStatus::ACTIVE)?;
                    if !overlapping.is_empty() {
                        return Err(ReservationError::RoomUnavailableForDates);
                    }

                    let room = unit
                        .get_room(room_id)?
                        .ok_or(ReservationError::RoomNotFound(room_id))?;
                    if room.availability <= 0 {
                        return Err(ReservationError::RoomSoldOut);
                    }

                    let total_price_minor = stay.total_price(room.price_per_night_minor)?;
                    let booking = unit.create_booking(&NewBooking {
                        user_id,
                        room_id,
                        check_in: stay.check_in,
                        check_out: stay.check_out,
                        total_price_minor,
                        status: BookingStatus::Pending,
                    })?;
                    let room = unit.adjust_availability(room_id, -1)?;
                    let payment = unit.create_payment(&NewPayment {
                        booking_id: booking.id,
                        amount_minor: total_price_minor,
                        status: PaymentStatus::Pending,
                    })?;

                    Ok(BookingDetails {
                        booking,
                        room: Some(room),
                        payment: Some(payment),
                    })
                })
            })
            .map_err(|e| e.surface_as(ReservationError::BookingFailed))?;

        info!(
            "Booking {} created for room {} by user {} ({} minor units, availability now {})",
            details.booking.id,
            room_id,
            user_id,
            details.booking.total_price_minor,
            details.room.as_ref().map(|r| r.availability).unwrap_or_default()
        );
        Ok(details)
    }

    /// Cancels a booking owned by `user_id` and returns its unit of inventory.
    ///
    /// The ownership and status checks are repeated inside the room unit because a
    /// concurrent cancel or payment failure may have moved the booking meanwhile.
    pub fn cancel_booking(&self, user_id: Uuid, booking_id: Uuid) -> Result<CancelOutcome, ReservationError> {
        let booking = self
            .store
            .find_booking(booking_id)?
            .ok_or(ReservationError::BookingNotFound(booking_id))?;
        ensure_cancellable(&booking, user_id)?;

        let outcome = self
            .retry
            .run("cancel_booking", || {
                self.store.in_room_unit(booking.room_id, |unit| {
                    let current = unit
                        .get_booking(booking_id)?
                        .ok_or(ReservationError::BookingNotFound(booking_id))?;
                    ensure_cancellable(&current, user_id)?;

                    let inventory_restored = match unit.adjust_availability(current.room_id, 1) {
                        Ok(_) => true,
                        Err(ReservationError::RoomNotFound(room_id)) => {
                            warn!(
                                "Inventory drift: room {} missing while cancelling booking {}; availability not restored",
                                room_id, booking_id
                            );
                            false
                        }
                        Err(e) => return Err(e),
                    };

                    let cancelled = unit.update_booking_status(booking_id, BookingStatus::Cancelled)?;
                    Ok(CancelOutcome {
                        booking: cancelled,
                        inventory_restored,
                    })
                })
            })
            .map_err(|e| e.surface_as(ReservationError::CancelFailed))?;

        info!("Booking {} cancelled by user {}", booking_id, user_id);
        Ok(outcome)
    }

    pub fn user_bookings(&self, user_id: Uuid) -> Result<Vec<Booking>, ReservationError> {
        self.store.bookings_for_user(user_id)
    }

    /// Booking with its room and payment, visible to its owner only.
    pub fn booking_details(&self, user_id: Uuid, booking_id: Uuid) -> Result<BookingDetails, ReservationError> {
        let booking = self
            .store
            .find_booking(booking_id)?
            .ok_or(ReservationError::BookingNotFound(booking_id))?;
        if booking.user_id != user_id {
            return Err(ReservationError::NotAuthorized(booking_id));
        }

        let room = self.store.find_room(booking.room_id)?;
        let payment = self.store.find_payment_by_booking(booking_id)?;
        Ok(BookingDetails { booking, room, payment })
    }
}

fn ensure_cancellable(booking: &Booking, user_id: Uuid) -> Result<(), ReservationError> {
    if booking.user_id != user_id {
        return Err(ReservationError::NotAuthorized(booking.id));
    }
    match booking.status {
        BookingStatus::Cancelled => Err(ReservationError::AlreadyCancelled(booking.id)),
        BookingStatus::Completed => Err(ReservationError::CannotCancelCompleted(booking.id)),
        BookingStatus::Pending | BookingStatus::Confirmed => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::test_support::{active_bookings_overlap, coordinator, request, seeded_room};
    use chrono::Duration;
    use std::sync::{mpsc, Barrier};
    use std::thread;

    #[test]
    fn book_cancel_rebook_scenario() {
        let store = Arc::new(MemoryStore::new());
        let room = seeded_room(&store, 1, 10_000);
        let coordinator = coordinator(&store);
        let guest = Uuid::new_v4();

        let first = coordinator.create_booking(guest, &request(room.id, 5, 2)).unwrap();
        assert_eq!(first.booking.total_price_minor, 20_000);
        assert_eq!(first.booking.status, BookingStatus::Pending);
        assert_eq!(first.payment.as_ref().unwrap().amount_minor, 20_000);
        assert_eq!(first.payment.as_ref().unwrap().status, PaymentStatus::Pending);
        assert_eq!(store.find_room(room.id).unwrap().unwrap().availability, 0);

        let second = coordinator.create_booking(Uuid::new_v4(), &request(room.id, 6, 2));
        assert!(matches!(second, Err(ReservationError::RoomUnavailableForDates)));

        let outcome = coordinator.cancel_booking(guest, first.booking.id).unwrap();
        assert!(outcome.inventory_restored);
        assert_eq!(outcome.booking.status, BookingStatus::Cancelled);
        assert_eq!(store.find_room(room.id).unwrap().unwrap().availability, 1);

        coordinator.create_booking(Uuid::new_v4(), &request(room.id, 5, 2)).unwrap();
        assert_eq!(store.find_room(room.id).unwrap().unwrap().availability, 0);
    }

    #[test]
    fn sold_out_room_rejects_non_overlapping_dates() {
        let store = Arc::new(MemoryStore::new());
        let room = seeded_room(&store, 1, 10_000);
        let coordinator = coordinator(&store);

        coordinator.create_booking(Uuid::new_v4(), &request(room.id, 5, 2)).unwrap();
        let result = coordinator.create_booking(Uuid::new_v4(), &request(room.id, 10, 2));
        assert!(matches!(result, Err(ReservationError::RoomSoldOut)));
    }

    #[test]
    fn equal_dates_are_rejected_without_state_change() {
        let store = Arc::new(MemoryStore::new());
        let room = seeded_room(&store, 1, 10_000);
        let coordinator = coordinator(&store);
        let user = Uuid::new_v4();

        let mut req = request(room.id, 5, 1);
        req.check_out = req.check_in;
        let result = coordinator.create_booking(user, &req);

        assert!(matches!(result, Err(ReservationError::InvalidRequest(_))));
        assert_eq!(store.find_room(room.id).unwrap().unwrap().availability, 1);
        assert!(store.bookings_for_user(user).unwrap().is_empty());
    }

    #[test]
    fn stay_over_thirty_days_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let room = seeded_room(&store, 1, 10_000);
        let result = coordinator(&store).create_booking(Uuid::new_v4(), &request(room.id, 5, 31));
        assert!(matches!(result, Err(ReservationError::InvalidRequest(_))));
    }

    #[test]
    fn unknown_room_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let result = coordinator(&store).create_booking(Uuid::new_v4(), &request(Uuid::new_v4(), 5, 2));
        assert!(matches!(result, Err(ReservationError::RoomNotFound(_))));
    }

    #[test]
    fn unpriceable_stay_leaves_inventory_untouched() {
        let store = Arc::new(MemoryStore::new());
        let room = seeded_room(&store, 1, i64::MAX);
        let coordinator = coordinator(&store);

        let guest = Uuid::new_v4();

        let result = coordinator.create_booking(guest, &request(room.id, 5, 2));

        assert!(matches!(result, Err(ReservationError::InvalidRequest(_))));
        assert_eq!(store.find_room(room.id).unwrap().unwrap().availability, 1);
        assert!(coordinator.user_bookings(guest).unwrap().is_empty());
    }

    #[test]
    fn cancelling_twice_restores_inventory_once() {
        let store = Arc::new(MemoryStore::new());
        let room = seeded_room(&store, 1, 10_000);
        let coordinator = coordinator(&store);
        let guest = Uuid::new_v4();

        let booking = coordinator.create_booking(guest, &request(room.id, 5, 2)).unwrap().booking;
        coordinator.cancel_booking(guest, booking.id).unwrap();
        let again = coordinator.cancel_booking(guest, booking.id);

        assert!(matches!(again, Err(ReservationError::AlreadyCancelled(_))));
        assert_eq!(store.find_room(room.id).unwrap().unwrap().availability, 1);
    }

    #[test]
    fn only_the_owner_may_cancel() {
        let store = Arc::new(MemoryStore::new());
        let room = seeded_room(&store, 1, 10_000);
        let coordinator = coordinator(&store);

        let booking = coordinator
            .create_booking(Uuid::new_v4(), &request(room.id, 5, 2))
            .unwrap()
            .booking;
        let result = coordinator.cancel_booking(Uuid::new_v4(), booking.id);

        assert!(matches!(result, Err(ReservationError::NotAuthorized(_))));
        assert_eq!(store.find_room(room.id).unwrap().unwrap().availability, 0);
    }

    #[test]
    fn completed_booking_cannot_be_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let room = seeded_room(&store, 1, 10_000);
        let coordinator = coordinator(&store);
        let guest = Uuid::new_v4();

        let booking = coordinator.create_booking(guest, &request(room.id, 5, 2)).unwrap().booking;
        store
            .in_room_unit(room.id, |unit| unit.update_booking_status(booking.id, BookingStatus::Completed))
            .unwrap();

        let result = coordinator.cancel_booking(guest, booking.id);
        assert!(matches!(result, Err(ReservationError::CannotCancelCompleted(_))));
        assert_eq!(store.find_room(room.id).unwrap().unwrap().availability, 0);
    }

    #[test]
    fn cancel_of_unknown_booking_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let result = coordinator(&store).cancel_booking(Uuid::new_v4(), Uuid::new_v4());
        assert!(matches!(result, Err(ReservationError::BookingNotFound(_))));
    }

    #[test]
    fn cancel_with_missing_room_still_records_cancellation() {
        let store = Arc::new(MemoryStore::new());
        let room = seeded_room(&store, 1, 10_000);
        let coordinator = coordinator(&store);
        let guest = Uuid::new_v4();

        let booking = coordinator.create_booking(guest, &request(room.id, 5, 2)).unwrap().booking;
        store.remove_room(room.id).unwrap();

        let outcome = coordinator.cancel_booking(guest, booking.id).unwrap();
        assert!(!outcome.inventory_restored);
        assert_eq!(outcome.booking.status, BookingStatus::Cancelled);
        assert_eq!(
            store.find_booking(booking.id).unwrap().unwrap().status,
            BookingStatus::Cancelled
        );
    }

    #[test]
    fn racing_requests_for_the_last_unit_produce_one_booking() {
        let store = Arc::new(MemoryStore::new());
        let room = seeded_room(&store, 1, 10_000);
        let coordinator = Arc::new(coordinator(&store));
        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                let barrier = Arc::clone(&barrier);
                let req = request(room.id, 5, 2);
                thread::spawn(move || {
                    barrier.wait();
                    coordinator.create_booking(Uuid::new_v4(), &req)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        for failure in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(matches!(
                failure,
                ReservationError::RoomUnavailableForDates | ReservationError::RoomSoldOut
            ));
        }
        assert_eq!(store.find_room(room.id).unwrap().unwrap().availability, 0);
    }

    #[test]
    fn racing_requests_never_exceed_availability() {
        let store = Arc::new(MemoryStore::new());
        let available = 3;
        let room = seeded_room(&store, available, 10_000);
        let coordinator = Arc::new(coordinator(&store));
        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));

        // Disjoint weeks, so only availability can turn requests away.
        let handles: Vec<_> = (0..contenders)
            .map(|i| {
                let coordinator = Arc::clone(&coordinator);
                let barrier = Arc::clone(&barrier);
                let req = request(room.id, 2 + 7 * i as i64, 3);
                thread::spawn(move || {
                    barrier.wait();
                    coordinator.create_booking(Uuid::new_v4(), &req)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), available as usize);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(ReservationError::RoomSoldOut)))
                .count(),
            contenders - available as usize
        );
        assert_eq!(store.find_room(room.id).unwrap().unwrap().availability, 0);
    }

    #[test]
    fn concurrent_creates_and_cancels_conserve_inventory() {
        let store = Arc::new(MemoryStore::new());
        let initial = 4;
        let room = seeded_room(&store, initial, 10_000);
        let coordinator = Arc::new(coordinator(&store));
        let workers = 6;
        let barrier = Arc::new(Barrier::new(workers));

        let handles: Vec<_> = (0..workers)
            .map(|w| {
                let coordinator = Arc::clone(&coordinator);
                let barrier = Arc::clone(&barrier);
                let room_id = room.id;
                thread::spawn(move || {
                    let guest = Uuid::new_v4();
                    let (mut created, mut cancelled) = (0, 0);
                    barrier.wait();
                    for round in 0..10 {
                        // Workers share a small window of dates so overlaps are frequent.
                        let offset = 2 + ((w + round) % 4) as i64;
                        if let Ok(details) = coordinator.create_booking(guest, &request(room_id, offset, 2)) {
                            created += 1;
                            if round % 2 == 0
                                && coordinator.cancel_booking(guest, details.booking.id).is_ok()
                            {
                                cancelled += 1;
                            }
                        }
                    }
                    (created, cancelled)
                })
            })
            .collect();

        let (created, cancelled) = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .fold((0, 0), |acc, (c, x)| (acc.0 + c, acc.1 + x));

        let availability = store.find_room(room.id).unwrap().unwrap().availability;
        assert_eq!(availability, initial - created + cancelled);
        assert!(availability >= 0);

        let shard_bookings: Vec<Booking> = store
            .in_room_unit(room.id, |unit| {
                let window = Stay {
                    check_in: Utc::now(),
                    check_out: Utc::now() + Duration::days(60),
                };
                unit.find_overlapping_bookings(room.id, &window, &BookingStatus::ACTIVE)
            })
            .unwrap();
        assert!(!active_bookings_overlap(&shard_bookings));
    }

    #[test]
    fn units_on_different_rooms_do_not_block_each_other() {
        let store = Arc::new(MemoryStore::new());
        let busy = seeded_room(&store, 1, 10_000);
        let free = seeded_room(&store, 1, 10_000);
        let coordinator = coordinator(&store);

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let holder = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store.in_room_unit(busy.id, |_unit| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
            })
        };

        entered_rx.recv().unwrap();
        let booked = coordinator.create_booking(Uuid::new_v4(), &request(free.id, 5, 2));
        release_tx.send(()).unwrap();

        assert!(booked.is_ok());
        holder.join().unwrap().unwrap();
    }

    #[test]
    fn user_bookings_are_newest_first_and_details_are_owner_only() {
        let store = Arc::new(MemoryStore::new());
        let room = seeded_room(&store, 2, 10_000);
        let coordinator = coordinator(&store);
        let guest = Uuid::new_v4();

        let older = coordinator.create_booking(guest, &request(room.id, 5, 2)).unwrap().booking;
        thread::sleep(std::time::Duration::from_millis(5));
        let newer = coordinator.create_booking(guest, &request(room.id, 10, 2)).unwrap().booking;

        let listed = coordinator.user_bookings(guest).unwrap();
        assert_eq!(
            listed.iter().map(|b| b.id).collect::<Vec<_>>(),
            vec![newer.id, older.id]
        );

        let details = coordinator.booking_details(guest, older.id).unwrap();
        assert_eq!(details.room.unwrap().id, room.id);
        assert_eq!(details.payment.unwrap().booking_id, older.id);

        let stranger = coordinator.booking_details(Uuid::new_v4(), older.id);
        assert!(matches!(stranger, Err(ReservationError::NotAuthorized(_))));
    }
}
