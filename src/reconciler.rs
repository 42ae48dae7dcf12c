use std::sync::Arc;

use log::{info, warn};
use regex::Regex;
use uuid::Uuid;

use crate::errors::ReservationError;
use crate::models::{BookingStatus, CallbackOutcome, PaymentStatus};
use crate::retry::RetryPolicy;
use crate::store::InventoryStore;

/// Gateway references are stored in a `varchar(100)` column.
const TRANSACTION_ID_MAX_CHARS: usize = 100;

/// A captured payment must carry a reference that a refund can be issued against.
const CAPTURED_TRANSACTION_ID_PATTERN: &str = r"^[A-Za-z0-9_.:\-]{1,100}$";

/// Applies asynchronous payment outcomes to payments and their bookings.
///
/// Callbacks may be duplicated or arrive after the guest cancelled. A payment
/// settles exactly once; any later callback for it is a no-op.
pub struct PaymentReconciler<S> {
    store: Arc<S>,
    retry: RetryPolicy,
    transaction_id_re: Regex,
}

impl<S: InventoryStore> PaymentReconciler<S> {
    pub fn new(store: Arc<S>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            transaction_id_re: Regex::new(CAPTURED_TRANSACTION_ID_PATTERN).unwrap(),
        }
    }

    pub fn handle_callback(
        &self,
        booking_id: Uuid,
        transaction_id: &str,
        status: &str,
    ) -> Result<CallbackOutcome, ReservationError> {
        let outcome = PaymentStatus::from_gateway(status);
        let transaction_ref = self.transaction_ref(booking_id, outcome, transaction_id)?;

        self.store
            .find_payment_by_booking(booking_id)?
            .ok_or(ReservationError::PaymentNotFound(booking_id))?;
        let booking = self
            .store
            .find_booking(booking_id)?
            .ok_or(ReservationError::BookingNotFound(booking_id))?;

        let result = self
            .retry
            .run("payment_callback", || {
                self.store.in_room_unit(booking.room_id, |unit| {
                    let payment = unit
                        .get_payment_by_booking(booking_id)?
                        .ok_or(ReservationError::PaymentNotFound(booking_id))?;
                    let booking = unit
                        .get_booking(booking_id)?
                        .ok_or(ReservationError::BookingNotFound(booking_id))?;

                    if payment.status.is_terminal() {
                        return Ok(CallbackOutcome {
                            booking,
                            payment,
                            already_settled: true,
                            inventory_released: false,
                        });
                    }

                    let payment = unit.update_payment(payment.id, outcome, transaction_ref)?;
                    let mut inventory_released = false;

                    let booking = match (outcome, booking.status) {
                        (PaymentStatus::Success, BookingStatus::Pending) => {
                            unit.update_booking_status(booking_id, BookingStatus::Confirmed)?
                        }
                        (PaymentStatus::Success, current) => {
                            warn!(
                                "Payment {} for booking {} succeeded while booking is {}; refund required",
                                payment.id,
                                booking_id,
                                current.as_str()
                            );
                            booking
                        }
                        (_, current) if current.is_active() => {
                            match unit.adjust_availability(booking.room_id, 1) {
                                Ok(_) => inventory_released = true,
                                Err(ReservationError::RoomNotFound(room_id)) => warn!(
                                    "Inventory drift: room {} missing while releasing booking {} after failed payment",
                                    room_id, booking_id
                                ),
                                Err(e) => return Err(e),
                            }
                            unit.update_booking_status(booking_id, BookingStatus::Cancelled)?
                        }
                        // Already cancelled or completed: inventory was settled elsewhere.
                        _ => booking,
                    };

                    Ok(CallbackOutcome {
                        booking,
                        payment,
                        already_settled: false,
                        inventory_released,
                    })
                })
            })
            .map_err(|e| e.surface_as(ReservationError::CallbackFailed))?;

        if result.already_settled {
            info!(
                "Duplicate payment callback for booking {} ignored; payment already {}",
                booking_id,
                result.payment.status.as_str()
            );
        } else {
            info!(
                "Payment for booking {} settled as {} (transaction {}); booking now {}",
                booking_id,
                result.payment.status.as_str(),
                transaction_ref.unwrap_or("-"),
                result.booking.status.as_str()
            );
        }
        Ok(result)
    }

    /// Reference to store with the settled payment.
    ///
    /// Declined payments often have no reference yet, so a failure is never rejected
    /// over its id: blank means none and anything longer than the column is cut.
    fn transaction_ref<'a>(
        &self,
        booking_id: Uuid,
        outcome: PaymentStatus,
        transaction_id: &'a str,
    ) -> Result<Option<&'a str>, ReservationError> {
        if outcome == PaymentStatus::Success {
            if self.transaction_id_re.captures(transaction_id).is_none() {
                return Err(ReservationError::InvalidRequest(
                    "transaction_id of a successful payment should be 1-100 characters of letters, digits, '_', '.', ':' or '-'"
                        .to_string(),
                ));
            }
            return Ok(Some(transaction_id));
        }

        let trimmed = transaction_id.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        match trimmed.char_indices().nth(TRANSACTION_ID_MAX_CHARS) {
            Some((cut, _)) => {
                warn!(
                    "Transaction id for booking {} exceeds {} characters; storing it truncated",
                    booking_id, TRANSACTION_ID_MAX_CHARS
                );
                Ok(Some(&trimmed[..cut]))
            }
            None => Ok(Some(trimmed)),
        }
    }
}
