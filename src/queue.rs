use amqprs::{
    callbacks::{DefaultChannelCallback, DefaultConnectionCallback},
    channel::{
        BasicAckArguments, BasicConsumeArguments, BasicNackArguments, BasicPublishArguments, Channel,
        ExchangeDeclareArguments, QueueDeclareArguments,
    },
    connection::{Connection, OpenConnectionArguments},
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::AmqpSettings;
use crate::errors::{ErrorKind, ReservationError};
use crate::models::{Booking, BookingStatus, CallbackOutcome, PaymentCallback, PaymentStatus};
use crate::reconciler::PaymentReconciler;
use crate::store::Backend;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Lifecycle event published on the booking events exchange, routed by `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingEvent {
    pub event: String,
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub room_id: Uuid,
    pub status: BookingStatus,
    pub occurred_at: DateTime<Utc>,
}

impl BookingEvent {
    pub fn new(event: &str, booking: &Booking) -> Self {
        Self {
            event: event.to_string(),
            booking_id: booking.id,
            user_id: booking.user_id,
            room_id: booking.room_id,
            status: booking.status,
            occurred_at: Utc::now(),
        }
    }

    pub fn created(booking: &Booking) -> Self {
        Self::new("booking.created", booking)
    }

    pub fn cancelled(booking: &Booking) -> Self {
        Self::new("booking.cancelled", booking)
    }

    /// Event for a callback that changed state, if any.
    pub fn from_callback(outcome: &CallbackOutcome) -> Option<Self> {
        if outcome.already_settled {
            return None;
        }
        match outcome.payment.status {
            PaymentStatus::Success if outcome.booking.status == BookingStatus::Confirmed => {
                Some(Self::new("booking.confirmed", &outcome.booking))
            }
            PaymentStatus::Failed => Some(Self::new("payment.failed", &outcome.booking)),
            _ => None,
        }
    }
}

/// What to tell the broker after a delivery was processed.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Ack,
    Requeue,
    Discard,
}

fn disposition_for(result: &std::result::Result<CallbackOutcome, ReservationError>) -> Disposition {
    match result {
        Ok(_) => Disposition::Ack,
        Err(e) if e.kind() == ErrorKind::Transient => Disposition::Requeue,
        Err(e) if e.kind() == ErrorKind::Validation => Disposition::Discard,
        // Domain failures will not change on redelivery.
        Err(_) => Disposition::Ack,
    }
}

// Consumer feeding gateway callbacks into the reconciler
struct PaymentCallbackConsumer {
    reconciler: Arc<PaymentReconciler<Backend>>,
    queue_service: QueueService,
}

#[async_trait::async_trait]
impl AsyncConsumer for PaymentCallbackConsumer {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let result = self.handle_payment_callback(channel, deliver, content).await;
        if let Err(e) = result {
            error!("Failed to process payment callback: {:?}", e);
        }
    }
}

impl PaymentCallbackConsumer {
    async fn handle_payment_callback(&mut self, channel: &Channel, deliver: Deliver, content: Vec<u8>) -> Result<()> {
        let callback = match serde_json::from_slice::<PaymentCallback>(&content) {
            Ok(callback) => callback,
            Err(e) => {
                error!("Error deserializing payment callback message: {:?}", e);
                // Reject without requeue - malformed message
                channel
                    .basic_nack(BasicNackArguments::new(deliver.delivery_tag(), false, false))
                    .await?;
                return Err(e.into());
            }
        };

        info!("Processing payment callback for booking {}", callback.booking_id);

        let reconciler = Arc::clone(&self.reconciler);
        let job = callback.clone();
        let result = match tokio::task::spawn_blocking(move || {
            reconciler.handle_callback(job.booking_id, &job.transaction_id, &job.status)
        })
        .await
        {
            Ok(result) => result,
            Err(e) => {
                error!("Payment callback worker for booking {} panicked: {:?}", callback.booking_id, e);
                channel
                    .basic_nack(BasicNackArguments::new(deliver.delivery_tag(), false, true))
                    .await?;
                return Err(e.into());
            }
        };

        match disposition_for(&result) {
            Disposition::Ack => {
                channel
                    .basic_ack(BasicAckArguments::new(deliver.delivery_tag(), false))
                    .await?;
            }
            Disposition::Requeue => {
                channel
                    .basic_nack(BasicNackArguments::new(deliver.delivery_tag(), false, true))
                    .await?;
            }
            Disposition::Discard => {
                channel
                    .basic_nack(BasicNackArguments::new(deliver.delivery_tag(), false, false))
                    .await?;
            }
        }

        match result {
            Ok(outcome) => {
                if let Some(event) = BookingEvent::from_callback(&outcome) {
                    self.queue_service.publish_event(event).await?;
                }
            }
            Err(e) => warn!(
                "Payment callback for booking {} rejected with {}: {}",
                callback.booking_id,
                e.code(),
                e
            ),
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct QueueService {
    connection: Option<Arc<Connection>>,
    settings: AmqpSettings,
}

impl QueueService {
    pub fn new(settings: AmqpSettings) -> Self {
        Self {
            connection: None,
            settings,
        }
    }

    pub async fn initialize(&mut self) -> Result<()> {
        info!(
            "Connecting to RabbitMQ at {}:{}...",
            self.settings.host, self.settings.port
        );

        let connection = Connection::open(&OpenConnectionArguments::new(
            &self.settings.host,
            self.settings.port,
            &self.settings.username,
            &self.settings.password,
        ))
        .await?;

        connection.register_callback(DefaultConnectionCallback).await?;

        let setup_channel = connection.open_channel(None).await?;
        setup_channel.register_callback(DefaultChannelCallback).await?;

        // Booking lifecycle events (direct, routed by event name)
        setup_channel
            .exchange_declare(
                ExchangeDeclareArguments::new(&self.settings.booking_events_exchange, "direct")
                    .durable(true)
                    .finish(),
            )
            .await?;

        // Gateway callbacks are delivered here
        setup_channel
            .queue_declare(
                QueueDeclareArguments::new(&self.settings.payment_callback_queue)
                    .durable(true)
                    .finish(),
            )
            .await?;

        self.connection = Some(Arc::new(connection));

        let _ = setup_channel.close().await;

        info!("Connected to RabbitMQ and declared payment callback queue and booking events exchange");

        Ok(())
    }

    async fn get_fresh_channel(&self) -> Result<Channel> {
        if let Some(connection) = &self.connection {
            let channel = connection.open_channel(None).await?;
            channel.register_callback(DefaultChannelCallback).await?;
            Ok(channel)
        } else {
            Err("RabbitMQ connection not initialized".into())
        }
    }

    // Queue failures are logged, never propagated: the database already committed
    async fn safe_queue_operation<F, Fut>(&self, operation: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let max_retries = 2;
        let mut delay_ms = 25;

        for attempt in 1..=max_retries {
            match operation().await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < max_retries => {
                    warn!("Queue operation failed (attempt {}/{}), retrying: {:?}", attempt, max_retries, e);
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    delay_ms *= 2;
                }
                Err(e) => {
                    error!("Queue operation failed after {} attempts, giving up: {:?}", max_retries, e);
                }
            }
        }

        Ok(())
    }

    pub async fn publish_event(&self, event: BookingEvent) -> Result<()> {
        let operation = || {
            let event = event.clone();
            let service = self.clone();

            async move {
                let channel = service.get_fresh_channel().await?;

                let content = serde_json::to_vec(&event)?;
                let properties = BasicProperties::default()
                    .with_delivery_mode(2) // persistent
                    .with_content_type("application/json")
                    .finish();
                let args = BasicPublishArguments::new(&service.settings.booking_events_exchange, &event.event);

                channel.basic_publish(properties, content, args).await?;

                let _ = channel.close().await;

                info!("Published {} for booking {}", event.event, event.booking_id);
                Ok(())
            }
        };

        self.safe_queue_operation(operation).await
    }

    pub async fn start_consuming_payment_callbacks(&self, reconciler: Arc<PaymentReconciler<Backend>>) -> Result<()> {
        let Some(connection) = &self.connection else {
            return Err("RabbitMQ connection not initialized".into());
        };

        info!("Starting payment callback consumer on queue: {}", self.settings.payment_callback_queue);

        let channel = connection.open_channel(None).await?;
        channel.register_callback(DefaultChannelCallback).await?;

        let consumer_tag = format!("payment_callback_consumer_{}", Uuid::new_v4());
        let args = BasicConsumeArguments::new(&self.settings.payment_callback_queue, &consumer_tag)
            .manual_ack(true)
            .finish();

        let consumer = PaymentCallbackConsumer {
            reconciler,
            queue_service: self.clone(),
        };

        tokio::spawn(async move {
            match channel.basic_consume(consumer, args).await {
                Ok(_) => {
                    info!("Payment callback consumer started successfully");
                    // Keep the channel (and with it the consumer) alive
                    loop {
                        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                    }
                }
                Err(e) => {
                    error!("Failed to start payment callback consumer: {:?}", e);
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Payment;

    fn outcome(payment: PaymentStatus, booking: BookingStatus, already_settled: bool) -> CallbackOutcome {
        let now = Utc::now();
        let booking_id = Uuid::new_v4();
        CallbackOutcome {
            booking: Booking {
                id: booking_id,
                user_id: Uuid::new_v4(),
                room_id: Uuid::new_v4(),
                check_in: now,
                check_out: now,
                total_price_minor: 10_000,
                status: booking,
                created_at: now,
                updated_at: now,
            },
            payment: Payment {
                id: Uuid::new_v4(),
                booking_id,
                amount_minor: 10_000,
                status: payment,
                transaction_id: Some("TX-1".to_string()),
                created_at: now,
                updated_at: now,
            },
            already_settled,
            inventory_released: false,
        }
    }

    #[test]
    fn deliveries_are_requeued_only_for_transient_failures() {
        assert_eq!(
            disposition_for(&Err(ReservationError::CallbackFailed("timeout".into()))),
            Disposition::Requeue
        );
        assert_eq!(
            disposition_for(&Err(ReservationError::PaymentNotFound(Uuid::new_v4()))),
            Disposition::Ack
        );
        assert_eq!(
            disposition_for(&Err(ReservationError::InvalidRequest("bad transaction id".into()))),
            Disposition::Discard
        );
        assert_eq!(
            disposition_for(&Ok(outcome(PaymentStatus::Success, BookingStatus::Confirmed, false))),
            Disposition::Ack
        );
    }

    #[test]
    fn callback_events_follow_the_applied_transition() {
        let confirmed = BookingEvent::from_callback(&outcome(PaymentStatus::Success, BookingStatus::Confirmed, false));
        assert_eq!(confirmed.unwrap().event, "booking.confirmed");

        let failed = BookingEvent::from_callback(&outcome(PaymentStatus::Failed, BookingStatus::Cancelled, false));
        assert_eq!(failed.unwrap().event, "payment.failed");

        let late_success = BookingEvent::from_callback(&outcome(PaymentStatus::Success, BookingStatus::Cancelled, false));
        assert!(late_success.is_none());

        let duplicate = BookingEvent::from_callback(&outcome(PaymentStatus::Failed, BookingStatus::Cancelled, true));
        assert!(duplicate.is_none());
    }
}
