use std::future::{ready, Ready};
use std::sync::Arc;

use actix_web::{dev::Payload, error, get, patch, post, web, FromRequest, HttpRequest, HttpResponse, Responder};
use uuid::Uuid;

use crate::coordinator::ReservationCoordinator;
use crate::errors::{ErrorBody, ErrorKind, ReservationError};
use crate::models::{ApiResponse, CreateBookingRequest, PaymentCallback};
use crate::queue::{BookingEvent, QueueService};
use crate::reconciler::PaymentReconciler;
use crate::store::Backend;

/// Header carrying the caller's id, set by the upstream auth gateway.
pub const USER_ID_HEADER: &str = "X-User-Id";

pub struct AppState {
    pub coordinator: Arc<ReservationCoordinator<Backend>>,
    pub reconciler: Arc<PaymentReconciler<Backend>>,
    pub queue: Option<QueueService>,
}

impl AppState {
    // Events are best effort; the store has already committed
    fn publish(&self, event: BookingEvent) {
        if let Some(queue) = self.queue.clone() {
            tokio::spawn(async move {
                if let Err(e) = queue.publish_event(event).await {
                    log::error!("Failed to publish booking event: {:?}", e);
                }
            });
        }
    }
}

pub struct AuthenticatedUser(pub Uuid);

impl FromRequest for AuthenticatedUser {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let user_id = req
            .headers()
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok());

        ready(match user_id {
            Some(id) => Ok(AuthenticatedUser(id)),
            None => Err(error::InternalError::from_response(
                "missing or malformed user id header",
                HttpResponse::Unauthorized().json(ErrorBody::new(
                    "UNAUTHORIZED",
                    format!("{} header with a valid user id is required", USER_ID_HEADER),
                )),
            )
            .into()),
        })
    }
}

fn log_failure(operation: &str, e: &ReservationError) {
    match e.kind() {
        ErrorKind::Transient => log::error!("Failed to {}: {:?}", operation, e),
        _ => log::warn!("Failed to {}: {}", operation, e),
    }
}

#[post("/bookings")]
async fn create_booking(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    form: web::Json<CreateBookingRequest>,
) -> actix_web::Result<impl Responder> {
    let coordinator = Arc::clone(&state.coordinator);
    let request = form.into_inner();

    let details = web::block(move || coordinator.create_booking(user.0, &request))
        .await?
        .map_err(|e| {
            log_failure("create booking", &e);
            e
        })?;

    state.publish(BookingEvent::created(&details.booking));

    Ok(HttpResponse::Created().json(ApiResponse::ok("Booking created successfully", details)))
}

#[get("/bookings")]
async fn list_bookings(state: web::Data<AppState>, user: AuthenticatedUser) -> actix_web::Result<impl Responder> {
    let coordinator = Arc::clone(&state.coordinator);

    let bookings = web::block(move || coordinator.user_bookings(user.0))
        .await?
        .map_err(|e| {
            log_failure("list bookings", &e);
            e
        })?;

    Ok(HttpResponse::Ok().json(ApiResponse::ok("Bookings retrieved successfully", bookings)))
}

#[get("/bookings/{booking_id}")]
async fn get_booking(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> actix_web::Result<impl Responder> {
    let coordinator = Arc::clone(&state.coordinator);
    let booking_id = path.into_inner();

    let details = web::block(move || coordinator.booking_details(user.0, booking_id))
        .await?
        .map_err(|e| {
            log_failure("get booking", &e);
            e
        })?;

    Ok(HttpResponse::Ok().json(ApiResponse::ok("Booking retrieved successfully", details)))
}

#[patch("/bookings/{booking_id}/cancel")]
async fn cancel_booking(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<Uuid>,
) -> actix_web::Result<impl Responder> {
    let coordinator = Arc::clone(&state.coordinator);
    let booking_id = path.into_inner();

    let outcome = web::block(move || coordinator.cancel_booking(user.0, booking_id))
        .await?
        .map_err(|e| {
            log_failure("cancel booking", &e);
            e
        })?;

    state.publish(BookingEvent::cancelled(&outcome.booking));

    Ok(HttpResponse::Ok().json(ApiResponse::ok("Booking cancelled successfully", outcome)))
}

#[post("/payments/webhook")]
async fn payment_webhook(
    state: web::Data<AppState>,
    form: web::Json<PaymentCallback>,
) -> actix_web::Result<impl Responder> {
    let reconciler = Arc::clone(&state.reconciler);
    let callback = form.into_inner();

    let outcome = web::block(move || {
        reconciler.handle_callback(callback.booking_id, &callback.transaction_id, &callback.status)
    })
    .await?
    .map_err(|e| {
        log_failure("process payment webhook", &e);
        e
    })?;

    if let Some(event) = BookingEvent::from_callback(&outcome) {
        state.publish(event);
    }

    Ok(HttpResponse::Ok().json(ApiResponse::ok("Payment callback processed", outcome)))
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let detail = err.to_string();
        let response = match err {
            error::JsonPayloadError::ContentType => HttpResponse::UnsupportedMediaType()
                .json(ErrorBody::new("INVALID_REQUEST", "Content-Type should be application/json")),
            error::JsonPayloadError::Deserialize(ref err) => {
                HttpResponse::BadRequest().json(ErrorBody::new("INVALID_REQUEST", err.to_string()))
            }
            _ => HttpResponse::BadRequest().json(ErrorBody::new("INVALID_REQUEST", detail)),
        };
        error::InternalError::from_response(err, response).into()
    })
}

pub fn path_config() -> web::PathConfig {
    web::PathConfig::default().error_handler(|err, _req| {
        let response = HttpResponse::BadRequest().json(ErrorBody::new("INVALID_REQUEST", err.to_string()));
        error::InternalError::from_response(err, response).into()
    })
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health).service(
        web::scope("/api/v1")
            .service(create_booking)
            .service(list_bookings)
            .service(get_booking)
            .service(cancel_booking)
            .service(payment_webhook),
    );
}
