//! HTTP surface for the marketplace core: bookings, request/offer matching,
//! the wallet, ratings, ride/request publishing and search, the airport
//! catalog, and the PSP webhook.
//!
//! Grounded the same way the ticketing example's `handlers` module wires
//! its checkout service into its router: one `AppState` holding `Arc`s to
//! the long-lived services, extractors for the cross-cutting concerns, and
//! thin handlers that just parse, call a service, and wrap the result in
//! `Envelope`.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{async_trait, Json, Router};
use serde::{Deserialize, Serialize};

use crate::aggregates::request::{OfferStatus, RequestStatus};
use crate::aggregates::ride::{BookingStatus, RideAction, RideEnvironment, RideReducer, RideStatus};
use crate::airports::{Airport, AirportCatalog};
use crate::auth_token::{self, AuthTokenError};
use crate::booking_engine::BookingEngine;
use crate::config::Config;
use crate::error::{AppError, DomainError, Envelope};
use crate::ledger::WalletLedger;
use crate::payment_gateway::Intent;
use crate::projections::ReadModelStore;
use crate::ratings::{RatingService, RatingStats};
use crate::request_engine::RequestEngine;
use crate::search::{RequestSearchQuery, RequestSearchResult, RideSearchQuery, RideSearchResult, SearchService};
use crate::service::AggregateService;
use crate::types::{
    AirportId, BookingId, Direction, GeoPoint, Money, OfferId, RideId, RideRequestId, UserId,
};
use crate::webhook::{self, WebhookEvent};
use crate::webhook_reconciler::WebhookReconciler;
use carpool_core::environment::Clock;
use carpool_core::event_bus::EventBus;
use carpool_core::event_store::EventStore;
use carpool_core::stream::{StreamId, Version};
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub event_store: Arc<dyn EventStore>,
    pub event_bus: Arc<dyn EventBus>,
    pub rides: Arc<AggregateService<RideReducer>>,
    pub booking_engine: Arc<BookingEngine<ReadModelStore>>,
    pub request_engine: Arc<RequestEngine<ReadModelStore>>,
    pub ledger: Arc<WalletLedger>,
    pub ratings: Arc<RatingService<ReadModelStore>>,
    pub webhooks: Arc<WebhookReconciler<ReadModelStore, ReadModelStore>>,
    pub search: Arc<SearchService>,
    pub airports: Arc<AirportCatalog>,
}

/// The authenticated caller, extracted from `Authorization: Bearer <token>`
/// and verified against `Config::jwt_secret`.
#[derive(Copy, Clone, Debug)]
pub struct AuthUser(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(DomainError::Unauthenticated)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(DomainError::Unauthenticated)?;
        let user_id = auth_token::verify(&state.config.jwt_secret, token, state.clock.now()).map_err(|err| match err {
            AuthTokenError::Expired => DomainError::Unauthenticated,
            AuthTokenError::Malformed | AuthTokenError::BadSignature => DomainError::Unauthenticated,
        })?;
        Ok(Self(user_id))
    }
}

fn ride_stream_id(ride_id: RideId) -> StreamId {
    StreamId::new(format!("ride-{ride_id}"))
}

#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rides", post(publish_ride).get(search_rides))
        .route("/ride-requests/available", get(search_requests))
        .route("/airports", get(search_airports))
        .route("/airports/:id", get(get_airport))
        .route("/bookings", post(create_booking))
        .route("/bookings/wallet", post(pay_and_book_with_wallet))
        .route("/bookings/:id/pay/card/intent", post(create_card_intent))
        .route("/bookings/:id/pay/card/complete", post(complete_card_payment))
        .route("/bookings/:id/cancel", post(cancel_booking))
        .route("/rides/:id/cancel", post(cancel_ride))
        .route("/requests", post(create_request))
        .route("/requests/:id/offers", post(make_offer))
        .route("/requests/:id/offers/:offer_id/accept/wallet", post(accept_offer_with_wallet))
        .route("/requests/:id/offers/:offer_id/accept/card", post(accept_offer_with_card))
        .route("/requests/:id/offers/:offer_id/reject", post(reject_offer))
        .route("/requests/:id/offers/:offer_id/withdraw", post(withdraw_offer))
        .route("/requests/:id/cancel", post(cancel_request))
        .route("/wallet/balance", get(wallet_balance))
        .route("/ratings", post(create_rating))
        .route("/ratings/:user_id/stats", get(rating_stats))
        .route("/webhooks/psp", post(psp_webhook))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct PublishRideRequest {
    airport_id: AirportId,
    direction: Direction,
    home: GeoPoint,
    departure_at: chrono::DateTime<chrono::Utc>,
    seats_total: u32,
    luggage_total: u32,
    price_per_seat_minor: i64,
    route: Vec<GeoPoint>,
    comment: Option<String>,
}

async fn publish_ride(
    State(state): State<AppState>,
    AuthUser(driver_id): AuthUser,
    Json(body): Json<PublishRideRequest>,
) -> Result<Envelope<RideId>, AppError> {
    let ride_id = RideId::new();
    let now = state.clock.now();
    let env = RideEnvironment {
        event_store: state.event_store.clone(),
        event_bus: state.event_bus.clone(),
        clock: state.clock.clone(),
        version_cell: Arc::new(RwLock::new(Version::INITIAL)),
        stream_id: ride_stream_id(ride_id),
    };
    let result = state
        .rides
        .execute(
            ride_stream_id(ride_id),
            RideAction::PublishRide {
                ride_id,
                driver_id,
                airport_id: body.airport_id,
                direction: body.direction,
                home: body.home,
                departure_at: body.departure_at,
                seats_total: body.seats_total,
                luggage_total: body.luggage_total,
                price_per_seat: Money::from_minor(body.price_per_seat_minor),
                route: body.route,
                comment: body.comment,
                now,
            },
            &env,
        )
        .await
        .map_err(DomainError::from)?;
    if let Some(reason) = result.last_error {
        return Err(DomainError::Validation(reason).into());
    }
    Ok(Envelope::ok(ride_id))
}

#[derive(Debug, Deserialize)]
struct SearchRidesQuery {
    airport_id: AirportId,
    direction: Option<Direction>,
    date: Option<chrono::NaiveDate>,
    min_seats: Option<u32>,
    pickup_lon: Option<f64>,
    pickup_lat: Option<f64>,
    radius_meters: Option<f64>,
    #[serde(default)]
    page: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

const fn default_limit() -> u32 {
    20
}

async fn search_rides(
    State(state): State<AppState>,
    Query(query): Query<SearchRidesQuery>,
) -> Result<Envelope<Vec<RideSearchResult>>, AppError> {
    let pickup_point = match (query.pickup_lon, query.pickup_lat) {
        (Some(lon), Some(lat)) => Some(GeoPoint::new(lon, lat)),
        _ => None,
    };
    let results = state
        .search
        .search_rides(&RideSearchQuery {
            airport_id: query.airport_id,
            direction: query.direction,
            date: query.date,
            min_seats: query.min_seats,
            pickup_point,
            radius_meters: query.radius_meters,
            page: query.page,
            limit: query.limit,
        })
        .await
        .map_err(|err| AppError::from(anyhow::Error::from(err)))?;
    Ok(Envelope::ok(results))
}

#[derive(Debug, Deserialize)]
struct SearchRequestsQuery {
    airport_id: Option<AirportId>,
    direction: Option<Direction>,
    date: Option<chrono::NaiveDate>,
    pickup_lon: Option<f64>,
    pickup_lat: Option<f64>,
    radius_meters: Option<f64>,
    #[serde(default)]
    page: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

async fn search_requests(
    State(state): State<AppState>,
    AuthUser(driver_id): AuthUser,
    Query(query): Query<SearchRequestsQuery>,
) -> Result<Envelope<Vec<RequestSearchResult>>, AppError> {
    let pickup_point = match (query.pickup_lon, query.pickup_lat) {
        (Some(lon), Some(lat)) => Some(GeoPoint::new(lon, lat)),
        _ => None,
    };
    let results = state
        .search
        .search_requests(&RequestSearchQuery {
            driver_id,
            airport_id: query.airport_id,
            direction: query.direction,
            date: query.date,
            pickup_point,
            radius_meters: query.radius_meters,
            page: query.page,
            limit: query.limit,
        })
        .await
        .map_err(|err| AppError::from(anyhow::Error::from(err)))?;
    Ok(Envelope::ok(results))
}

#[derive(Debug, Deserialize)]
struct SearchAirportsQuery {
    q: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    radius: Option<f64>,
    #[serde(default = "default_limit")]
    limit: u32,
}

async fn search_airports(
    State(state): State<AppState>,
    Query(query): Query<SearchAirportsQuery>,
) -> Result<Envelope<Vec<Airport>>, AppError> {
    let results = match (query.q, query.latitude, query.longitude) {
        (Some(text), _, _) if !text.is_empty() => state.airports.search_by_text(&text, query.limit).await,
        (_, Some(lat), Some(lon)) => {
            let radius = query.radius.unwrap_or(crate::search::DEFAULT_RADIUS_METERS);
            state.airports.search_nearby(GeoPoint::new(lon, lat), radius, query.limit).await
        }
        _ => return Err(DomainError::Validation("airports search needs q or latitude+longitude".into()).into()),
    };
    Ok(Envelope::ok(results.map_err(|err| AppError::from(anyhow::Error::from(err)))?))
}

async fn get_airport(
    State(state): State<AppState>,
    Path(airport_id): Path<AirportId>,
) -> Result<Envelope<Airport>, AppError> {
    let airport = state
        .airports
        .find_by_id(airport_id)
        .await
        .map_err(|err| AppError::from(anyhow::Error::from(err)))?
        .ok_or(DomainError::NotFound { resource: "airport", id: airport_id.to_string() })?;
    Ok(Envelope::ok(airport))
}

#[derive(Debug, Deserialize)]
struct CreateBookingRequest {
    ride_id: RideId,
    seats: u32,
    luggage: u32,
    pickup: Option<GeoPoint>,
    dropoff: Option<GeoPoint>,
}

async fn create_booking(
    State(state): State<AppState>,
    AuthUser(passenger_id): AuthUser,
    Json(body): Json<CreateBookingRequest>,
) -> Result<Envelope<BookingId>, AppError> {
    let booking = state
        .booking_engine
        .create_booking(body.ride_id, passenger_id, body.seats, body.luggage, body.pickup, body.dropoff)
        .await?;
    Ok(Envelope::ok(booking.id))
}

#[derive(Debug, Deserialize)]
struct PayAndBookRequest {
    ride_id: RideId,
    seats: u32,
    luggage: u32,
}

async fn pay_and_book_with_wallet(
    State(state): State<AppState>,
    AuthUser(passenger_id): AuthUser,
    Json(body): Json<PayAndBookRequest>,
) -> Result<Envelope<BookingId>, AppError> {
    let booking = state
        .booking_engine
        .pay_and_book_with_wallet(body.ride_id, passenger_id, body.seats, body.luggage)
        .await?;
    Ok(Envelope::ok(booking.id))
}

#[derive(Debug, Deserialize)]
struct CardIntentRequest {
    ride_id: RideId,
    seats: u32,
}

async fn create_card_intent(
    State(state): State<AppState>,
    Json(body): Json<CardIntentRequest>,
) -> Result<Envelope<Intent>, AppError> {
    let intent = state.booking_engine.create_card_intent(body.ride_id, body.seats).await?;
    Ok(Envelope::ok(intent))
}

#[derive(Debug, Deserialize)]
struct CompleteCardPaymentRequest {
    ride_id: RideId,
    intent_id: String,
    seats: u32,
    luggage: u32,
}

async fn complete_card_payment(
    State(state): State<AppState>,
    AuthUser(passenger_id): AuthUser,
    Json(body): Json<CompleteCardPaymentRequest>,
) -> Result<Envelope<BookingId>, AppError> {
    let booking = state
        .booking_engine
        .complete_card_payment(body.ride_id, &body.intent_id, passenger_id, body.seats, body.luggage)
        .await?;
    Ok(Envelope::ok(booking.id))
}

#[derive(Debug, Deserialize)]
struct CancelBookingRequest {
    ride_id: RideId,
}

async fn cancel_booking(
    State(state): State<AppState>,
    AuthUser(actor_id): AuthUser,
    Path(booking_id): Path<BookingId>,
    Json(body): Json<CancelBookingRequest>,
) -> Result<Envelope<BookingStatus>, AppError> {
    let booking = state.booking_engine.cancel_booking(body.ride_id, booking_id, actor_id).await?;
    Ok(Envelope::ok(booking.status))
}

async fn cancel_ride(
    State(state): State<AppState>,
    Path(ride_id): Path<RideId>,
) -> Result<Envelope<RideStatus>, AppError> {
    let result = state.booking_engine.cancel_ride(ride_id).await?;
    let status = result.ride.ok_or(DomainError::NotFound { resource: "ride", id: ride_id.to_string() })?.status;
    Ok(Envelope::ok(status))
}

#[derive(Debug, Deserialize)]
struct CreateRequestRequest {
    airport_id: AirportId,
    direction: Direction,
    home: GeoPoint,
    earliest_at: chrono::DateTime<chrono::Utc>,
    latest_at: chrono::DateTime<chrono::Utc>,
    seats: u32,
    luggage: u32,
}

async fn create_request(
    State(state): State<AppState>,
    AuthUser(passenger_id): AuthUser,
    Json(body): Json<CreateRequestRequest>,
) -> Result<Envelope<RideRequestId>, AppError> {
    let request = state
        .request_engine
        .create_request(
            passenger_id,
            body.airport_id,
            body.direction,
            body.home,
            body.earliest_at,
            body.latest_at,
            body.seats,
            body.luggage,
        )
        .await?;
    Ok(Envelope::ok(request.id))
}

#[derive(Debug, Deserialize)]
struct MakeOfferRequest {
    ride_id: RideId,
    price_per_seat_minor: i64,
}

async fn make_offer(
    State(state): State<AppState>,
    AuthUser(driver_id): AuthUser,
    Path(request_id): Path<RideRequestId>,
    Json(body): Json<MakeOfferRequest>,
) -> Result<Envelope<OfferId>, AppError> {
    let offer = state
        .request_engine
        .make_offer(request_id, body.ride_id, driver_id, Money::from_minor(body.price_per_seat_minor))
        .await?;
    Ok(Envelope::ok(offer.id))
}

async fn accept_offer_with_wallet(
    State(state): State<AppState>,
    AuthUser(passenger_id): AuthUser,
    Path((request_id, offer_id)): Path<(RideRequestId, OfferId)>,
) -> Result<Envelope<RequestStatus>, AppError> {
    let request = state
        .request_engine
        .accept_offer_with_wallet(request_id, offer_id, passenger_id)
        .await?;
    Ok(Envelope::ok(request.status))
}

#[derive(Debug, Deserialize)]
struct AcceptOfferWithCardRequest {
    intent_id: String,
}

async fn accept_offer_with_card(
    State(state): State<AppState>,
    Path((request_id, offer_id)): Path<(RideRequestId, OfferId)>,
    Json(body): Json<AcceptOfferWithCardRequest>,
) -> Result<Envelope<RequestStatus>, AppError> {
    let request = state
        .request_engine
        .accept_offer_with_card(request_id, offer_id, &body.intent_id)
        .await?;
    Ok(Envelope::ok(request.status))
}

async fn reject_offer(
    State(state): State<AppState>,
    AuthUser(actor_id): AuthUser,
    Path((request_id, offer_id)): Path<(RideRequestId, OfferId)>,
) -> Result<Envelope<OfferStatus>, AppError> {
    state.request_engine.reject_offer(request_id, offer_id, actor_id).await?;
    Ok(Envelope::ok(OfferStatus::Rejected))
}

async fn withdraw_offer(
    State(state): State<AppState>,
    AuthUser(actor_id): AuthUser,
    Path((request_id, offer_id)): Path<(RideRequestId, OfferId)>,
) -> Result<Envelope<OfferStatus>, AppError> {
    state.request_engine.withdraw_offer(request_id, offer_id, actor_id).await?;
    Ok(Envelope::ok(OfferStatus::Withdrawn))
}

async fn cancel_request(
    State(state): State<AppState>,
    AuthUser(actor_id): AuthUser,
    Path(request_id): Path<RideRequestId>,
) -> Result<Envelope<()>, AppError> {
    state.request_engine.cancel_request(request_id, actor_id).await?;
    Ok(Envelope::ok(()))
}

async fn wallet_balance(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Envelope<Money>, AppError> {
    let balance = state.ledger.balance(user_id).await?;
    Ok(Envelope::ok(balance))
}

#[derive(Debug, Deserialize)]
struct CreateRatingRequest {
    booking_id: BookingId,
    stars: u8,
    comment: Option<String>,
}

#[derive(Debug, Serialize)]
struct RatingResponse {
    id: crate::types::RatingId,
    stars: u8,
}

async fn create_rating(
    State(state): State<AppState>,
    AuthUser(from_user_id): AuthUser,
    Json(body): Json<CreateRatingRequest>,
) -> Result<Envelope<RatingResponse>, AppError> {
    let rating = state
        .ratings
        .create_rating(body.booking_id, from_user_id, body.stars, body.comment)
        .await?;
    Ok(Envelope::ok(RatingResponse { id: rating.id, stars: rating.stars }))
}

async fn rating_stats(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Envelope<RatingStats>, AppError> {
    let stats = state.ratings.stats_for_user(user_id).await?;
    Ok(Envelope::ok(stats))
}

/// Verifies the raw body against `X-Webhook-Signature` before any JSON
/// parsing touches it, then hands the parsed event to the reconciler.
async fn psp_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<StatusCode, AppError> {
    let signature = headers
        .get("X-Webhook-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(DomainError::Validation("missing webhook signature".into()))?;
    webhook::verify_signature(&state.config.psp_webhook_secret, &body, signature)
        .map_err(|err| DomainError::Validation(err.to_string()))?;
    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|err| DomainError::Validation(format!("malformed webhook payload: {err}")))?;
    state
        .webhooks
        .handle(event)
        .await
        .map_err(|err| DomainError::Validation(err.to_string()))?;
    Ok(StatusCode::OK)
}
