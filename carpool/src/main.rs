//! Carpool HTTP server entry point: loads configuration, connects the event
//! store, event bus, and read-model pool, starts the two background sweeps,
//! and serves the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use carpool::aggregates::ride::{RideAction, RideEnvironment, RideReducer};
use carpool::airports::AirportCatalog;
use carpool::booking_engine::{BookingEngine, NoConnectedAccounts};
use carpool::cache::{CacheLayer, NoopCache, RedisCache};
use carpool::clock::SystemClock;
use carpool::config::Config;
use carpool::handlers::{self, AppState};
use carpool::ledger::WalletLedger;
use carpool::notifications::{Notification, NotificationBus, NotificationKind};
use carpool::payment_gateway::MockPaymentGateway;
use carpool::projections::ReadModelStore;
use carpool::ratings::RatingService;
use carpool::request_engine::RequestEngine;
use carpool::scheduler::{
    spawn_rating_scheduler, spawn_request_expiry_sweep, RatingSweepEffects, RequestExpiryEffects,
};
use carpool::search::SearchService;
use carpool::service::AggregateService;
use carpool::types::{BookingId, NotificationId, RideId, UserId};
use carpool::webhook_reconciler::WebhookReconciler;
use carpool_core::event_bus::EventBus;
use carpool_core::event_store::EventStore;
use carpool_core::stream::StreamId;
use carpool_postgres::PostgresEventStore;
use carpool_redpanda::RedpandaEventBus;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

async fn health() -> &'static str {
    "ok"
}

fn ride_stream_id(ride_id: RideId) -> StreamId {
    StreamId::new(format!("ride-{ride_id}"))
}

/// Adapts the ride `AggregateService` and `NotificationBus` to the
/// scheduler's narrow `*Effects` traits, so `scheduler::spawn_rating_scheduler`
/// doesn't need to know about aggregates or notifications at all.
struct SchedulerEffects {
    rides: Arc<AggregateService<RideReducer>>,
    event_store: Arc<dyn EventStore>,
    event_bus: Arc<dyn EventBus>,
    clock: Arc<SystemClock>,
    notifications: Arc<NotificationBus<ReadModelStore>>,
}

impl SchedulerEffects {
    fn ride_env(&self, ride_id: RideId) -> RideEnvironment {
        RideEnvironment {
            event_store: self.event_store.clone(),
            event_bus: self.event_bus.clone(),
            clock: self.clock.clone(),
            version_cell: Arc::new(RwLock::new(carpool_core::stream::Version::INITIAL)),
            stream_id: ride_stream_id(ride_id),
        }
    }
}

impl RatingSweepEffects for SchedulerEffects {
    fn complete_ride(
        &self,
        ride_id: RideId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let env = self.ride_env(ride_id);
            if let Err(e) = self
                .rides
                .execute(
                    ride_stream_id(ride_id),
                    RideAction::CompleteRide { now: chrono::Utc::now() },
                    &env,
                )
                .await
            {
                tracing::warn!(%ride_id, error = %e, "rating sweep: failed to complete ride");
            }
        })
    }

    fn notify_rate_driver(
        &self,
        passenger_id: UserId,
        booking_id: BookingId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.notify(passenger_id, NotificationKind::RateDriver, booking_id).await;
        })
    }

    fn notify_rate_passenger(
        &self,
        driver_id: UserId,
        booking_id: BookingId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.notify(driver_id, NotificationKind::RatePassenger, booking_id).await;
        })
    }
}

impl SchedulerEffects {
    async fn notify(&self, user_id: UserId, kind: NotificationKind, booking_id: BookingId) {
        let notification = Notification {
            id: NotificationId::new(),
            user_id,
            kind,
            booking_id: Some(booking_id),
            request_id: None,
            payload: serde_json::json!({}),
            read: false,
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.notifications.notify(notification).await {
            tracing::warn!(%user_id, ?kind, error = %e, "rating sweep: failed to notify");
        }
    }
}

/// Marks an expired request by replaying and re-appending directly against
/// the read model's `ride_requests` table is not an option (that table is a
/// projection, not the source of truth) — this drives the real
/// `RequestAction::ExpireRequest` command instead.
struct RequestExpiryEffectsImpl {
    requests: Arc<AggregateService<carpool::aggregates::request::RequestReducer>>,
    event_store: Arc<dyn EventStore>,
    event_bus: Arc<dyn EventBus>,
    clock: Arc<SystemClock>,
}

impl RequestExpiryEffects for RequestExpiryEffectsImpl {
    fn expire(
        &self,
        request_id: carpool::types::RideRequestId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let stream_id = StreamId::new(format!("request-{request_id}"));
            let env = carpool::aggregates::request::RequestEnvironment {
                event_store: self.event_store.clone(),
                event_bus: self.event_bus.clone(),
                clock: self.clock.clone(),
                version_cell: Arc::new(RwLock::new(carpool_core::stream::Version::INITIAL)),
                stream_id: stream_id.clone(),
            };
            let now = chrono::Utc::now();
            if let Err(e) = self
                .requests
                .execute(stream_id, carpool::aggregates::request::RequestAction::ExpireRequest { now }, &env)
                .await
            {
                tracing::warn!(%request_id, error = %e, "request expiry sweep: failed to expire request");
            }
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "carpool=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(port = config.port, "configuration loaded");

    info!("connecting to event store");
    let event_store = PostgresEventStore::connect(&config.database_url).await?;
    event_store.migrate().await?;
    let event_store: Arc<dyn EventStore> = Arc::new(event_store);
    info!("event store ready");

    info!(brokers = %config.kafka_brokers, "connecting to event bus");
    let event_bus: Arc<dyn EventBus> = Arc::new(RedpandaEventBus::new(&config.kafka_brokers)?);
    info!("event bus ready");

    info!("connecting to read-model pool");
    let read_pool = PgPool::connect(&config.database_url).await?;
    let read_models = ReadModelStore::new(read_pool);
    read_models.migrate().await?;
    info!("read models ready");

    let clock = Arc::new(SystemClock);
    let config = Arc::new(config);
    let cache: Arc<dyn CacheLayer> = match &config.redis_url {
        Some(redis_url) => {
            info!("connecting to redis cache");
            Arc::new(RedisCache::connect(redis_url).await?)
        }
        None => {
            info!("REDIS_URL not set, cache disabled");
            Arc::new(NoopCache)
        }
    };
    let notifications = Arc::new(NotificationBus::new(read_models.clone(), cache.clone()));

    let rides = Arc::new(AggregateService::new(RideReducer, event_store.clone()));
    let requests = Arc::new(AggregateService::new(
        carpool::aggregates::request::RequestReducer,
        event_store.clone(),
    ));

    // Scheduler effects need their own ReadModelStore handle for the
    // `*Source` side; NotificationBus already consumed one above, so open a
    // second pool connection for it.
    let source_pool = PgPool::connect(&config.database_url).await?;
    let sweep_source = Arc::new(ReadModelStore::new(source_pool));

    let rating_effects = Arc::new(SchedulerEffects {
        rides: rides.clone(),
        event_store: event_store.clone(),
        event_bus: event_bus.clone(),
        clock: clock.clone(),
        notifications,
    });
    let _rating_sweep =
        spawn_rating_scheduler(sweep_source.clone(), rating_effects, config.rating_sweep_interval);

    let expiry_effects = Arc::new(RequestExpiryEffectsImpl {
        requests,
        event_store: event_store.clone(),
        event_bus: event_bus.clone(),
        clock: clock.clone(),
    });
    let _expiry_sweep = spawn_request_expiry_sweep(
        sweep_source,
        expiry_effects,
        config.request_expiry_sweep_interval,
    );

    let ledger = Arc::new(WalletLedger::new(event_store.clone(), event_bus.clone(), clock.clone()));
    let gateway = MockPaymentGateway::shared();
    let payout_accounts = Arc::new(NoConnectedAccounts);
    let handler_notifications = Arc::new(NotificationBus::new(read_models.clone(), cache));

    let booking_engine = Arc::new(BookingEngine::new(
        event_store.clone(),
        event_bus.clone(),
        clock.clone(),
        ledger.clone(),
        gateway.clone(),
        payout_accounts.clone(),
        handler_notifications.clone(),
        config.platform_fee_percent,
        Arc::new(read_models.clone()),
    ));
    let request_engine = Arc::new(RequestEngine::new(
        event_store.clone(),
        event_bus.clone(),
        clock.clone(),
        ledger.clone(),
        gateway,
        handler_notifications,
        config.platform_fee_percent,
    ));
    let ratings = Arc::new(RatingService::new(read_models.clone(), clock.clone()));
    let webhooks = Arc::new(WebhookReconciler::new(
        read_models.clone(),
        read_models.clone(),
        ledger.clone(),
        payout_accounts,
        config.platform_fee_percent,
    ));
    let search_pool = PgPool::connect(&config.database_url).await?;
    let search = Arc::new(SearchService::new(search_pool));
    let airports_pool = PgPool::connect(&config.database_url).await?;
    let airports = Arc::new(AirportCatalog::new(airports_pool));

    let state = AppState {
        config: config.clone(),
        clock,
        event_store,
        event_bus,
        rides,
        booking_engine,
        request_engine,
        ledger,
        ratings,
        webhooks,
        search,
        airports,
    };

    let app = Router::new()
        .route("/health", get(health))
        .merge(handlers::router(state));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
