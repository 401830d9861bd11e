//! The event-sourced aggregates: one Postgres stream per `Ride`, `Wallet`,
//! and `RideRequest`, dispatched through `crate::service::AggregateService`
//! rather than a long-lived in-process `Store`.

pub mod request;
pub mod ride;
pub mod wallet;
