//! `PostgreSQL` event store implementation for Carpool.
//!
//! This crate provides a production-ready PostgreSQL-based event store that implements
//! the `EventStore` trait from `carpool-core`. It uses sqlx for compile-time
//! checked queries and supports:
//!
//! - Event persistence with optimistic concurrency
//! - State snapshots for performance
//! - Connection pooling
//! - Transaction support
//!
//! # Example
//!
//! ```no_run
//! use carpool_postgres::PostgresEventStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let event_store = PostgresEventStore::connect("postgres://localhost/mydb").await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dead_letter_queue;
mod event_store;

pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, FailedEvent};
pub use event_store::PostgresEventStore;
