//! Generic execution harness for the on-demand, stateless aggregates in this
//! crate (`RideAggregate`, `WalletAggregate`, `RequestAggregate`).
//!
//! Every aggregate here owns exactly one event stream per entity instance and
//! is never kept resident between requests (unlike `carpool_runtime::Store`,
//! which holds a reducer's state in memory for the lifetime of the process —
//! the right shape for the teacher's own session aggregates, but not for an
//! aggregate whose instances number in the millions). `AggregateService`
//! instead replays a stream's history on every command, applies the command,
//! and drains whatever effects the reducer produced before returning the
//! resulting state, mirroring the on-demand projection load in the ticketing
//! example's `PaymentReducer` but generalized to drive the full effect chain
//! rather than a single projection query.

use carpool_core::effect::Effect;
use carpool_core::event::Event;
use carpool_core::event_store::EventStore;
use carpool_core::reducer::Reducer;
use carpool_core::stream::{StreamId, Version};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::DomainError;

/// Implemented by every aggregate's `Environment` type so the service can
/// track optimistic-concurrency versions across a single command's effect
/// chain (a command may append more than one event, e.g. a validation event
/// followed by a success event).
pub trait VersionedEnvironment {
    fn version_cell(&self) -> &Arc<RwLock<Version>>;
}

/// Implemented by every aggregate's `State` so `AggregateService::execute`
/// can detect that a persist attempt lost an optimistic-concurrency race and
/// needs to reload-and-retry (see spec's "last seat race" requirement). The
/// flag is transient process state, never persisted with the aggregate.
pub trait ConflictAware {
    /// Returns whether the last command hit a concurrency conflict, clearing
    /// the flag.
    fn take_conflict(&mut self) -> bool;
}

/// Drives a reducer for stream-per-instance aggregates.
pub struct AggregateService<R>
where
    R: Reducer,
{
    reducer: R,
    event_store: Arc<dyn EventStore>,
}

impl<R> AggregateService<R>
where
    R: Reducer + Send + Sync,
    R::State: Default + Send,
    R::Action: Event + Serialize + DeserializeOwned + Send + 'static,
    R::Environment: VersionedEnvironment + Sync,
{
    #[must_use]
    pub const fn new(reducer: R, event_store: Arc<dyn EventStore>) -> Self {
        Self {
            reducer,
            event_store,
        }
    }

    /// Replays every stored event for `stream_id` through the reducer to
    /// reconstruct current state. A stream with no events yields the
    /// reducer's default state at `Version::INITIAL`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the store cannot be read or an event cannot
    /// be deserialized back into `R::Action`.
    pub async fn load(
        &self,
        stream_id: StreamId,
        env: &R::Environment,
    ) -> Result<(R::State, Version), DomainError> {
        let history = self
            .event_store
            .load_events(stream_id, None)
            .await
            .map_err(DomainError::from)?;

        let mut state = R::State::default();
        let mut version = Version::INITIAL;
        for stored in history {
            let action = R::Action::from_bytes(&stored.data)
                .map_err(|e| DomainError::Infra(anyhow::anyhow!(e)))?;
            // Replaying a persisted event must never itself try to persist;
            // any effects here are discarded (a well-behaved reducer returns
            // Effect::None for its own event-application arms).
            let _ = self.reducer.reduce(&mut state, action, env);
            version = version.next();
        }
        Ok((state, version))
    }

    /// Loads current state, applies `command`, and drives the resulting
    /// effect chain (event-store appends, event-bus publishes, and any
    /// chained follow-up actions) to completion.
    ///
    /// If an append loses an optimistic-concurrency race (another command
    /// committed first), the whole command is re-applied against freshly
    /// reloaded state, up to `MAX_ATTEMPTS` times — this is what guarantees
    /// at most one of two concurrent last-seat reservations succeeds.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if loading fails, or `ConcurrencyConflict` if
    /// every retry attempt still collided.
    pub async fn execute(
        &self,
        stream_id: StreamId,
        command: R::Action,
        env: &R::Environment,
    ) -> Result<R::State, DomainError>
    where
        R::Action: Clone,
        R::State: ConflictAware,
    {
        const MAX_ATTEMPTS: u8 = 3;
        let mut attempt = 0;
        loop {
            let (mut state, version) = self.load(stream_id.clone(), env).await?;
            *env.version_cell().write().await = version;

            let mut queue = vec![command.clone()];
            while !queue.is_empty() {
                let mut next = Vec::new();
                for action in queue {
                    let effects = self.reducer.reduce(&mut state, action, env);
                    next.extend(drain_effects(effects).await);
                }
                queue = next;
            }

            attempt += 1;
            if !state.take_conflict() {
                return Ok(state);
            }
            if attempt >= MAX_ATTEMPTS {
                return Err(DomainError::ConcurrencyConflict);
            }
        }
    }
}

/// Recursively executes an effect tree, collecting every action any `Future`
/// or `Delay` effect resolves to so the caller can feed it back into the
/// reducer.
fn drain_effects<A>(effects: Vec<Effect<A>>) -> Pin<Box<dyn Future<Output = Vec<A>> + Send>>
where
    A: Send + 'static,
{
    Box::pin(async move {
        let mut out = Vec::new();
        for effect in effects {
            match effect {
                Effect::None => {}
                Effect::Parallel(branches) => {
                    let groups =
                        futures::future::join_all(branches.into_iter().map(|e| drain_effects(vec![e])))
                            .await;
                    for group in groups {
                        out.extend(group);
                    }
                }
                Effect::Sequential(branches) => {
                    out.extend(drain_effects(branches).await);
                }
                Effect::Delay { duration, action } => {
                    tokio::time::sleep(duration).await;
                    out.push(*action);
                }
                Effect::Future(fut) => {
                    if let Some(action) = fut.await {
                        out.push(action);
                    }
                }
            }
        }
        out
    })
}

/// Persists one event to the aggregate's stream and publishes it to the
/// event bus, advancing the shared version cell. Used inside reducers'
/// `Effect::Future` closures in place of the (unavailable) `append_events!`
/// declarative macro — see DESIGN.md for why this crate bypasses it.
///
/// # Errors
///
/// Returns `EventStoreError` on a concurrency conflict or storage failure.
/// Event-bus publish failures are logged and swallowed: the event is already
/// durable once the store append succeeds, and bus delivery is at-least-once
/// best-effort fan-out, not a correctness boundary.
pub async fn persist_and_publish<A>(
    event_store: &Arc<dyn EventStore>,
    event_bus: &Arc<dyn carpool_core::event_bus::EventBus>,
    version_cell: &Arc<RwLock<Version>>,
    stream_id: StreamId,
    topic: &str,
    event: &A,
) -> Result<(), carpool_core::event_store::EventStoreError>
where
    A: Event + Serialize,
{
    let serialized = carpool_core::event::SerializedEvent::from_event(event, None)
        .map_err(|e| carpool_core::event_store::EventStoreError::SerializationError(e.to_string()))?;

    let expected = *version_cell.read().await;
    let new_version = event_store
        .append_events(stream_id, Some(expected), vec![serialized.clone()])
        .await?;
    *version_cell.write().await = new_version;

    if let Err(err) = event_bus.publish(topic, &serialized).await {
        tracing::warn!(%err, topic, "event bus publish failed, event is durable but fan-out was skipped");
    }
    Ok(())
}
