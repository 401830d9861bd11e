//! In-memory event bus for fast, deterministic testing.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use carpool_core::event::SerializedEvent;
use carpool_core::event_bus::{EventBus, EventBusError, EventStream};
use futures::stream;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// In-memory implementation of [`EventBus`]. Publishing immediately appends
/// to every topic's captured log; `subscribe` replays what's there so far as
/// a finite stream rather than staying open for live delivery, which is all
/// an aggregate or projection test needs.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventBus {
    topics: Arc<RwLock<HashMap<String, Vec<SerializedEvent>>>>,
}

impl InMemoryEventBus {
    /// Create a new, empty event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event published to `topic` so far, in publish order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<SerializedEvent> {
        self.topics
            .read()
            .unwrap()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();
        Box::pin(async move {
            self.topics
                .write()
                .unwrap()
                .entry(topic)
                .or_default()
                .push(event);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        Box::pin(async move {
            let captured = self.topics.read().unwrap();
            let mut events = Vec::new();
            for topic in &topics {
                events.extend(captured.get(topic).cloned().unwrap_or_default());
            }
            let results: Vec<Result<SerializedEvent, EventBusError>> =
                events.into_iter().map(Ok).collect();
            Ok(Box::pin(stream::iter(results)) as EventStream)
        })
    }
}
