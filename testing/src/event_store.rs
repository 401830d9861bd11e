//! In-memory event store for fast, deterministic testing.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use carpool_core::event::SerializedEvent;
use carpool_core::event_store::{EventStore, EventStoreError};
use carpool_core::stream::{StreamId, Version};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// In-memory implementation of [`EventStore`], backed by a `HashMap` keyed by
/// stream id. Complements [`crate::event_bus::InMemoryEventBus`] for wiring
/// up aggregate tests without a real Postgres connection.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<HashMap<StreamId, Vec<SerializedEvent>>>>,
    snapshots: Arc<RwLock<HashMap<StreamId, (Version, Vec<u8>)>>>,
}

impl InMemoryEventStore {
    /// Create a new, empty event store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events currently stored for `stream_id`.
    #[must_use]
    pub fn len(&self, stream_id: &StreamId) -> usize {
        self.streams
            .read()
            .unwrap()
            .get(stream_id)
            .map_or(0, Vec::len)
    }

    /// Whether no events have been appended for `stream_id`.
    #[must_use]
    pub fn is_empty(&self, stream_id: &StreamId) -> bool {
        self.len(stream_id) == 0
    }
}

impl EventStore for InMemoryEventStore {
    fn append_events(
        &self,
        stream_id: StreamId,
        expected_version: Option<Version>,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Version, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut streams = self.streams.write().unwrap();
            let stream = streams.entry(stream_id.clone()).or_default();
            let current = Version::new(stream.len() as u64);

            if let Some(expected) = expected_version {
                if expected != current {
                    return Err(EventStoreError::ConcurrencyConflict {
                        stream_id,
                        expected,
                        actual: current,
                    });
                }
            }

            let appended = events.len() as u64;
            stream.extend(events);
            Ok(Version::new(current.value() + appended))
        })
    }

    fn load_events(
        &self,
        stream_id: StreamId,
        from_version: Option<Version>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SerializedEvent>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let streams = self.streams.read().unwrap();
            let Some(stream) = streams.get(&stream_id) else {
                return Ok(Vec::new());
            };
            let skip = from_version.map_or(0, |v| v.value() as usize);
            Ok(stream.iter().skip(skip).cloned().collect())
        })
    }

    fn save_snapshot(
        &self,
        stream_id: StreamId,
        version: Version,
        state: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.snapshots
                .write()
                .unwrap()
                .insert(stream_id, (version, state));
            Ok(())
        })
    }

    fn load_snapshot(
        &self,
        stream_id: StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<(Version, Vec<u8>)>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move { Ok(self.snapshots.read().unwrap().get(&stream_id).cloned()) })
    }
}
