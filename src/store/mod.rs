//! Buffer store
//!
//! Owns at most one serialized queue per track type and hands shared
//! handles to the buffering pipelines. Native (audio/video) queues are
//! reused across codec changes, with the codec switch applied in place
//! by the queue itself; custom (text/image) queues are torn down and
//! recreated. Each queue is paired with a segment inventory that
//! survives representation changes and is reset on disposal.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::QueueConfig;
use crate::error::BufferError;
use crate::inventory::SegmentInventory;
use crate::manifest::TrackType;
use crate::queue::BufferQueue;
use crate::raw::{RawBuffer, RawBufferEvents};

/// A decoder buffer plus its completion-event channel
pub struct RawBufferHandle {
    pub buffer: Box<dyn RawBuffer>,
    pub events: RawBufferEvents,
}

/// Creates decoder buffers on demand.
///
/// Owned by the engine and passed into the store, so all platform state
/// stays behind one explicit registry object.
pub trait RawBufferFactory: Send + Sync {
    fn create(&self, track_type: TrackType, codec: &str) -> Result<RawBufferHandle, BufferError>;
}

/// Shared access to one track type's queue and inventory
#[derive(Clone, Debug)]
pub struct BufferHandle {
    pub queue: Arc<BufferQueue>,
    pub inventory: Arc<Mutex<SegmentInventory>>,
}

struct StoredQueue {
    queue: Arc<BufferQueue>,
    inventory: Arc<Mutex<SegmentInventory>>,
    codec: String,
}

/// Registry of serialized buffer queues, one per track type
pub struct BufferStore {
    factory: Arc<dyn RawBufferFactory>,
    queues: DashMap<TrackType, StoredQueue>,
    queue_config: QueueConfig,
}

impl BufferStore {
    pub fn new(factory: Arc<dyn RawBufferFactory>, queue_config: QueueConfig) -> Self {
        Self {
            factory,
            queues: DashMap::new(),
            queue_config,
        }
    }

    /// The existing handle for `track_type`, if one was created
    pub fn get(&self, track_type: TrackType) -> Option<BufferHandle> {
        self.queues.get(&track_type).map(|stored| BufferHandle {
            queue: stored.queue.clone(),
            inventory: stored.inventory.clone(),
        })
    }

    /// Create (or reuse) the queue for `track_type` with the given codec.
    ///
    /// Native types reuse the existing queue: the codec change, if any,
    /// is reconciled in place on the next push. Custom types abort and
    /// replace any previous queue.
    pub fn create(
        &self,
        track_type: TrackType,
        codec: &str,
    ) -> Result<BufferHandle, BufferError> {
        if let Some(mut stored) = self.queues.get_mut(&track_type) {
            if track_type.is_native() {
                if stored.codec != codec {
                    tracing::info!(
                        "{} buffer reused with new codec {} (was {})",
                        track_type,
                        codec,
                        stored.codec
                    );
                    stored.codec = codec.to_string();
                }
                return Ok(BufferHandle {
                    queue: stored.queue.clone(),
                    inventory: stored.inventory.clone(),
                });
            }
            tracing::info!("recreating {} buffer for codec {}", track_type, codec);
            stored.queue.dispose();
            stored.inventory.lock().reset();
            drop(stored);
            self.queues.remove(&track_type);
        }

        let RawBufferHandle { buffer, events } = self.factory.create(track_type, codec)?;
        let queue = Arc::new(BufferQueue::new(
            track_type,
            buffer,
            events,
            &self.queue_config,
        ));
        let inventory = Arc::new(Mutex::new(SegmentInventory::new()));
        let handle = BufferHandle {
            queue: queue.clone(),
            inventory: inventory.clone(),
        };
        self.queues.insert(
            track_type,
            StoredQueue {
                queue,
                inventory,
                codec: codec.to_string(),
            },
        );
        Ok(handle)
    }

    /// Dispose the queue for `track_type` and reset its inventory
    pub fn dispose(&self, track_type: TrackType) {
        if let Some((_, stored)) = self.queues.remove(&track_type) {
            stored.queue.dispose();
            stored.inventory.lock().reset();
        }
    }

    pub fn dispose_all(&self) {
        for ty in TrackType::ALL {
            self.dispose(ty);
        }
    }

    /// Track types with a live queue
    pub fn types_in_use(&self) -> Vec<TrackType> {
        TrackType::ALL
            .iter()
            .copied()
            .filter(|ty| self.queues.contains_key(ty))
            .collect()
    }
}
