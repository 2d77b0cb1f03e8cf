//! # Media Buffer Library
//!
//! `media-buffer-lib` is the adaptive buffering core of a streaming
//! engine: given a parsed manifest (Periods → Adaptations →
//! Representations → Segments) and a playback clock, it decides which
//! media segments to fetch, fetches and parses them through pluggable
//! transport seams, and appends them to decoder buffers while upholding
//! the platform's constraints (one in-flight mutation per buffer,
//! monotonic codec/window configuration, bounded retained history).
//!
//! ## Core pieces
//!
//! - **Serialized buffer queues** ([`BufferQueue`]): FIFO append/remove
//!   scheduling over one decoder buffer, with codec and append-window
//!   reconciliation and init-segment deduplication.
//! - **Segment inventory** ([`SegmentInventory`]): reconciles what was
//!   pushed with what the decoder actually retained.
//! - **Timeline index** ([`manifest::timeline::TimelineIndex`]):
//!   lazily-parsed segment timelines with timeshift eviction.
//! - **Period orchestrator** ([`PeriodOrchestrator`]): chains per-track
//!   per-period buffering pipelines into a seamless multi-period
//!   timeline with garbage collection.
//!
//! ## Usage
//!
//! ```ignore
//! let (clock_tx, clock_rx) = media_buffer_lib::clock_channel(ClockTick::new(0.0));
//! let (manifest_tx, manifest_events) = media_buffer_lib::manifest_event_channel();
//! let store = Arc::new(BufferStore::new(platform_buffers, config.queue.clone()));
//!
//! let (orchestrator, mut events) = PeriodOrchestrator::spawn(OrchestratorArgs {
//!     manifest,
//!     clock: clock_rx,
//!     store,
//!     loader,                       // your transport
//!     parser,                       // your container parser
//!     tracks,
//!     abr,
//!     config,
//!     enabled_types: vec![TrackType::Audio, TrackType::Video],
//!     manifest_events,
//! });
//!
//! // feed `clock_tx` from the playback element and react to `events`
//! while let Some(event) = events.recv().await {
//!     match event {
//!         OrchestratorEvent::EndOfStream => break,
//!         _ => {}
//!     }
//! }
//! ```

pub mod buffer;
pub mod clock;
pub mod config;
pub mod error;
pub mod gc;
pub mod inventory;
pub mod loader;
pub mod manifest;
pub mod queue;
pub mod raw;
pub mod store;

pub use buffer::{
    AbrSelector, ManualAbr, ManualTracks, OrchestratorArgs, OrchestratorEvent,
    PeriodOrchestrator, TrackSelector,
};
pub use clock::{clock_channel, ClockReceiver, ClockSender, ClockTick};
pub use config::{BufferConfig, EngineConfig, SwitchingMode};
pub use error::{
    BufferError, EngineError, MediaError, NetworkError, PlaybackWarning, Result,
};
pub use inventory::SegmentInventory;
pub use loader::{
    ChunkTimingInfo, LoadedSegment, ParsedChunk, SegmentContent, SegmentLoader, SegmentParser,
};
pub use manifest::{
    manifest_event_channel, Adaptation, Manifest, ManifestEvent, Period, Representation,
    SegmentIndex, SegmentInfo, TrackType,
};
pub use queue::{BufferQueue, PendingOperation, PushedChunk};
pub use raw::time_ranges::TimeRange;
pub use raw::{AppendedData, ManualRawBuffer, RawBuffer, RawBufferEvent, RawBufferEvents};
pub use store::{BufferHandle, BufferStore, RawBufferFactory, RawBufferHandle};
