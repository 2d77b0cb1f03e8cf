//! Buffer pipeline
//!
//! Composes the per-representation fetch/push loop, the per-period
//! sequencing of representations, and the orchestrator chaining periods
//! into a seamless timeline:
//! - `representation`: one representation's clock-driven buffering loop
//! - `period`: representation sequencing for one (type, period) pair
//! - `orchestrator`: consecutive-period lifecycle, seeks, end-of-stream

pub mod orchestrator;
pub mod period;
pub mod representation;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::clock::ClockTick;
use crate::error::PlaybackWarning;
use crate::loader::SegmentContent;
use crate::manifest::{Adaptation, Manifest, Period, Representation, SegmentInfo, TrackType};
use crate::raw::time_ranges::TimeRange;

pub use orchestrator::{OrchestratorArgs, PeriodOrchestrator};

/// Identity of the content one representation buffer works on
#[derive(Debug, Clone)]
pub struct BufferContent {
    pub manifest: Arc<Manifest>,
    pub period: Arc<Period>,
    pub adaptation: Arc<Adaptation>,
    pub representation: Arc<Representation>,
}

impl BufferContent {
    pub fn segment_content(&self, segment: SegmentInfo) -> SegmentContent {
        SegmentContent {
            period: self.period.clone(),
            adaptation: self.adaptation.clone(),
            representation: self.representation.clone(),
            segment,
        }
    }
}

/// Events emitted by a representation buffer and forwarded upward
#[derive(Debug, Clone)]
pub enum RepresentationEvent {
    /// A media chunk was pushed, acknowledged and inventoried
    AddedSegment {
        content: SegmentContent,
        buffered: Vec<TimeRange>,
    },
    /// Everything wanted up to the period end is buffered
    FullBuffer,
    /// A previously full buffer must load again for the current position
    ActiveBuffer,
    /// Playback cannot continue without rebuilding the media source
    NeedsReload { tick: ClockTick },
    /// A recoverable problem the front-end should know about
    Warning(PlaybackWarning),
    /// The buffering loop hit an unrecoverable error
    Failed { reason: String },
}

/// Events emitted by the period orchestrator
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    AddedSegment {
        track_type: TrackType,
        content: SegmentContent,
        buffered: Vec<TimeRange>,
    },
    FullBuffer {
        track_type: TrackType,
    },
    ActiveBuffer {
        track_type: TrackType,
    },
    /// This type has buffered everything the manifest will ever announce
    BufferComplete {
        track_type: TrackType,
    },
    PeriodBufferCleared {
        track_type: TrackType,
        period_id: String,
    },
    ActivePeriodChanged {
        period: Arc<Period>,
    },
    NeedsMediaSourceReload {
        tick: ClockTick,
    },
    NeedsDecipherabilityFlush {
        tick: ClockTick,
    },
    /// An externally-linked period must be resolved before buffering can
    /// proceed
    NeedsLoadedPeriod {
        track_type: TrackType,
        period: Arc<Period>,
    },
    /// Every enabled type reported `BufferComplete`
    EndOfStream,
    /// A type left the complete state after `EndOfStream`
    ResumeStream,
    Warning {
        track_type: Option<TrackType>,
        warning: PlaybackWarning,
    },
}

/// Picks which representation of an adaptation to buffer.
///
/// The adaptive bitrate logic lives outside the engine; it feeds its
/// choices through a watch channel whose current value is the initial
/// pick.
pub trait AbrSelector: Send + Sync {
    fn representation_stream(&self, adaptation: &Adaptation) -> watch::Receiver<Arc<Representation>>;
}

/// Picks which adaptation (track) of a period to buffer per type
pub trait TrackSelector: Send + Sync {
    fn adaptation_stream(
        &self,
        period: &Period,
        track_type: TrackType,
    ) -> watch::Receiver<Option<Arc<Adaptation>>>;
}

/// Externally-driven representation choice, defaulting to the first
/// representation of each adaptation
#[derive(Default)]
pub struct ManualAbr {
    channels: DashMap<String, watch::Sender<Arc<Representation>>>,
}

impl ManualAbr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch the choice for `adaptation_id`; buffers pick it up on their
    /// next transition
    pub fn select(&self, adaptation_id: &str, representation: Arc<Representation>) {
        if let Some(sender) = self.channels.get(adaptation_id) {
            let _ = sender.send(representation);
        }
    }
}

impl AbrSelector for ManualAbr {
    fn representation_stream(&self, adaptation: &Adaptation) -> watch::Receiver<Arc<Representation>> {
        let entry = self.channels.entry(adaptation.id.clone()).or_insert_with(|| {
            let initial = adaptation.representations[0].clone();
            watch::channel(initial).0
        });
        entry.subscribe()
    }
}

/// Externally-driven track choice, defaulting to the first adaptation of
/// the requested type
#[derive(Default)]
pub struct ManualTracks {
    channels: DashMap<(String, TrackType), watch::Sender<Option<Arc<Adaptation>>>>,
}

impl ManualTracks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch the track used for `(period_id, track_type)`
    pub fn select(
        &self,
        period_id: &str,
        track_type: TrackType,
        adaptation: Option<Arc<Adaptation>>,
    ) {
        if let Some(sender) = self.channels.get(&(period_id.to_string(), track_type)) {
            let _ = sender.send(adaptation);
        }
    }
}

impl TrackSelector for ManualTracks {
    fn adaptation_stream(
        &self,
        period: &Period,
        track_type: TrackType,
    ) -> watch::Receiver<Option<Arc<Adaptation>>> {
        let key = (period.id.clone(), track_type);
        let entry = self.channels.entry(key).or_insert_with(|| {
            let initial = period.adaptations_for(track_type).first().cloned();
            watch::channel(initial).0
        });
        entry.subscribe()
    }
}
