//! Manifest data model
//!
//! This module defines the read-only view the buffering core has of a
//! parsed manifest:
//! - Period / Adaptation / Representation hierarchy
//! - Segment descriptions and the index interface producing them
//! - Events pushed by the manifest layer (decipherability, period loads)

pub mod timeline;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::NetworkError;

/// Track categories the engine can buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackType {
    Audio,
    Video,
    Text,
    Image,
}

impl TrackType {
    pub const ALL: [TrackType; 4] = [
        TrackType::Audio,
        TrackType::Video,
        TrackType::Text,
        TrackType::Image,
    ];

    /// True for types backed by a platform decoder buffer
    pub fn is_native(&self) -> bool {
        matches!(self, TrackType::Audio | TrackType::Video)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackType::Audio => "audio",
            TrackType::Video => "video",
            TrackType::Text => "text",
            TrackType::Image => "image",
        }
    }
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One addressable media chunk.
///
/// `time` and `duration` are expressed in index time (media time times
/// the timescale); `start_secs` / `duration_secs` are the same quantities
/// converted to presentation-time seconds by the index that produced the
/// segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    pub id: String,
    pub time: i64,
    pub timescale: u32,
    pub duration: i64,
    pub is_init: bool,
    pub media_urls: Vec<String>,
    pub byte_range: Option<(u64, u64)>,
    pub start_secs: f64,
    pub duration_secs: f64,
}

impl SegmentInfo {
    pub fn end_secs(&self) -> f64 {
        self.start_secs + self.duration_secs
    }
}

/// Queryable, possibly lazily-evaluated list of a representation's segments
pub trait SegmentIndex: Send + Sync + fmt::Debug {
    /// The initialization segment, if this representation has one
    fn init_segment(&self) -> Option<SegmentInfo>;

    /// Segments intersecting `[from_secs, from_secs + duration_secs]`
    fn segments(&self, from_secs: f64, duration_secs: f64) -> Vec<SegmentInfo>;

    /// Start of the earliest reachable segment, in seconds
    fn first_position(&self) -> Option<f64>;

    /// End of the latest generated segment, in seconds
    fn last_position(&self) -> Option<f64>;

    /// `Some(false)` once a segment fell out of the availability window,
    /// `None` when the index cannot tell
    fn is_segment_still_available(&self, segment: &SegmentInfo) -> Option<bool>;

    /// If `time_secs` falls in a hole between segments, the start of the
    /// next segment in seconds
    fn check_discontinuity(&self, time_secs: f64) -> Option<f64>;

    /// True when the index may be stale for positions up to `up_to_secs`
    /// and the manifest should be refetched
    fn should_refresh(&self, up_to_secs: f64) -> bool;

    /// True once the index will never announce further segments
    fn is_finished(&self) -> bool;

    /// True if `error` may just mean this index is out of sync with the
    /// origin (e.g. a 404 on a live stream) rather than a real failure
    fn can_be_out_of_sync_error(&self, error: &NetworkError) -> bool;
}

/// One specific encoding (codec + bitrate) of a track
#[derive(Debug)]
pub struct Representation {
    pub id: String,
    pub bitrate: u64,
    pub codec: String,
    pub mime_type: String,
    pub index: Arc<dyn SegmentIndex>,
    decipherable: RwLock<Option<bool>>,
}

impl Representation {
    pub fn new(
        id: &str,
        bitrate: u64,
        codec: &str,
        mime_type: &str,
        index: Arc<dyn SegmentIndex>,
    ) -> Self {
        Self {
            id: id.to_string(),
            bitrate,
            codec: codec.to_string(),
            mime_type: mime_type.to_string(),
            index,
            decipherable: RwLock::new(None),
        }
    }

    /// `Some(false)` once the key protecting this representation became
    /// unavailable; `None` when unencrypted or undetermined
    pub fn is_decipherable(&self) -> Option<bool> {
        *self.decipherable.read()
    }

    pub fn set_decipherable(&self, decipherable: bool) {
        *self.decipherable.write() = Some(decipherable);
    }
}

/// A set of interchangeable representations of one track
#[derive(Debug)]
pub struct Adaptation {
    pub id: String,
    pub track_type: TrackType,
    pub representations: Vec<Arc<Representation>>,
}

impl Adaptation {
    pub fn new(id: &str, track_type: TrackType, representations: Vec<Representation>) -> Self {
        Self {
            id: id.to_string(),
            track_type,
            representations: representations.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn representation(&self, id: &str) -> Option<&Arc<Representation>> {
        self.representations.iter().find(|r| r.id == id)
    }
}

/// A contiguous time span of the presentation sharing one track set
#[derive(Debug)]
pub struct Period {
    pub id: String,
    /// Start in presentation-time seconds
    pub start: f64,
    /// Duration in seconds; `None` for the still-growing last period of a
    /// dynamic manifest
    pub duration: Option<f64>,
    adaptations: HashMap<TrackType, Vec<Arc<Adaptation>>>,
    /// False for externally-linked periods whose content is not fetched yet
    pub is_loaded: bool,
}

impl Period {
    pub fn new(id: &str, start: f64, duration: Option<f64>, adaptations: Vec<Adaptation>) -> Self {
        let mut by_type: HashMap<TrackType, Vec<Arc<Adaptation>>> = HashMap::new();
        for adaptation in adaptations {
            by_type
                .entry(adaptation.track_type)
                .or_default()
                .push(Arc::new(adaptation));
        }
        Self {
            id: id.to_string(),
            start,
            duration,
            adaptations: by_type,
            is_loaded: true,
        }
    }

    /// A stub for a period whose content must still be resolved
    pub fn unloaded(id: &str, start: f64, duration: Option<f64>) -> Self {
        Self {
            id: id.to_string(),
            start,
            duration,
            adaptations: HashMap::new(),
            is_loaded: false,
        }
    }

    /// End in seconds; `None` when the duration is unknown
    pub fn end(&self) -> Option<f64> {
        self.duration.map(|d| self.start + d)
    }

    /// True if `time` falls inside `[start, end)`
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && self.end().map_or(true, |end| time < end)
    }

    pub fn adaptations_for(&self, track_type: TrackType) -> &[Arc<Adaptation>] {
        self.adaptations
            .get(&track_type)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Track types this period carries content for
    pub fn track_types(&self) -> Vec<TrackType> {
        TrackType::ALL
            .iter()
            .copied()
            .filter(|ty| !self.adaptations_for(*ty).is_empty())
            .collect()
    }
}

/// Read-only description of the whole presentation
#[derive(Debug)]
pub struct Manifest {
    periods: Vec<Arc<Period>>,
    pub is_dynamic: bool,
    /// Earliest position reachable in the presentation, in seconds
    pub minimum_position: f64,
    /// Latest position reachable in the presentation, in seconds
    pub maximum_position: f64,
}

impl Manifest {
    pub fn new(
        mut periods: Vec<Period>,
        is_dynamic: bool,
        minimum_position: f64,
        maximum_position: f64,
    ) -> Self {
        periods.sort_by(|a, b| a.start.total_cmp(&b.start));
        Self {
            periods: periods.into_iter().map(Arc::new).collect(),
            is_dynamic,
            minimum_position,
            maximum_position,
        }
    }

    pub fn periods(&self) -> &[Arc<Period>] {
        &self.periods
    }

    /// The period whose `[start, end)` span contains `time`
    pub fn period_for_time(&self, time: f64) -> Option<&Arc<Period>> {
        self.periods.iter().find(|p| p.contains(time))
    }

    /// The period starting right after `period`, if any
    pub fn period_after(&self, period: &Period) -> Option<&Arc<Period>> {
        let idx = self.periods.iter().position(|p| p.id == period.id)?;
        self.periods.get(idx + 1)
    }

    pub fn period_by_id(&self, id: &str) -> Option<&Arc<Period>> {
        self.periods.iter().find(|p| p.id == id)
    }
}

/// Decipherability status change for one representation
#[derive(Debug, Clone)]
pub struct DecipherabilityUpdate {
    pub adaptation_id: String,
    pub representation_id: String,
    pub track_type: TrackType,
    pub decipherable: bool,
}

/// Events pushed by the manifest layer into the orchestrator
#[derive(Debug, Clone)]
pub enum ManifestEvent {
    /// Some representations became (un)playable because of key changes
    DecipherabilityUpdate(Vec<DecipherabilityUpdate>),
    /// A previously unloaded period got its content resolved
    PeriodLoaded { period: Arc<Period> },
}

pub type ManifestEvents = mpsc::UnboundedReceiver<ManifestEvent>;
pub type ManifestEventSender = mpsc::UnboundedSender<ManifestEvent>;

/// Create the channel carrying manifest events into the orchestrator
pub fn manifest_event_channel() -> (ManifestEventSender, ManifestEvents) {
    mpsc::unbounded_channel()
}
