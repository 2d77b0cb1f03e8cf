//! Segment inventory
//!
//! Reconciles what the engine asked the decoder buffer to retain with
//! what it actually retained. Entries are kept sorted by requested start,
//! never overlap, and are re-synchronized against the decoder's reported
//! ranges after every mutation.

use crate::manifest::SegmentInfo;
use crate::raw::time_ranges::{TimeRange, RANGE_TOLERANCE};

/// Identity of the content a chunk belongs to.
///
/// Keyed on the representation so quality/codec switches stay visible in
/// the inventory after the fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkContext {
    pub period_id: String,
    pub adaptation_id: String,
    pub representation_id: String,
    pub bitrate: u64,
}

/// One pushed chunk tracked by the inventory
#[derive(Debug, Clone)]
pub struct BufferedChunk {
    pub context: ChunkContext,
    pub segment: SegmentInfo,
    /// Interval the push asked the decoder to retain
    pub requested_start: f64,
    pub requested_end: f64,
    /// Interval the decoder actually retains, set by synchronization;
    /// `None` until the first synchronization after the push
    pub buffered_start: Option<f64>,
    pub buffered_end: Option<f64>,
    /// Size of the pushed bytes, when known
    pub size: Option<usize>,
}

impl BufferedChunk {
    /// The retained interval, once synchronized
    pub fn buffered_range(&self) -> Option<TimeRange> {
        match (self.buffered_start, self.buffered_end) {
            (Some(start), Some(end)) => Some(TimeRange::new(start, end)),
            _ => None,
        }
    }
}

/// Per-queue record of pushed chunks vs. retained ranges
#[derive(Debug, Default)]
pub struct SegmentInventory {
    entries: Vec<BufferedChunk>,
}

impl SegmentInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inventory(&self) -> &[BufferedChunk] {
        &self.entries
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Total bytes retained, summed over entries that reported a size
    pub fn size_estimate(&self) -> usize {
        self.entries.iter().filter_map(|e| e.size).sum()
    }

    /// Record a chunk the decoder was asked to retain over
    /// `[start, end)`. Entries it overlaps are truncated or removed:
    /// the most recent push wins on contested regions.
    pub fn insert_chunk(
        &mut self,
        context: ChunkContext,
        segment: SegmentInfo,
        start: f64,
        end: f64,
        size: Option<usize>,
    ) {
        if end <= start {
            tracing::warn!(
                "ignoring inventory insert with empty interval [{}, {}]",
                start,
                end
            );
            return;
        }

        // truncate, split or drop entries the new chunk overlaps
        let mut i = 0;
        while i < self.entries.len() {
            let entry = &mut self.entries[i];
            if entry.requested_end <= start {
                i += 1;
                continue;
            }
            if entry.requested_start >= end {
                break;
            }
            if entry.requested_start < start {
                if entry.requested_end > end {
                    // new chunk sits strictly inside: split into head and tail
                    let mut tail = entry.clone();
                    tail.requested_start = end;
                    if let Some(bs) = tail.buffered_start {
                        tail.buffered_start = Some(bs.max(end));
                    }
                    entry.requested_end = start;
                    if let Some(be) = entry.buffered_end {
                        entry.buffered_end = Some(be.min(start));
                    }
                    self.entries.insert(i + 1, tail);
                    break;
                }
                // keep the leading part
                entry.requested_end = start;
                if let Some(be) = entry.buffered_end {
                    entry.buffered_end = Some(be.min(start));
                }
                i += 1;
                continue;
            }
            if entry.requested_end > end {
                // keep the trailing part
                entry.requested_start = end;
                if let Some(bs) = entry.buffered_start {
                    entry.buffered_start = Some(bs.max(end));
                }
                break;
            }
            // fully covered by the new chunk
            self.entries.remove(i);
        }

        let position = self
            .entries
            .partition_point(|e| e.requested_start < start);
        self.entries.insert(
            position,
            BufferedChunk {
                context,
                segment,
                requested_start: start,
                requested_end: end,
                buffered_start: None,
                buffered_end: None,
                size,
            },
        );
    }

    /// Reconcile every entry against the ranges the decoder reports.
    ///
    /// Each entry's retained interval becomes the intersection of its
    /// requested interval with the range containing it, with a small
    /// tolerance absorbing decoder rounding at the edges. Entries with no
    /// retained data are dropped. Runs in O(n + m).
    pub fn synchronize_buffered(&mut self, ranges: &[TimeRange]) {
        let mut range_idx = 0;
        self.entries.retain_mut(|entry| {
            // advance to the first range that could contain this entry
            while range_idx < ranges.len()
                && ranges[range_idx].end <= entry.requested_start + RANGE_TOLERANCE
            {
                range_idx += 1;
            }
            let Some(range) = ranges.get(range_idx) else {
                return false;
            };
            if range.start >= entry.requested_end - RANGE_TOLERANCE {
                // nothing of this entry survived
                return false;
            }
            entry.buffered_start = Some(if range.start < entry.requested_start + RANGE_TOLERANCE {
                entry.requested_start
            } else {
                range.start
            });
            entry.buffered_end = Some(if range.end > entry.requested_end - RANGE_TOLERANCE {
                entry.requested_end
            } else {
                range.end
            });
            true
        });
    }

    /// True if the inventory already covers `segment` for the given
    /// representation (requested and not since evicted)
    pub fn contains_segment(&self, representation_id: &str, segment: &SegmentInfo) -> bool {
        self.entries.iter().any(|entry| {
            entry.context.representation_id == representation_id
                && entry.segment.id == segment.id
                && entry.segment.time == segment.time
        })
    }

    /// True if `[start, end)` is fully covered by requested entries,
    /// regardless of which representation pushed them
    pub fn covers(&self, start: f64, end: f64) -> bool {
        let mut cursor = start;
        for entry in &self.entries {
            if entry.requested_end <= cursor {
                continue;
            }
            if entry.requested_start > cursor + RANGE_TOLERANCE {
                return false;
            }
            cursor = cursor.max(entry.requested_end);
            if cursor >= end - RANGE_TOLERANCE {
                return true;
            }
        }
        cursor >= end - RANGE_TOLERANCE
    }

    /// Buffered ranges belonging to the given representations
    pub fn ranges_for_representations(&self, representation_ids: &[&str]) -> Vec<TimeRange> {
        self.entries
            .iter()
            .filter(|entry| {
                representation_ids.contains(&entry.context.representation_id.as_str())
            })
            .filter_map(|entry| entry.buffered_range())
            .collect()
    }
}
