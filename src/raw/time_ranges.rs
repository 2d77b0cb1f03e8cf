//! Buffered time-range arithmetic
//!
//! Decoder buffers report what they retain as a sorted list of disjoint
//! time ranges. Custom (text/image) buffers maintain the same shape from
//! explicit insert/remove calls. All comparisons use a small tolerance to
//! absorb decoder-reported boundary drift.

/// Tolerance, in seconds, absorbing decoder boundary rounding (one frame
/// at 60fps).
pub const RANGE_TOLERANCE: f64 = 1.0 / 60.0;

/// A half-open time interval `[start, end)` in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// True if `time` falls inside this range
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }

    /// True if the two ranges share any time
    pub fn intersects(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The overlapping part of two ranges, if any
    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(TimeRange::new(start, end))
        } else {
            None
        }
    }
}

/// Find the range containing `time`, tolerating boundary drift
pub fn range_for_time(ranges: &[TimeRange], time: f64) -> Option<&TimeRange> {
    ranges
        .iter()
        .find(|r| time >= r.start - RANGE_TOLERANCE && time < r.end + RANGE_TOLERANCE)
}

/// True if `time` falls inside any of `ranges`
pub fn is_time_in_ranges(ranges: &[TimeRange], time: f64) -> bool {
    range_for_time(ranges, time).is_some()
}

/// Buffered-range set maintained from explicit insert/remove calls.
/// Kept sorted and disjoint; adjacent ranges within tolerance are merged.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeRanges {
    ranges: Vec<TimeRange>,
}

impl ManualTimeRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Insert `[start, end)`, merging with any range it touches
    pub fn insert(&mut self, start: f64, end: f64) {
        if end - start <= 0.0 {
            return;
        }
        let mut new_start = start;
        let mut new_end = end;
        let mut i = 0;
        while i < self.ranges.len() {
            let r = self.ranges[i];
            if r.end + RANGE_TOLERANCE < new_start {
                i += 1;
                continue;
            }
            if r.start - RANGE_TOLERANCE > new_end {
                break;
            }
            // touching or overlapping: absorb
            new_start = new_start.min(r.start);
            new_end = new_end.max(r.end);
            self.ranges.remove(i);
        }
        self.ranges.insert(i, TimeRange::new(new_start, new_end));
        // keep sorted after absorbing ranges before the insertion point
        self.ranges
            .sort_by(|a, b| a.start.total_cmp(&b.start));
    }

    /// Remove `[start, end)`, truncating or splitting intersecting ranges
    pub fn remove(&mut self, start: f64, end: f64) {
        if end - start <= 0.0 {
            return;
        }
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        for r in &self.ranges {
            if r.end <= start || r.start >= end {
                result.push(*r);
                continue;
            }
            if r.start < start {
                result.push(TimeRange::new(r.start, start));
            }
            if r.end > end {
                result.push(TimeRange::new(end, r.end));
            }
        }
        self.ranges = result;
    }

    pub fn range_for_time(&self, time: f64) -> Option<TimeRange> {
        range_for_time(&self.ranges, time).copied()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}
