//! Timeline-backed segment index
//!
//! Indexes a representation whose segments are announced as a sequence of
//! `<S t="..." d="..." r="..."/>` elements. The element list is parsed
//! lazily on the first query and evicted from the front as the timeshift
//! window advances; an evicted entry is never reintroduced.

use parking_lot::Mutex;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::NetworkError;
use crate::manifest::{SegmentIndex, SegmentInfo};

/// One parsed timeline element: a run of `repeat_count + 1` segments of
/// equal duration starting at `start` (index time)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineElement {
    pub start: i64,
    pub duration: i64,
    /// Number of additional segments after the first; `-1` means "repeat
    /// until the period end"
    pub repeat_count: i64,
}

impl TimelineElement {
    /// End of the run in index time; `horizon` bounds an open-ended repeat
    fn end(&self, horizon: Option<i64>) -> i64 {
        if self.repeat_count >= 0 {
            self.start + self.duration * (self.repeat_count + 1)
        } else {
            horizon.unwrap_or(i64::MAX)
        }
    }
}

/// Construction parameters for a [`TimelineIndex`]
#[derive(Debug, Clone)]
pub struct TimelineIndexOptions {
    pub timescale: u32,
    /// Offset subtracted from media time by the packager, in index time
    pub presentation_time_offset: i64,
    /// Period start in presentation-time seconds
    pub period_start: f64,
    /// Period end in presentation-time seconds, when known
    pub period_end: Option<f64>,
    pub is_dynamic: bool,
    pub start_number: Option<u64>,
    pub initialization_urls: Vec<String>,
    pub media_urls: Vec<String>,
    /// The raw `<SegmentTimeline>` element, parsed on first query
    pub timeline_xml: String,
}

#[derive(Debug)]
struct TimelineState {
    raw_xml: Option<String>,
    timeline: Option<Vec<TimelineElement>>,
}

/// Lazy, evictable segment index over a timeline element list
#[derive(Debug)]
pub struct TimelineIndex {
    timescale: u32,
    /// `presentation_time_offset - period_start * timescale`; added when
    /// converting seconds to index time
    index_time_offset: i64,
    period_start_scaled: i64,
    scaled_period_end: Option<i64>,
    is_dynamic: bool,
    start_number: Option<u64>,
    initialization_urls: Vec<String>,
    media_urls: Vec<String>,
    state: Mutex<TimelineState>,
}

impl TimelineIndex {
    pub fn new(options: TimelineIndexOptions) -> Self {
        let timescale = options.timescale.max(1);
        let period_start_scaled = (options.period_start * timescale as f64).round() as i64;
        let index_time_offset = options.presentation_time_offset - period_start_scaled;
        let scaled_period_end = options
            .period_end
            .map(|end| (end * timescale as f64).round() as i64 + index_time_offset);
        Self {
            timescale,
            index_time_offset,
            period_start_scaled,
            scaled_period_end,
            is_dynamic: options.is_dynamic,
            start_number: options.start_number,
            initialization_urls: options.initialization_urls,
            media_urls: options.media_urls,
            state: Mutex::new(TimelineState {
                raw_xml: Some(options.timeline_xml),
                timeline: None,
            }),
        }
    }

    fn to_index_time(&self, secs: f64) -> i64 {
        (secs * self.timescale as f64).round() as i64 + self.index_time_offset
    }

    fn from_index_time(&self, index_time: i64) -> f64 {
        (index_time - self.index_time_offset) as f64 / self.timescale as f64
    }

    /// Advance the availability cursor: drop timeline entries that fell
    /// out of the timeshift window. Entries are only ever removed.
    pub fn clear_timeline_from_position(&self, first_available_secs: f64) {
        let cutoff = self.to_index_time(first_available_secs);
        let mut state = self.state.lock();
        Self::ensure_parsed(
            &mut state,
            self.period_start_scaled,
            self.scaled_period_end,
        );
        let Some(timeline) = state.timeline.as_mut() else {
            return;
        };
        while let Some(first) = timeline.first().copied() {
            if first.end(self.scaled_period_end) <= cutoff {
                timeline.remove(0);
                continue;
            }
            if first.start < cutoff {
                // cut into a repeated run: advance by whole segments
                let skipped = (cutoff - first.start) / first.duration;
                if skipped > 0 {
                    let head = &mut timeline[0];
                    head.start += skipped * head.duration;
                    if head.repeat_count >= 0 {
                        head.repeat_count -= skipped;
                    }
                }
            }
            break;
        }
    }

    /// Parsed timeline elements (parsing on first call)
    pub fn elements(&self) -> Vec<TimelineElement> {
        let mut state = self.state.lock();
        Self::ensure_parsed(
            &mut state,
            self.period_start_scaled,
            self.scaled_period_end,
        );
        state.timeline.clone().unwrap_or_default()
    }

    fn ensure_parsed(
        state: &mut TimelineState,
        period_start_scaled: i64,
        scaled_period_end: Option<i64>,
    ) {
        if state.timeline.is_some() {
            return;
        }
        let parsed = state
            .raw_xml
            .take()
            .map(|xml| parse_timeline_xml(&xml, period_start_scaled, scaled_period_end))
            .unwrap_or_default();
        state.timeline = Some(parsed);
    }

    /// End of the last generated segment in index time, when bounded
    fn last_generated_end(&self, timeline: &[TimelineElement]) -> Option<i64> {
        let last = timeline.last()?;
        if last.repeat_count >= 0 {
            Some(last.end(None))
        } else {
            self.scaled_period_end
        }
    }

    fn make_segment(&self, start: i64, duration: i64, number: u64) -> SegmentInfo {
        let media_urls = self
            .media_urls
            .iter()
            .map(|url| fill_template(url, start, number))
            .collect();
        SegmentInfo {
            id: start.to_string(),
            time: start,
            timescale: self.timescale,
            duration,
            is_init: false,
            media_urls,
            byte_range: None,
            start_secs: self.from_index_time(start),
            duration_secs: duration as f64 / self.timescale as f64,
        }
    }
}

impl SegmentIndex for TimelineIndex {
    fn init_segment(&self) -> Option<SegmentInfo> {
        if self.initialization_urls.is_empty() {
            return None;
        }
        Some(SegmentInfo {
            id: "init".to_string(),
            time: 0,
            timescale: self.timescale,
            duration: 0,
            is_init: true,
            media_urls: self.initialization_urls.clone(),
            byte_range: None,
            start_secs: 0.0,
            duration_secs: 0.0,
        })
    }

    fn segments(&self, from_secs: f64, duration_secs: f64) -> Vec<SegmentInfo> {
        let from = self.to_index_time(from_secs);
        let to = self.to_index_time(from_secs + duration_secs);
        let timeline = self.elements();

        // skip whole runs ending before the window
        let first_idx = timeline.partition_point(|el| el.end(self.scaled_period_end) <= from);

        // absolute segment number of the first segment of `first_idx`
        let mut number = self.start_number.unwrap_or(1);
        for el in &timeline[..first_idx] {
            number += (el.repeat_count.max(0) + 1) as u64;
        }

        let mut result = Vec::new();
        for el in &timeline[first_idx..] {
            if el.start >= to {
                break;
            }
            let run_end = el.end(self.scaled_period_end).min(
                // open-ended runs are expanded no further than the window
                if el.repeat_count < 0 { to } else { i64::MAX },
            );
            let mut seg_start = el.start;
            let mut seg_number = number;
            if from > el.start {
                let skipped = (from - el.start) / el.duration;
                seg_start += skipped * el.duration;
                seg_number += skipped as u64;
            }
            while seg_start < run_end && seg_start < to {
                let seg_duration = el.duration.min(run_end - seg_start);
                if seg_start + seg_duration > from {
                    result.push(self.make_segment(seg_start, seg_duration, seg_number));
                }
                seg_start += el.duration;
                seg_number += 1;
            }
            number += (el.repeat_count.max(0) + 1) as u64;
        }
        result
    }

    fn first_position(&self) -> Option<f64> {
        let timeline = self.elements();
        timeline.first().map(|el| self.from_index_time(el.start))
    }

    fn last_position(&self) -> Option<f64> {
        let timeline = self.elements();
        self.last_generated_end(&timeline)
            .map(|end| self.from_index_time(end))
    }

    fn is_segment_still_available(&self, segment: &SegmentInfo) -> Option<bool> {
        if segment.is_init {
            return Some(true);
        }
        let timeline = self.elements();
        let Some(first) = timeline.first() else {
            return Some(false);
        };
        if segment.time < first.start {
            return Some(false);
        }
        for el in &timeline {
            let end = el.end(self.scaled_period_end);
            if segment.time < end {
                let aligned = (segment.time - el.start) % el.duration == 0;
                return Some(aligned && segment.duration == el.duration);
            }
        }
        // past every announced segment
        if self.is_dynamic {
            None
        } else {
            Some(false)
        }
    }

    fn check_discontinuity(&self, time_secs: f64) -> Option<f64> {
        let index_time = self.to_index_time(time_secs);
        let timeline = self.elements();
        for el in &timeline {
            if index_time < el.start {
                return Some(self.from_index_time(el.start));
            }
            if index_time < el.end(self.scaled_period_end) {
                return None;
            }
        }
        None
    }

    fn should_refresh(&self, up_to_secs: f64) -> bool {
        if !self.is_dynamic || self.is_finished() {
            return false;
        }
        let timeline = self.elements();
        match self.last_generated_end(&timeline) {
            Some(end) => self.to_index_time(up_to_secs) > end,
            None => timeline.is_empty(),
        }
    }

    fn is_finished(&self) -> bool {
        if !self.is_dynamic {
            return true;
        }
        let Some(period_end) = self.scaled_period_end else {
            return false;
        };
        let timeline = self.elements();
        match self.last_generated_end(&timeline) {
            Some(end) => end as f64 + self.timescale as f64 / 60.0 >= period_end as f64,
            None => false,
        }
    }

    fn can_be_out_of_sync_error(&self, error: &NetworkError) -> bool {
        self.is_dynamic && error.is_http_error(404)
    }
}

/// Substitute `$Time$` and `$Number$` in a media URL template
fn fill_template(url: &str, time: i64, number: u64) -> String {
    url.replace("$Time$", &time.to_string())
        .replace("$Number$", &number.to_string())
}

/// Parse the `<S>` children of a `<SegmentTimeline>` element.
///
/// Resolution rules:
/// - missing `t` on the first entry: the scaled period start
/// - missing `t` later: previous start plus the previous run's span
/// - missing `d`: the gap to the next entry's `t`; dropped with a warning
///   when there is no next `t`
/// - `r = -1`: resolved against the next entry or the period end, kept
///   open-ended when neither is known
fn parse_timeline_xml(
    xml: &str,
    period_start_scaled: i64,
    scaled_period_end: Option<i64>,
) -> Vec<TimelineElement> {
    let mut raw: Vec<(Option<i64>, Option<i64>, i64)> = Vec::new();
    let mut reader = Reader::from_reader(xml.as_bytes());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(el)) | Ok(Event::Start(el)) => {
                if el.name().as_ref() == b"S" {
                    let mut t = None;
                    let mut d = None;
                    let mut r = 0i64;
                    for attr in el.attributes().flatten() {
                        let value = String::from_utf8_lossy(&attr.value);
                        match attr.key.as_ref() {
                            b"t" => t = value.parse::<i64>().ok(),
                            b"d" => d = value.parse::<i64>().ok(),
                            b"r" => r = value.parse::<i64>().unwrap_or(0),
                            _ => {}
                        }
                    }
                    raw.push((t, d, r));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("unreadable segment timeline: {}", e);
                break;
            }
        }
        buf.clear();
    }

    let mut timeline: Vec<TimelineElement> = Vec::with_capacity(raw.len());
    for (i, (t, d, r)) in raw.iter().enumerate() {
        let start = match t {
            Some(t) => *t,
            None => match timeline.last() {
                Some(prev) if prev.repeat_count >= 0 => {
                    prev.start + prev.duration * (prev.repeat_count + 1)
                }
                Some(_) => {
                    tracing::warn!("timeline entry {} follows an open-ended repeat without an explicit start, dropping it", i);
                    continue;
                }
                None => period_start_scaled,
            },
        };
        let duration = match d {
            Some(d) => *d,
            None => match raw.get(i + 1).and_then(|(next_t, _, _)| *next_t) {
                Some(next_t) if next_t > start => next_t - start,
                _ => {
                    tracing::warn!(
                        "timeline entry {} has no duration and no successor start, dropping it",
                        i
                    );
                    continue;
                }
            },
        };
        if duration <= 0 {
            tracing::warn!("timeline entry {} has non-positive duration, dropping it", i);
            continue;
        }
        let repeat_count = if *r >= 0 {
            *r
        } else {
            // resolve "repeat until period end" against the next entry or
            // the period end when either is known
            let bound = raw
                .get(i + 1)
                .and_then(|(next_t, _, _)| *next_t)
                .or(scaled_period_end);
            match bound {
                Some(bound) if bound > start => (bound - start + duration - 1) / duration - 1,
                _ => -1,
            }
        };
        timeline.push(TimelineElement {
            start,
            duration,
            repeat_count,
        });
    }
    timeline
}
