//! Decoder buffer capability
//!
//! A `RawBuffer` is the platform primitive a serialized queue drives: it
//! accepts one mutation at a time (`append_buffer` / `remove`), reports
//! quiescence through an event channel, and exposes the ranges it retains.
//! Native audio/video buffers wrap the platform media source; text and
//! image tracks use [`ManualRawBuffer`], which keeps its own range set.

pub mod time_ranges;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::BufferError;
use time_ranges::{ManualTimeRanges, TimeRange};

/// Event emitted by a decoder buffer after a mutation was started
#[derive(Debug, Clone, PartialEq)]
pub enum RawBufferEvent {
    /// The in-flight mutation finished; the buffer is quiescent again
    UpdateEnd,
    /// The in-flight mutation failed
    Error(String),
}

/// Receiving half of a decoder buffer's event channel
pub type RawBufferEvents = mpsc::UnboundedReceiver<RawBufferEvent>;

/// Data handed to [`RawBuffer::append_buffer`]
#[derive(Debug, Clone)]
pub struct AppendedData {
    pub bytes: Bytes,
    /// Presentation-time range covered by the data, when known from
    /// parsing. Custom buffers need it to maintain their range set;
    /// `None` for initialization data.
    pub time_range: Option<TimeRange>,
}

impl AppendedData {
    pub fn init(bytes: Bytes) -> Self {
        Self {
            bytes,
            time_range: None,
        }
    }

    pub fn media(bytes: Bytes, start: f64, end: f64) -> Self {
        Self {
            bytes,
            time_range: Some(TimeRange::new(start, end)),
        }
    }
}

/// Capability set shared by every decoder buffer variant
pub trait RawBuffer: Send {
    /// Begin appending `data`. Completion is signalled on the event
    /// channel with `UpdateEnd` (or `Error`).
    fn append_buffer(&mut self, data: AppendedData) -> Result<(), BufferError>;

    /// Begin removing `[start, end)` from the retained data
    fn remove(&mut self, start: f64, end: f64) -> Result<(), BufferError>;

    /// Drop any in-flight mutation and pending data
    fn abort(&mut self);

    /// True while a mutation is in flight
    fn updating(&self) -> bool;

    /// Ranges currently retained by the decoder
    fn buffered(&self) -> Vec<TimeRange>;

    fn timestamp_offset(&self) -> f64;
    fn set_timestamp_offset(&mut self, offset: f64);

    fn append_window_start(&self) -> f64;
    fn set_append_window_start(&mut self, start: f64);

    /// `f64::INFINITY` when no end is set
    fn append_window_end(&self) -> f64;
    fn set_append_window_end(&mut self, end: f64);

    fn codec(&self) -> &str;

    /// Attempt an in-place codec switch. Returns `false` when the
    /// platform cannot switch without a full reload.
    fn try_change_codec(&mut self, codec: &str) -> bool;
}

/// Range-tracking buffer for text and image tracks.
///
/// There is no decoder underneath: mutations complete immediately and the
/// retained ranges are exactly what was inserted, clamped to the append
/// window and shifted by the timestamp offset.
pub struct ManualRawBuffer {
    codec: String,
    ranges: ManualTimeRanges,
    timestamp_offset: f64,
    append_window_start: f64,
    append_window_end: f64,
    events: mpsc::UnboundedSender<RawBufferEvent>,
}

impl ManualRawBuffer {
    pub fn new(codec: &str) -> (Self, RawBufferEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                codec: codec.to_string(),
                ranges: ManualTimeRanges::new(),
                timestamp_offset: 0.0,
                append_window_start: 0.0,
                append_window_end: f64::INFINITY,
                events: tx,
            },
            rx,
        )
    }

    fn complete(&self) {
        let _ = self.events.send(RawBufferEvent::UpdateEnd);
    }
}

impl RawBuffer for ManualRawBuffer {
    fn append_buffer(&mut self, data: AppendedData) -> Result<(), BufferError> {
        if let Some(range) = data.time_range {
            let start = (range.start + self.timestamp_offset).max(self.append_window_start);
            let end = (range.end + self.timestamp_offset).min(self.append_window_end);
            if end > start {
                self.ranges.insert(start, end);
            }
        }
        self.complete();
        Ok(())
    }

    fn remove(&mut self, start: f64, end: f64) -> Result<(), BufferError> {
        self.ranges.remove(start, end);
        self.complete();
        Ok(())
    }

    fn abort(&mut self) {}

    fn updating(&self) -> bool {
        false
    }

    fn buffered(&self) -> Vec<TimeRange> {
        self.ranges.ranges().to_vec()
    }

    fn timestamp_offset(&self) -> f64 {
        self.timestamp_offset
    }

    fn set_timestamp_offset(&mut self, offset: f64) {
        self.timestamp_offset = offset;
    }

    fn append_window_start(&self) -> f64 {
        self.append_window_start
    }

    fn set_append_window_start(&mut self, start: f64) {
        self.append_window_start = start;
    }

    fn append_window_end(&self) -> f64 {
        self.append_window_end
    }

    fn set_append_window_end(&mut self, end: f64) {
        self.append_window_end = end;
    }

    fn codec(&self) -> &str {
        &self.codec
    }

    fn try_change_codec(&mut self, codec: &str) -> bool {
        self.codec = codec.to_string();
        true
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Simulated native decoder buffer for tests.
    //!
    //! Completes mutations asynchronously (after a small delay on the
    //! tokio clock), records every operation for assertions, and supports
    //! failure injection.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    pub enum MockOp {
        Append {
            len: usize,
            codec: String,
            timestamp_offset: f64,
            append_window: (f64, f64),
        },
        Remove {
            start: f64,
            end: f64,
        },
        CodecSwitch(String),
        Abort,
    }

    #[derive(Debug)]
    struct MockInner {
        codec: String,
        ranges: ManualTimeRanges,
        timestamp_offset: f64,
        append_window_start: f64,
        append_window_end: f64,
        updating: bool,
        ops: Vec<MockOp>,
        fail_next: bool,
        swallow_next_completion: bool,
        supports_codec_switch: bool,
        completion_delay: Duration,
    }

    pub struct MockRawBuffer {
        inner: Arc<Mutex<MockInner>>,
        events: mpsc::UnboundedSender<RawBufferEvent>,
        // codec mirrored outside the lock so `codec()` can return &str
        codec_cache: String,
    }

    /// Assertion/configuration handle shared with the test body
    #[derive(Clone)]
    pub struct MockHandle {
        inner: Arc<Mutex<MockInner>>,
    }

    impl MockHandle {
        pub fn ops(&self) -> Vec<MockOp> {
            self.inner.lock().ops.clone()
        }

        pub fn append_count(&self) -> usize {
            self.inner
                .lock()
                .ops
                .iter()
                .filter(|op| matches!(op, MockOp::Append { .. }))
                .count()
        }

        pub fn buffered(&self) -> Vec<TimeRange> {
            self.inner.lock().ranges.ranges().to_vec()
        }

        pub fn fail_next_operation(&self) {
            self.inner.lock().fail_next = true;
        }

        /// Complete the next mutation without emitting its event,
        /// simulating a platform that loses `updateend`
        pub fn swallow_next_completion(&self) {
            self.inner.lock().swallow_next_completion = true;
        }

        pub fn set_supports_codec_switch(&self, supported: bool) {
            self.inner.lock().supports_codec_switch = supported;
        }

        pub fn updating(&self) -> bool {
            self.inner.lock().updating
        }
    }

    impl MockRawBuffer {
        pub fn new(codec: &str) -> (Self, RawBufferEvents, MockHandle) {
            let (tx, rx) = mpsc::unbounded_channel();
            let inner = Arc::new(Mutex::new(MockInner {
                codec: codec.to_string(),
                ranges: ManualTimeRanges::new(),
                timestamp_offset: 0.0,
                append_window_start: 0.0,
                append_window_end: f64::INFINITY,
                updating: false,
                ops: Vec::new(),
                fail_next: false,
                swallow_next_completion: false,
                supports_codec_switch: true,
                completion_delay: Duration::from_millis(1),
            }));
            let handle = MockHandle {
                inner: inner.clone(),
            };
            (
                Self {
                    inner,
                    events: tx,
                    codec_cache: codec.to_string(),
                },
                rx,
                handle,
            )
        }

        fn start_mutation(&self, apply: impl FnOnce(&mut MockInner) + Send + 'static) {
            let inner = self.inner.clone();
            let events = self.events.clone();
            let delay = self.inner.lock().completion_delay;
            self.inner.lock().updating = true;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut guard = inner.lock();
                guard.updating = false;
                if guard.fail_next {
                    guard.fail_next = false;
                    let _ = events.send(RawBufferEvent::Error("simulated failure".into()));
                } else {
                    apply(&mut guard);
                    if guard.swallow_next_completion {
                        guard.swallow_next_completion = false;
                    } else {
                        let _ = events.send(RawBufferEvent::UpdateEnd);
                    }
                }
            });
        }
    }

    impl RawBuffer for MockRawBuffer {
        fn append_buffer(&mut self, data: AppendedData) -> Result<(), BufferError> {
            {
                let mut guard = self.inner.lock();
                if guard.updating {
                    return Err(BufferError::Rejected("mutation already in flight".into()));
                }
                let op = MockOp::Append {
                    len: data.bytes.len(),
                    codec: guard.codec.clone(),
                    timestamp_offset: guard.timestamp_offset,
                    append_window: (guard.append_window_start, guard.append_window_end),
                };
                guard.ops.push(op);
            }
            self.start_mutation(move |inner| {
                if let Some(range) = data.time_range {
                    let start =
                        (range.start + inner.timestamp_offset).max(inner.append_window_start);
                    let end = (range.end + inner.timestamp_offset).min(inner.append_window_end);
                    if end > start {
                        inner.ranges.insert(start, end);
                    }
                }
            });
            Ok(())
        }

        fn remove(&mut self, start: f64, end: f64) -> Result<(), BufferError> {
            {
                let mut guard = self.inner.lock();
                if guard.updating {
                    return Err(BufferError::Rejected("mutation already in flight".into()));
                }
                guard.ops.push(MockOp::Remove { start, end });
            }
            self.start_mutation(move |inner| {
                inner.ranges.remove(start, end);
            });
            Ok(())
        }

        fn abort(&mut self) {
            let mut guard = self.inner.lock();
            guard.updating = false;
            guard.ops.push(MockOp::Abort);
        }

        fn updating(&self) -> bool {
            self.inner.lock().updating
        }

        fn buffered(&self) -> Vec<TimeRange> {
            self.inner.lock().ranges.ranges().to_vec()
        }

        fn timestamp_offset(&self) -> f64 {
            self.inner.lock().timestamp_offset
        }

        fn set_timestamp_offset(&mut self, offset: f64) {
            self.inner.lock().timestamp_offset = offset;
        }

        fn append_window_start(&self) -> f64 {
            self.inner.lock().append_window_start
        }

        fn set_append_window_start(&mut self, start: f64) {
            self.inner.lock().append_window_start = start;
        }

        fn append_window_end(&self) -> f64 {
            self.inner.lock().append_window_end
        }

        fn set_append_window_end(&mut self, end: f64) {
            self.inner.lock().append_window_end = end;
        }

        fn codec(&self) -> &str {
            &self.codec_cache
        }

        fn try_change_codec(&mut self, codec: &str) -> bool {
            let mut guard = self.inner.lock();
            if !guard.supports_codec_switch {
                return false;
            }
            guard.codec = codec.to_string();
            guard.ops.push(MockOp::CodecSwitch(codec.to_string()));
            drop(guard);
            self.codec_cache = codec.to_string();
            true
        }
    }
}
