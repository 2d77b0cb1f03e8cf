//! Representation buffer
//!
//! The clock-driven loop buffering one representation: on every tick it
//! works out which segments the wanted window still misses, fetches them
//! through the loader, parses them, and pushes them through the
//! serialized queue, keeping the inventory in sync and reporting
//! progress upward.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::clock::ClockReceiver;
use crate::config::EngineConfig;
use crate::error::{BufferError, MediaError, PlaybackWarning};
use crate::inventory::ChunkContext;
use crate::loader::{load_with_backoff, ParsedChunk, SegmentLoader, SegmentParser};
use crate::manifest::SegmentInfo;
use crate::queue::PushedChunk;
use crate::raw::AppendedData;
use crate::store::BufferHandle;

use super::{BufferContent, RepresentationEvent};

pub(crate) struct RepresentationBufferArgs {
    pub content: BufferContent,
    pub clock: ClockReceiver,
    pub handle: BufferHandle,
    pub loader: Arc<dyn SegmentLoader>,
    pub parser: Arc<dyn SegmentParser>,
    pub config: Arc<EngineConfig>,
    pub events: mpsc::UnboundedSender<RepresentationEvent>,
}

pub(crate) struct RepresentationBuffer {
    content: BufferContent,
    clock: ClockReceiver,
    handle: BufferHandle,
    loader: Arc<dyn SegmentLoader>,
    parser: Arc<dyn SegmentParser>,
    config: Arc<EngineConfig>,
    events: mpsc::UnboundedSender<RepresentationEvent>,
    /// Init bytes of this representation, kept for re-pushes
    init_data: Option<bytes::Bytes>,
    init_pushed: bool,
    was_full: bool,
}

impl RepresentationBuffer {
    pub fn new(args: RepresentationBufferArgs) -> Self {
        Self {
            content: args.content,
            clock: args.clock,
            handle: args.handle,
            loader: args.loader,
            parser: args.parser,
            config: args.config,
            events: args.events,
            init_data: None,
            init_pushed: false,
            was_full: false,
        }
    }

    /// Drive the buffering loop until cancelled or failed. Cancellation
    /// is dropping the returned future: queued but not-yet-in-flight
    /// queue operations are cancelled with it.
    pub async fn run(mut self) {
        loop {
            if self.step().await.is_err() {
                return;
            }
            if self.clock.changed().await.is_err() {
                return;
            }
        }
    }

    /// One evaluation of the buffer against the current tick
    async fn step(&mut self) -> Result<(), ()> {
        let tick = *self.clock.borrow();
        let period = self.content.period.clone();
        let wanted = tick.wanted_position().max(period.start);
        let ahead = self.config.buffer.wanted_buffer_ahead_secs;
        let period_end = period.end().unwrap_or(f64::INFINITY);
        let target = (wanted + ahead).min(period_end);
        let index = self.content.representation.index.clone();

        if !self.init_pushed {
            if let Some(init_segment) = index.init_segment() {
                self.fetch_and_push(init_segment, tick).await?;
            }
            self.init_pushed = true;
        }

        let needed = self.needed_segments(wanted, (target - wanted).max(0.0));
        if !needed.is_empty() {
            if self.was_full && period.contains(tick.wanted_position()) {
                // the buffer was complete and must load again
                self.was_full = false;
                let _ = self.events.send(RepresentationEvent::ActiveBuffer);
            }
            self.was_full = false;
            for segment in needed {
                self.fetch_and_push(segment, tick).await?;
            }
        }

        // full once nothing is missing and the window reaches the period
        // end (or the index will never announce more)
        let remaining = self.needed_segments(wanted, (target - wanted).max(0.0));
        if remaining.is_empty() {
            let reached_end = match period.end() {
                Some(end) => wanted + ahead >= end - 1e-3,
                None => {
                    index.is_finished()
                        && index
                            .last_position()
                            .map_or(false, |last| wanted + ahead >= last)
                }
            };
            if reached_end && !self.was_full {
                self.was_full = true;
                let _ = self.events.send(RepresentationEvent::FullBuffer);
            }
        }
        Ok(())
    }

    /// Segments of the wanted window whose interval is not yet covered
    /// by any pushed chunk and whose availability has not expired
    fn needed_segments(&self, from: f64, duration: f64) -> Vec<SegmentInfo> {
        if duration <= 0.0 {
            return Vec::new();
        }
        let index = &self.content.representation.index;
        let inventory = self.handle.inventory.lock();
        index
            .segments(from, duration)
            .into_iter()
            .filter(|segment| !inventory.covers(segment.start_secs, segment.end_secs()))
            .filter(|segment| index.is_segment_still_available(segment) != Some(false))
            .collect()
    }

    async fn fetch_and_push(
        &mut self,
        segment: SegmentInfo,
        tick: crate::clock::ClockTick,
    ) -> Result<(), ()> {
        let content = self.content.segment_content(segment.clone());
        let index = &self.content.representation.index;

        let loaded =
            match load_with_backoff(self.loader.as_ref(), &content, &self.config.backoff).await {
                Ok(loaded) => loaded,
                Err(error) => {
                    if index.can_be_out_of_sync_error(&error) {
                        tracing::warn!(
                            "representation {}: segment {} missing upstream, index may be out of sync",
                            self.content.representation.id,
                            segment.id
                        );
                    }
                    let _ = self
                        .events
                        .send(RepresentationEvent::Warning(PlaybackWarning::Network(error)));
                    return Ok(());
                }
            };

        let parsed = match self.parser.parse(&loaded, &content) {
            Ok(parsed) => parsed,
            Err(MediaError::ReloadRequired(reason)) => {
                tracing::info!(
                    "representation {}: reload required ({})",
                    self.content.representation.id,
                    reason
                );
                let _ = self.events.send(RepresentationEvent::NeedsReload { tick });
                return Err(());
            }
            Err(error) => {
                let _ = self
                    .events
                    .send(RepresentationEvent::Warning(PlaybackWarning::Media(error)));
                return Ok(());
            }
        };

        match parsed {
            ParsedChunk::InitSegment { data } => {
                self.init_data = Some(data.clone());
                let chunk = PushedChunk {
                    codec: self.content.representation.codec.clone(),
                    timestamp_offset: 0.0,
                    append_window: self.period_append_window(),
                    init_data: Some(data),
                    media: None,
                };
                self.submit(chunk).await?;
            }
            ParsedChunk::MediaSegment {
                data,
                timing,
                offset_secs,
                append_window,
            } => {
                let start = timing.map(|t| t.time).unwrap_or(segment.start_secs);
                let duration = timing
                    .and_then(|t| t.duration)
                    .unwrap_or(segment.duration_secs);
                let size = loaded.size.unwrap_or(data.len());

                let securities = &self.config.append_window;
                let default_window = self.period_append_window();
                let window = (
                    append_window
                        .0
                        .map(|s| (s - securities.start_secs).max(0.0))
                        .or(default_window.0),
                    append_window
                        .1
                        .map(|e| e + securities.end_secs)
                        .or(default_window.1),
                );

                let chunk = PushedChunk {
                    codec: self.content.representation.codec.clone(),
                    timestamp_offset: offset_secs,
                    append_window: window,
                    init_data: self.init_data.clone(),
                    media: Some(AppendedData::media(data, start, start + duration)),
                };
                let ranges = self.submit(chunk).await?;

                // the retained interval is the pushed one, shifted by the
                // offset and clamped to the append window
                let requested_start =
                    (start + offset_secs).max(window.0.unwrap_or(0.0));
                let requested_end =
                    (start + duration + offset_secs).min(window.1.unwrap_or(f64::INFINITY));
                if requested_end > requested_start {
                    let mut inventory = self.handle.inventory.lock();
                    inventory.insert_chunk(
                        self.chunk_context(),
                        segment,
                        requested_start,
                        requested_end,
                        Some(size),
                    );
                    inventory.synchronize_buffered(&ranges);
                }
                let _ = self.events.send(RepresentationEvent::AddedSegment {
                    content,
                    buffered: ranges,
                });
            }
        }
        Ok(())
    }

    /// Queue the chunk and surface queue failures upward
    async fn submit(&self, chunk: PushedChunk) -> Result<Vec<crate::raw::time_ranges::TimeRange>, ()> {
        match self.handle.queue.push_chunk(chunk).wait().await {
            Ok(ranges) => Ok(ranges),
            Err(BufferError::Disposed) | Err(BufferError::Aborted) => Err(()),
            Err(error) => {
                let _ = self.events.send(RepresentationEvent::Failed {
                    reason: error.to_string(),
                });
                Err(())
            }
        }
    }

    /// Default append window: the period bounds, widened by the
    /// configured securities so boundary samples survive rounding
    fn period_append_window(&self) -> (Option<f64>, Option<f64>) {
        let securities = &self.config.append_window;
        let start = (self.content.period.start - securities.start_secs).max(0.0);
        let end = self.content.period.end().map(|e| e + securities.end_secs);
        (Some(start), end)
    }

    fn chunk_context(&self) -> ChunkContext {
        ChunkContext {
            period_id: self.content.period.id.clone(),
            adaptation_id: self.content.adaptation.id.clone(),
            representation_id: self.content.representation.id.clone(),
            bitrate: self.content.representation.bitrate,
        }
    }
}
