//! Period orchestrator
//!
//! Chains per-period buffers into a seamless timeline, one lane per
//! enabled track type:
//! - creates the buffer for the period under the playback position, then
//!   the next period's as soon as the current one reports full
//! - tears lanes down and restarts them on out-of-window seeks,
//!   decipherability changes and unrecoverable buffering errors
//! - aggregates per-type completion into end-of-stream, watches the
//!   position against the manifest bounds, and reports the active period

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::clock::ClockReceiver;
use crate::config::EngineConfig;
use crate::error::{MediaError, PlaybackWarning};
use crate::gc::{collect_garbage, GcLimits};
use crate::loader::{SegmentLoader, SegmentParser};
use crate::manifest::{Manifest, ManifestEvent, ManifestEvents, Period, TrackType};
use crate::store::BufferStore;

use super::period::{PeriodBufferArgs, PeriodBufferHandle, TaggedEvent};
use super::{AbrSelector, OrchestratorEvent, RepresentationEvent, TrackSelector};

pub struct OrchestratorArgs {
    pub manifest: Arc<Manifest>,
    pub clock: ClockReceiver,
    pub store: Arc<BufferStore>,
    pub loader: Arc<dyn SegmentLoader>,
    pub parser: Arc<dyn SegmentParser>,
    pub tracks: Arc<dyn TrackSelector>,
    pub abr: Arc<dyn AbrSelector>,
    pub config: Arc<EngineConfig>,
    /// Track types to buffer; audio and video normally, text/image when
    /// those features are wired up
    pub enabled_types: Vec<TrackType>,
    pub manifest_events: ManifestEvents,
}

/// Owning handle over the whole orchestration task tree
pub struct PeriodOrchestrator {
    tasks: Vec<JoinHandle<()>>,
}

impl PeriodOrchestrator {
    /// Start buffering; events arrive on the returned receiver until
    /// shutdown
    pub fn spawn(args: OrchestratorArgs) -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (agg_tx, agg_rx) = mpsc::unbounded_channel();
        let (manifest_tx, _) = broadcast::channel(64);
        let mut tasks = Vec::new();

        // fan incoming manifest events out to every lane
        {
            let manifest_tx = manifest_tx.clone();
            let mut incoming = args.manifest_events;
            tasks.push(tokio::spawn(async move {
                while let Some(event) = incoming.recv().await {
                    let _ = manifest_tx.send(event);
                }
            }));
        }

        for track_type in &args.enabled_types {
            let (pb_tx, pb_rx) = mpsc::unbounded_channel();
            let lane = TypeOrchestrator {
                track_type: *track_type,
                manifest: args.manifest.clone(),
                clock: args.clock.clone(),
                store: args.store.clone(),
                loader: args.loader.clone(),
                parser: args.parser.clone(),
                tracks: args.tracks.clone(),
                abr: args.abr.clone(),
                config: args.config.clone(),
                agg: agg_tx.clone(),
                pb_tx,
                pb_rx,
                manifest_rx: manifest_tx.subscribe(),
                manifest_open: true,
                periods: Vec::new(),
                pending_period: None,
                complete: false,
            };
            tasks.push(tokio::spawn(lane.run()));
        }

        let aggregator = Aggregator {
            manifest: args.manifest.clone(),
            clock: args.clock.clone(),
            rx: agg_rx,
            manifest_rx: manifest_tx.subscribe(),
            manifest_open: true,
            out: out_tx,
            enabled: args.enabled_types.clone(),
            complete: HashSet::new(),
            ended: false,
            active_period: None,
            warned_before: false,
            warned_after: false,
        };
        tasks.push(tokio::spawn(aggregator.run()));

        (Self { tasks }, out_rx)
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for PeriodOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Message from a lane to the aggregator
enum AggregatorMsg {
    Event(OrchestratorEvent),
    Complete(TrackType),
    Resumed(TrackType),
}

/// The consecutive-period buffering process for one track type
struct TypeOrchestrator {
    track_type: TrackType,
    manifest: Arc<Manifest>,
    clock: ClockReceiver,
    store: Arc<BufferStore>,
    loader: Arc<dyn SegmentLoader>,
    parser: Arc<dyn SegmentParser>,
    tracks: Arc<dyn TrackSelector>,
    abr: Arc<dyn AbrSelector>,
    config: Arc<EngineConfig>,
    agg: mpsc::UnboundedSender<AggregatorMsg>,
    pb_tx: mpsc::UnboundedSender<TaggedEvent>,
    pb_rx: mpsc::UnboundedReceiver<TaggedEvent>,
    manifest_rx: broadcast::Receiver<ManifestEvent>,
    manifest_open: bool,
    /// Live period buffers, sorted by period start
    periods: Vec<PeriodBufferHandle>,
    /// Unresolved period buffering waits on
    pending_period: Option<Arc<Period>>,
    complete: bool,
}

impl TypeOrchestrator {
    async fn run(mut self) {
        let wanted = self.clock.borrow().wanted_position();
        if let Some(period) = self.resolve_period(wanted) {
            self.start_period(period);
        }
        loop {
            tokio::select! {
                Some((period_id, event)) = self.pb_rx.recv() => {
                    self.handle_event(period_id, event).await;
                }
                changed = self.clock.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    self.handle_tick().await;
                }
                event = self.manifest_rx.recv(), if self.manifest_open => match event {
                    Ok(event) => self.handle_manifest_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "{}: dropped {} manifest events",
                            self.track_type,
                            skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.manifest_open = false;
                    }
                },
            }
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.agg.send(AggregatorMsg::Event(event));
    }

    /// The period containing `time`, or the first one starting after it
    /// (skipping over gaps between periods)
    fn resolve_period(&self, time: f64) -> Option<Arc<Period>> {
        self.manifest.period_for_time(time).cloned().or_else(|| {
            self.manifest
                .periods()
                .iter()
                .find(|p| p.start >= time)
                .cloned()
        })
    }

    fn has_period(&self, period_id: &str) -> bool {
        self.periods.iter().any(|p| p.period.id == period_id)
    }

    fn start_period(&mut self, period: Arc<Period>) {
        if self.has_period(&period.id) {
            return;
        }
        if !period.is_loaded {
            if self
                .pending_period
                .as_ref()
                .map_or(true, |p| p.id != period.id)
            {
                tracing::debug!(
                    "{}: period {} needs loading before buffering",
                    self.track_type,
                    period.id
                );
                self.pending_period = Some(period.clone());
                self.emit(OrchestratorEvent::NeedsLoadedPeriod {
                    track_type: self.track_type,
                    period,
                });
            }
            return;
        }
        tracing::debug!(
            "{}: starting period buffer for {} at {:.3}s",
            self.track_type,
            period.id,
            period.start
        );
        let handle = PeriodBufferHandle::spawn(PeriodBufferArgs {
            manifest: self.manifest.clone(),
            period: period.clone(),
            track_type: self.track_type,
            clock: self.clock.clone(),
            store: self.store.clone(),
            loader: self.loader.clone(),
            parser: self.parser.clone(),
            tracks: self.tracks.clone(),
            abr: self.abr.clone(),
            config: self.config.clone(),
            events: self.pb_tx.clone(),
        });
        let position = self
            .periods
            .partition_point(|p| p.period.start <= period.start);
        self.periods.insert(position, handle);
    }

    fn destroy_all(&mut self) {
        while let Some(handle) = self.periods.pop() {
            handle.destroy();
            self.emit(OrchestratorEvent::PeriodBufferCleared {
                track_type: self.track_type,
                period_id: handle.period.id.clone(),
            });
        }
        self.pending_period = None;
    }

    fn mark_incomplete(&mut self) {
        if self.complete {
            self.complete = false;
            let _ = self.agg.send(AggregatorMsg::Resumed(self.track_type));
        }
    }

    async fn handle_event(&mut self, period_id: String, event: RepresentationEvent) {
        match event {
            RepresentationEvent::AddedSegment { content, buffered } => {
                self.emit(OrchestratorEvent::AddedSegment {
                    track_type: self.track_type,
                    content,
                    buffered,
                });
            }
            RepresentationEvent::FullBuffer => {
                self.emit(OrchestratorEvent::FullBuffer {
                    track_type: self.track_type,
                });
                let Some(period) = self.manifest.period_by_id(&period_id).cloned() else {
                    return;
                };
                match self.manifest.period_after(&period).cloned() {
                    Some(next) => self.start_period(next),
                    None => {
                        if !self.manifest.is_dynamic && !self.complete {
                            self.complete = true;
                            let _ = self.agg.send(AggregatorMsg::Complete(self.track_type));
                        }
                    }
                }
            }
            RepresentationEvent::ActiveBuffer => {
                self.emit(OrchestratorEvent::ActiveBuffer {
                    track_type: self.track_type,
                });
                self.mark_incomplete();
                // downstream buffers are stale: tear them down, they are
                // recreated on the next full
                if let Some(position) = self
                    .periods
                    .iter()
                    .position(|p| p.period.id == period_id)
                {
                    while self.periods.len() > position + 1 {
                        if let Some(removed) = self.periods.pop() {
                            removed.destroy();
                            self.emit(OrchestratorEvent::PeriodBufferCleared {
                                track_type: self.track_type,
                                period_id: removed.period.id.clone(),
                            });
                        }
                    }
                }
            }
            RepresentationEvent::NeedsReload { tick } => {
                self.emit(OrchestratorEvent::NeedsMediaSourceReload { tick });
            }
            RepresentationEvent::Warning(warning) => {
                self.emit(OrchestratorEvent::Warning {
                    track_type: Some(self.track_type),
                    warning,
                });
            }
            RepresentationEvent::Failed { reason } => {
                tracing::warn!(
                    "{}: buffering failed ({}), rebuilding from the current position",
                    self.track_type,
                    reason
                );
                self.destroy_all();
                // the queue may be in a broken state: rebuild it too
                self.store.dispose(self.track_type);
                self.mark_incomplete();
                let wanted = self.clock.borrow().wanted_position();
                if let Some(period) = self.resolve_period(wanted) {
                    self.start_period(period);
                }
            }
        }
    }

    async fn handle_tick(&mut self) {
        let tick = *self.clock.borrow();
        let wanted = tick.wanted_position();

        // restart when the position leaves the span of managed periods
        // (only meaningful once something is managed)
        let managed_span = match (self.periods.first(), self.periods.last()) {
            (Some(first), Some(last)) => Some((first.period.start, last.period.end())),
            _ => None,
        };
        if let Some((first_start, last_end)) = managed_span {
            let outside =
                wanted < first_start || last_end.map_or(false, |end| wanted >= end);
            if outside {
                if let Some(period) = self.resolve_period(wanted) {
                    tracing::info!(
                        "{}: position {:.3} outside managed periods, restarting at {}",
                        self.track_type,
                        wanted,
                        period.id
                    );
                    self.destroy_all();
                    self.mark_incomplete();
                    self.start_period(period);
                    return;
                }
            }
        }

        // periods the clock has passed are done for good
        while let Some(first) = self.periods.first() {
            let passed = first.period.end().map_or(false, |end| wanted >= end);
            if !passed {
                break;
            }
            let removed = self.periods.remove(0);
            removed.destroy();
            self.emit(OrchestratorEvent::PeriodBufferCleared {
                track_type: self.track_type,
                period_id: removed.period.id.clone(),
            });
        }

        // nothing managed anymore: come back up from the current
        // position if the manifest still has somewhere to go
        if self.periods.is_empty() && self.pending_period.is_none() {
            if let Some(period) = self.resolve_period(wanted) {
                self.mark_incomplete();
                self.start_period(period);
            }
        }

        // retention bounds
        if let Some(handle) = self.store.get(self.track_type) {
            let limits = GcLimits::effective(&self.config.buffer, &self.config.gc, self.track_type);
            if limits.max_behind_secs.is_some() || limits.max_ahead_secs.is_some() {
                if let Err(error) = collect_garbage(&handle.queue, wanted, limits).await {
                    tracing::warn!(
                        "{}: garbage collection failed: {}",
                        self.track_type,
                        error
                    );
                }
                let buffered = handle.queue.buffered();
                handle.inventory.lock().synchronize_buffered(&buffered);
            }
        }
    }

    async fn handle_manifest_event(&mut self, event: ManifestEvent) {
        match event {
            ManifestEvent::PeriodLoaded { period } => {
                if self
                    .pending_period
                    .as_ref()
                    .map_or(false, |p| p.id == period.id)
                {
                    self.pending_period = None;
                    self.start_period(period);
                }
            }
            ManifestEvent::DecipherabilityUpdate(updates) => {
                let affected: Vec<_> = updates
                    .iter()
                    .filter(|u| u.track_type == self.track_type)
                    .collect();
                if affected.is_empty() {
                    return;
                }
                let tick = *self.clock.borrow();
                // clear what belongs to representations that lost their key
                if let Some(handle) = self.store.get(self.track_type) {
                    let undecipherable: Vec<&str> = affected
                        .iter()
                        .filter(|u| !u.decipherable)
                        .map(|u| u.representation_id.as_str())
                        .collect();
                    if !undecipherable.is_empty() {
                        let ranges = handle
                            .inventory
                            .lock()
                            .ranges_for_representations(&undecipherable);
                        for range in ranges {
                            if let Err(error) = handle
                                .queue
                                .remove_buffer(range.start, range.end)
                                .wait()
                                .await
                            {
                                tracing::warn!(
                                    "{}: failed to clear undecipherable range [{:.3}, {:.3}]: {}",
                                    self.track_type,
                                    range.start,
                                    range.end,
                                    error
                                );
                            }
                        }
                        let buffered = handle.queue.buffered();
                        handle.inventory.lock().synchronize_buffered(&buffered);
                    }
                }
                // rebuild the lane from the current position; this whole
                // handler runs before the next tick is looked at, so the
                // out-of-window restart cannot fire mid-flush
                tracing::info!(
                    "{}: decipherability changed for {} representations, rebuilding",
                    self.track_type,
                    affected.len()
                );
                self.destroy_all();
                self.mark_incomplete();
                if let Some(period) = self.resolve_period(tick.wanted_position()) {
                    self.start_period(period);
                }
            }
        }
    }
}

/// Merges lane events, watches the clock against the manifest bounds and
/// aggregates per-type completion into end-of-stream
struct Aggregator {
    manifest: Arc<Manifest>,
    clock: ClockReceiver,
    rx: mpsc::UnboundedReceiver<AggregatorMsg>,
    manifest_rx: broadcast::Receiver<ManifestEvent>,
    manifest_open: bool,
    out: mpsc::UnboundedSender<OrchestratorEvent>,
    enabled: Vec<TrackType>,
    complete: HashSet<TrackType>,
    ended: bool,
    active_period: Option<String>,
    warned_before: bool,
    warned_after: bool,
}

impl Aggregator {
    async fn run(mut self) {
        self.evaluate_position();
        loop {
            tokio::select! {
                Some(msg) = self.rx.recv() => match msg {
                    AggregatorMsg::Event(event) => {
                        let _ = self.out.send(event);
                    }
                    AggregatorMsg::Complete(track_type) => {
                        let _ = self.out.send(OrchestratorEvent::BufferComplete { track_type });
                        self.complete.insert(track_type);
                        if !self.ended
                            && self.enabled.iter().all(|ty| self.complete.contains(ty))
                        {
                            self.ended = true;
                            let _ = self.out.send(OrchestratorEvent::EndOfStream);
                        }
                    }
                    AggregatorMsg::Resumed(track_type) => {
                        self.complete.remove(&track_type);
                        if self.ended {
                            self.ended = false;
                            let _ = self.out.send(OrchestratorEvent::ResumeStream);
                        }
                    }
                },
                changed = self.clock.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    self.evaluate_position();
                }
                event = self.manifest_rx.recv(), if self.manifest_open => match event {
                    Ok(ManifestEvent::DecipherabilityUpdate(_)) => {
                        let tick = *self.clock.borrow();
                        let _ = self
                            .out
                            .send(OrchestratorEvent::NeedsDecipherabilityFlush { tick });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        self.manifest_open = false;
                    }
                },
            }
        }
    }

    fn evaluate_position(&mut self) {
        let tick = *self.clock.borrow();
        let wanted = tick.wanted_position();

        if let Some(period) = self.manifest.period_for_time(wanted) {
            if self.active_period.as_deref() != Some(period.id.as_str()) {
                self.active_period = Some(period.id.clone());
                let _ = self.out.send(OrchestratorEvent::ActivePeriodChanged {
                    period: period.clone(),
                });
            }
        }

        if wanted < self.manifest.minimum_position {
            if !self.warned_before {
                self.warned_before = true;
                let _ = self.out.send(OrchestratorEvent::Warning {
                    track_type: None,
                    warning: PlaybackWarning::Media(MediaError::TimeBeforeManifest {
                        position: wanted,
                        minimum: self.manifest.minimum_position,
                    }),
                });
            }
        } else {
            self.warned_before = false;
        }

        if wanted > self.manifest.maximum_position {
            if !self.warned_after {
                self.warned_after = true;
                let _ = self.out.send(OrchestratorEvent::Warning {
                    track_type: None,
                    warning: PlaybackWarning::Media(MediaError::TimeAfterManifest {
                        position: wanted,
                        maximum: self.manifest.maximum_position,
                    }),
                });
            }
        } else {
            self.warned_after = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::representation::testing::{
        respond_all, timeline_index, MockBufferFactory,
    };
    use crate::buffer::{ManualAbr, ManualTracks};
    use crate::clock::{clock_channel, ClockSender, ClockTick};
    use crate::config::QueueConfig;
    use crate::loader::testing::{FakeLoader, PassthroughParser};
    use crate::manifest::{
        manifest_event_channel, Adaptation, DecipherabilityUpdate, ManifestEventSender,
        Representation,
    };
    use crate::raw::mock::MockOp;
    use std::time::Duration;

    fn period_with_tracks(
        id: &str,
        start: f64,
        duration: f64,
        loader: &FakeLoader,
        segment_secs: i64,
    ) -> Period {
        let count = duration as i64 / segment_secs;
        let mut adaptations = Vec::new();
        for (ty, codec, mime) in [
            (TrackType::Audio, "mp4a.40.2", "audio/mp4"),
            (TrackType::Video, "avc1.640028", "video/mp4"),
        ] {
            let prefix = format!("{}-{}", id, ty);
            respond_all(loader, &prefix, segment_secs, count);
            let representation = Representation::new(
                &format!("{}-{}-r1", id, ty),
                1_000_000,
                codec,
                mime,
                timeline_index(&prefix, start, Some(start + duration), segment_secs, count),
            );
            adaptations.push(Adaptation::new(
                &format!("{}-{}-a1", id, ty),
                ty,
                vec![representation],
            ));
        }
        Period::new(id, start, Some(duration), adaptations)
    }

    struct OrchFixture {
        orchestrator: PeriodOrchestrator,
        events: mpsc::UnboundedReceiver<OrchestratorEvent>,
        clock_tx: ClockSender,
        factory: Arc<MockBufferFactory>,
        manifest_tx: ManifestEventSender,
        manifest: Arc<Manifest>,
    }

    fn spawn_fixture(manifest: Manifest, loader: Arc<FakeLoader>, ahead: f64) -> OrchFixture {
        crate::buffer::representation::testing::init_tracing();
        let manifest = Arc::new(manifest);
        let factory = MockBufferFactory::new();
        let store = Arc::new(BufferStore::new(factory.clone(), QueueConfig::default()));
        let mut config = EngineConfig::default();
        config.buffer.wanted_buffer_ahead_secs = ahead;
        let (clock_tx, clock_rx) = clock_channel(ClockTick::new(0.0));
        let (manifest_tx, manifest_events) = manifest_event_channel();
        let (orchestrator, events) = PeriodOrchestrator::spawn(OrchestratorArgs {
            manifest: manifest.clone(),
            clock: clock_rx,
            store,
            loader,
            parser: Arc::new(PassthroughParser),
            tracks: Arc::new(ManualTracks::new()),
            abr: Arc::new(ManualAbr::new()),
            config: Arc::new(config),
            enabled_types: vec![TrackType::Audio, TrackType::Video],
            manifest_events,
        });
        OrchFixture {
            orchestrator,
            events,
            clock_tx,
            factory,
            manifest_tx,
            manifest,
        }
    }

    /// Collect events until `predicate` matches, while a driver plays the
    /// clock from 0 to `play_until` in 5s steps
    async fn play_and_collect(
        fixture: &mut OrchFixture,
        play_until: f64,
        predicate: impl Fn(&OrchestratorEvent) -> bool,
    ) -> Vec<OrchestratorEvent> {
        let clock_tx = fixture.clock_tx.clone();
        let driver = tokio::spawn(async move {
            let mut position = 0.0;
            while position < play_until {
                position += 5.0;
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = clock_tx.send(ClockTick::new(position.min(play_until)));
            }
        });
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), fixture.events.recv())
                .await
                .expect("timed out waiting for orchestrator event")
                .expect("orchestrator event channel closed");
            let done = predicate(&event);
            seen.push(event);
            if done {
                break;
            }
        }
        driver.abort();
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_periods_chain_to_end_of_stream() {
        let loader = Arc::new(FakeLoader::new());
        let p1 = period_with_tracks("p1", 0.0, 60.0, &loader, 4);
        let p2 = period_with_tracks("p2", 60.0, 40.0, &loader, 4);
        let manifest = Manifest::new(vec![p1, p2], false, 0.0, 100.0);
        let mut fixture = spawn_fixture(manifest, loader, 10.0);

        let events = play_and_collect(&mut fixture, 95.0, |e| {
            matches!(e, OrchestratorEvent::EndOfStream)
        })
        .await;

        // exactly one active-period-changed per period, in order
        let active: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                OrchestratorEvent::ActivePeriodChanged { period } => Some(period.id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(active, vec!["p1".to_string(), "p2".to_string()]);

        // both lanes completed, once each
        let complete: Vec<TrackType> = events
            .iter()
            .filter_map(|e| match e {
                OrchestratorEvent::BufferComplete { track_type } => Some(*track_type),
                _ => None,
            })
            .collect();
        assert_eq!(complete.len(), 2);
        assert!(complete.contains(&TrackType::Audio));
        assert!(complete.contains(&TrackType::Video));

        // p1's buffers were cleared when the clock passed its end
        let cleared_p1 = events
            .iter()
            .filter(|e| {
                matches!(e, OrchestratorEvent::PeriodBufferCleared { period_id, .. }
                    if period_id == "p1")
            })
            .count();
        assert_eq!(cleared_p1, 2);

        // a single end-of-stream
        let ended = events
            .iter()
            .filter(|e| matches!(e, OrchestratorEvent::EndOfStream))
            .count();
        assert_eq!(ended, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_back_after_end_resumes_stream() {
        let loader = Arc::new(FakeLoader::new());
        let p1 = period_with_tracks("p1", 0.0, 20.0, &loader, 4);
        let manifest = Manifest::new(vec![p1], false, 0.0, 20.0);
        let mut fixture = spawn_fixture(manifest, loader, 30.0);

        play_and_collect(&mut fixture, 5.0, |e| {
            matches!(e, OrchestratorEvent::EndOfStream)
        })
        .await;

        // leaving and re-entering the buffered span resumes the stream
        fixture.clock_tx.send(ClockTick::new(25.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        fixture.clock_tx.send(ClockTick::new(2.0)).unwrap();
        let events = play_and_collect(&mut fixture, 0.0, |e| {
            matches!(e, OrchestratorEvent::ResumeStream)
        })
        .await;
        assert!(events
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::ResumeStream)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_past_manifest_warns_without_terminating() {
        let loader = Arc::new(FakeLoader::new());
        let p1 = period_with_tracks("p1", 0.0, 60.0, &loader, 4);
        let manifest = Manifest::new(vec![p1], false, 0.0, 60.0);
        let mut fixture = spawn_fixture(manifest, loader, 10.0);

        fixture.clock_tx.send(ClockTick::new(70.0)).unwrap();
        let events = play_and_collect(&mut fixture, 0.0, |e| {
            matches!(
                e,
                OrchestratorEvent::Warning {
                    warning: PlaybackWarning::Media(MediaError::TimeAfterManifest { .. }),
                    ..
                }
            )
        })
        .await;
        assert!(!events.is_empty());

        // the pipeline is still alive: seeking back keeps buffering
        fixture.clock_tx.send(ClockTick::new(30.0)).unwrap();
        play_and_collect(&mut fixture, 0.0, |e| {
            matches!(e, OrchestratorEvent::AddedSegment { content, .. }
                if content.segment.start_secs >= 30.0)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_window_seek_restarts_lanes() {
        let loader = Arc::new(FakeLoader::new());
        let p1 = period_with_tracks("p1", 0.0, 60.0, &loader, 4);
        let p2 = period_with_tracks("p2", 60.0, 40.0, &loader, 4);
        let manifest = Manifest::new(vec![p1, p2], false, 0.0, 100.0);
        let mut fixture = spawn_fixture(manifest, loader, 10.0);

        // let p1 start buffering
        play_and_collect(&mut fixture, 0.0, |e| {
            matches!(e, OrchestratorEvent::AddedSegment { .. })
        })
        .await;

        // long jump into p2, which no lane manages yet
        fixture.clock_tx.send(ClockTick::new(90.0)).unwrap();
        let events = play_and_collect(&mut fixture, 0.0, |e| {
            matches!(e, OrchestratorEvent::AddedSegment { content, .. }
                if content.segment.start_secs >= 88.0)
        })
        .await;
        assert!(events.iter().any(|e| {
            matches!(e, OrchestratorEvent::PeriodBufferCleared { period_id, .. }
                if period_id == "p1")
        }));
        assert!(events.iter().any(|e| {
            matches!(e, OrchestratorEvent::ActivePeriodChanged { period }
                if period.id == "p2")
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unloaded_period_requests_resolution() {
        let loader = Arc::new(FakeLoader::new());
        let p1 = period_with_tracks("p1", 0.0, 20.0, &loader, 4);
        let stub = Period::unloaded("p2", 20.0, Some(20.0));
        let manifest = Manifest::new(vec![p1, stub], false, 0.0, 40.0);
        let mut fixture = spawn_fixture(manifest, loader.clone(), 30.0);

        // p1 fills immediately and chaining hits the unresolved stub
        let events = play_and_collect(&mut fixture, 0.0, |e| {
            matches!(e, OrchestratorEvent::NeedsLoadedPeriod { period, .. }
                if period.id == "p2")
        })
        .await;
        assert!(!events.is_empty());

        // resolving the period lets buffering continue into it
        let loaded = Arc::new(period_with_tracks("p2", 20.0, 20.0, &loader, 4));
        fixture
            .manifest_tx
            .send(crate::manifest::ManifestEvent::PeriodLoaded { period: loaded })
            .unwrap();
        play_and_collect(&mut fixture, 0.0, |e| {
            matches!(e, OrchestratorEvent::AddedSegment { content, .. }
                if content.period.id == "p2")
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_decipherability_update_flushes_and_rebuilds() {
        let loader = Arc::new(FakeLoader::new());
        let p1 = period_with_tracks("p1", 0.0, 60.0, &loader, 4);
        let manifest = Manifest::new(vec![p1], false, 0.0, 60.0);
        let mut fixture = spawn_fixture(manifest, loader, 10.0);

        play_and_collect(&mut fixture, 0.0, |e| {
            matches!(e, OrchestratorEvent::AddedSegment { track_type, .. }
                if *track_type == TrackType::Video)
        })
        .await;

        let video_representation = fixture.manifest.periods()[0]
            .adaptations_for(TrackType::Video)[0]
            .representations[0]
            .clone();
        video_representation.set_decipherable(false);
        fixture
            .manifest_tx
            .send(crate::manifest::ManifestEvent::DecipherabilityUpdate(vec![
                DecipherabilityUpdate {
                    adaptation_id: "p1-video-a1".to_string(),
                    representation_id: video_representation.id.clone(),
                    track_type: TrackType::Video,
                    decipherable: false,
                },
            ]))
            .unwrap();

        let events = play_and_collect(&mut fixture, 0.0, |e| {
            matches!(e, OrchestratorEvent::NeedsDecipherabilityFlush { .. })
        })
        .await;
        assert!(!events.is_empty());

        // wait until the flush removal reached the video decoder buffer
        let video_mock = fixture.factory.handle_for(TrackType::Video).unwrap();
        for _ in 0..100 {
            if video_mock
                .ops()
                .iter()
                .any(|op| matches!(op, MockOp::Remove { .. }))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(video_mock
            .ops()
            .iter()
            .any(|op| matches!(op, MockOp::Remove { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_keeps_buffer_behind_bounded() {
        let loader = Arc::new(FakeLoader::new());
        let p1 = period_with_tracks("p1", 0.0, 60.0, &loader, 4);
        let manifest = Manifest::new(vec![p1], false, 0.0, 60.0);

        let manifest = Arc::new(manifest);
        let factory = MockBufferFactory::new();
        let store = Arc::new(BufferStore::new(factory.clone(), QueueConfig::default()));
        let mut config = EngineConfig::default();
        config.buffer.wanted_buffer_ahead_secs = 10.0;
        config.buffer.max_buffer_behind_secs = Some(10.0);
        let (clock_tx, clock_rx) = clock_channel(ClockTick::new(0.0));
        let (_manifest_tx, manifest_events) = manifest_event_channel();
        let (_orchestrator, mut events) = PeriodOrchestrator::spawn(OrchestratorArgs {
            manifest,
            clock: clock_rx,
            store,
            loader,
            parser: Arc::new(PassthroughParser),
            tracks: Arc::new(ManualTracks::new()),
            abr: Arc::new(ManualAbr::new()),
            config: Arc::new(config),
            enabled_types: vec![TrackType::Video],
            manifest_events,
        });

        // play forward to accumulate history
        for step in 1..=8 {
            clock_tx.send(ClockTick::new(step as f64 * 5.0)).unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        // drain events so the channel does not fill unbounded history
        while events.try_recv().is_ok() {}

        let mock = factory.handle_for(TrackType::Video).unwrap();
        let buffered = mock.buffered();
        assert!(!buffered.is_empty());
        // nothing retained further behind than position - max_behind - ε
        assert!(
            buffered[0].start >= 40.0 - 10.0 - 0.5,
            "buffered starts at {}, expected GC behind 29.5",
            buffered[0].start
        );
    }
}
