//! Period buffer
//!
//! Sequences representation buffers for one (track type, period) pair:
//! restarts the buffering loop when the adaptive bitrate logic picks a
//! new representation or the user switches tracks, flushing retained
//! data first when the switching mode asks for it. The representation
//! loop runs inside this task, so destroying the period buffer cancels
//! everything it queued but not yet started.

use std::pin::pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::ClockReceiver;
use crate::config::{EngineConfig, SwitchingMode};
use crate::loader::{SegmentLoader, SegmentParser};
use crate::manifest::{Manifest, Period, Representation, TrackType};
use crate::store::{BufferHandle, BufferStore};

use super::representation::{RepresentationBuffer, RepresentationBufferArgs};
use super::{AbrSelector, BufferContent, RepresentationEvent, TrackSelector};

/// Events leaving a period buffer, tagged with its period id
pub(crate) type TaggedEvent = (String, RepresentationEvent);

pub(crate) struct PeriodBufferArgs {
    pub manifest: Arc<Manifest>,
    pub period: Arc<Period>,
    pub track_type: TrackType,
    pub clock: ClockReceiver,
    pub store: Arc<BufferStore>,
    pub loader: Arc<dyn SegmentLoader>,
    pub parser: Arc<dyn SegmentParser>,
    pub tracks: Arc<dyn TrackSelector>,
    pub abr: Arc<dyn AbrSelector>,
    pub config: Arc<EngineConfig>,
    pub events: mpsc::UnboundedSender<TaggedEvent>,
}

/// Owning handle over one period buffer task
pub(crate) struct PeriodBufferHandle {
    pub period: Arc<Period>,
    task: JoinHandle<()>,
}

impl PeriodBufferHandle {
    pub fn spawn(args: PeriodBufferArgs) -> Self {
        let period = args.period.clone();
        let task = tokio::spawn(PeriodBuffer { args }.run());
        Self { period, task }
    }

    /// Stop the task; not-yet-in-flight queue operations die with it
    pub fn destroy(&self) {
        self.task.abort();
    }
}

impl Drop for PeriodBufferHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct PeriodBuffer {
    args: PeriodBufferArgs,
}

/// Why the inner select loop around one representation stopped
enum Outcome {
    Ended,
    RepresentationChanged,
    AdaptationChanged,
    Shutdown,
}

impl PeriodBuffer {
    async fn run(self) {
        let args = self.args;
        let mut adaptation_rx = args
            .tracks
            .adaptation_stream(&args.period, args.track_type);

        'adaptation: loop {
            let Some(adaptation) = adaptation_rx.borrow_and_update().clone() else {
                // no track of this type in the period: report it as
                // buffered so chaining can move on, wait for a switch
                let _ = args
                    .events
                    .send((args.period.id.clone(), RepresentationEvent::FullBuffer));
                if adaptation_rx.changed().await.is_err() {
                    return;
                }
                continue 'adaptation;
            };

            let mut representation_rx = args.abr.representation_stream(&adaptation);
            'representation: loop {
                let representation = representation_rx.borrow_and_update().clone();
                let handle = match args
                    .store
                    .create(args.track_type, &representation.codec)
                {
                    Ok(handle) => handle,
                    Err(error) => {
                        let _ = args.events.send((
                            args.period.id.clone(),
                            RepresentationEvent::Failed {
                                reason: error.to_string(),
                            },
                        ));
                        return;
                    }
                };

                let content = BufferContent {
                    manifest: args.manifest.clone(),
                    period: args.period.clone(),
                    adaptation: adaptation.clone(),
                    representation: representation.clone(),
                };
                let (rb_tx, mut rb_rx) = mpsc::unbounded_channel();
                let buffer = RepresentationBuffer::new(RepresentationBufferArgs {
                    content,
                    clock: args.clock.clone(),
                    handle: handle.clone(),
                    loader: args.loader.clone(),
                    parser: args.parser.clone(),
                    config: args.config.clone(),
                    events: rb_tx,
                });
                // scope the pinned loop so it is dropped (cancelling its
                // queued operations) before any flush below
                let outcome = {
                    let mut buffer_loop = pin!(buffer.run());
                    loop {
                        tokio::select! {
                            _ = &mut buffer_loop => break Outcome::Ended,
                            Some(event) = rb_rx.recv() => {
                                let _ = args.events.send((args.period.id.clone(), event));
                            }
                            changed = representation_rx.changed() => {
                                break if changed.is_ok() {
                                    Outcome::RepresentationChanged
                                } else {
                                    Outcome::Shutdown
                                };
                            }
                            changed = adaptation_rx.changed() => {
                                break if changed.is_ok() {
                                    Outcome::AdaptationChanged
                                } else {
                                    Outcome::Shutdown
                                };
                            }
                        }
                    }
                };

                match outcome {
                    Outcome::Shutdown => return,
                    Outcome::RepresentationChanged => {
                        let next = representation_rx.borrow().clone();
                        tracing::info!(
                            "{} period {}: representation {} -> {} ({:?} switch)",
                            args.track_type,
                            args.period.id,
                            representation.id,
                            next.id,
                            args.config.buffer.switching_mode
                        );
                        if args.config.buffer.switching_mode == SwitchingMode::Direct {
                            flush_representation(&args, &handle, &representation).await;
                        }
                        continue 'representation;
                    }
                    Outcome::AdaptationChanged => {
                        tracing::info!(
                            "{} period {}: track switched away from adaptation {}",
                            args.track_type,
                            args.period.id,
                            adaptation.id
                        );
                        continue 'adaptation;
                    }
                    Outcome::Ended => {
                        // the loop failed or was told to reload: hold
                        // position until something changes the choice
                        tokio::select! {
                            changed = representation_rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                                continue 'representation;
                            }
                            changed = adaptation_rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                                continue 'adaptation;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Remove a representation's retained ranges inside the period window
/// and resynchronize the inventory (direct switching mode)
async fn flush_representation(
    args: &PeriodBufferArgs,
    handle: &BufferHandle,
    representation: &Representation,
) {
    let ranges = handle
        .inventory
        .lock()
        .ranges_for_representations(&[&representation.id]);
    let period_start = args.period.start;
    let period_end = args.period.end().unwrap_or(f64::INFINITY);
    for range in ranges {
        let start = range.start.max(period_start);
        let end = range.end.min(period_end);
        if end <= start {
            continue;
        }
        if let Err(error) = handle.queue.remove_buffer(start, end).wait().await {
            tracing::warn!(
                "{} period {}: failed to flush [{:.3}, {:.3}]: {}",
                args.track_type,
                args.period.id,
                start,
                end,
                error
            );
        }
    }
    let buffered = handle.queue.buffered();
    handle.inventory.lock().synchronize_buffered(&buffered);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::representation::testing::{
        respond_all, timeline_index, wait_for, MockBufferFactory,
    };
    use crate::buffer::{ManualAbr, ManualTracks};
    use crate::clock::{clock_channel, ClockTick};
    use crate::config::QueueConfig;
    use crate::loader::testing::{FakeLoader, PassthroughParser};
    use crate::manifest::{Adaptation, Representation};
    use crate::raw::mock::MockOp;

    struct PeriodFixture {
        manifest: Arc<Manifest>,
        store: Arc<BufferStore>,
        factory: Arc<MockBufferFactory>,
        loader: Arc<FakeLoader>,
        abr: Arc<ManualAbr>,
        tracks: Arc<ManualTracks>,
        clock_tx: crate::clock::ClockSender,
        clock_rx: ClockReceiver,
        config: Arc<EngineConfig>,
        events_tx: mpsc::UnboundedSender<TaggedEvent>,
        events_rx: mpsc::UnboundedReceiver<TaggedEvent>,
    }

    impl PeriodFixture {
        /// One 20s period with two video representations (r-low, r-high)
        fn new(switching_mode: SwitchingMode) -> Self {
            let low = Representation::new(
                "r-low",
                500_000,
                "avc1.42001e",
                "video/mp4",
                timeline_index("low", 0.0, Some(20.0), 4, 5),
            );
            let high = Representation::new(
                "r-high",
                3_000_000,
                "avc1.640028",
                "video/mp4",
                timeline_index("high", 0.0, Some(20.0), 4, 5),
            );
            let adaptation = Adaptation::new("a1", TrackType::Video, vec![low, high]);
            let period = Period::new("p1", 0.0, Some(20.0), vec![adaptation]);
            let manifest = Arc::new(Manifest::new(vec![period], false, 0.0, 20.0));

            let loader = Arc::new(FakeLoader::new());
            respond_all(&loader, "low", 4, 5);
            respond_all(&loader, "high", 4, 5);

            let factory = MockBufferFactory::new();
            let store = Arc::new(BufferStore::new(factory.clone(), QueueConfig::default()));

            let mut config = EngineConfig::default();
            config.buffer.wanted_buffer_ahead_secs = 8.0;
            config.buffer.switching_mode = switching_mode;

            let (clock_tx, clock_rx) = clock_channel(ClockTick::new(0.0));
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            Self {
                manifest,
                store,
                factory,
                loader,
                abr: Arc::new(ManualAbr::new()),
                tracks: Arc::new(ManualTracks::new()),
                clock_tx,
                clock_rx,
                config: Arc::new(config),
                events_tx,
                events_rx,
            }
        }

        fn spawn(&self) -> PeriodBufferHandle {
            PeriodBufferHandle::spawn(PeriodBufferArgs {
                manifest: self.manifest.clone(),
                period: self.manifest.periods()[0].clone(),
                track_type: TrackType::Video,
                clock: self.clock_rx.clone(),
                store: self.store.clone(),
                loader: self.loader.clone(),
                parser: Arc::new(PassthroughParser),
                tracks: self.tracks.clone(),
                abr: self.abr.clone(),
                config: self.config.clone(),
                events: self.events_tx.clone(),
            })
        }

        fn adaptation(&self) -> Arc<Adaptation> {
            self.manifest.periods()[0].adaptations_for(TrackType::Video)[0].clone()
        }
    }

    #[tokio::test]
    async fn test_buffers_initial_representation() {
        let mut fixture = PeriodFixture::new(SwitchingMode::Seamless);
        let _handle = fixture.spawn();
        wait_for(&mut fixture.events_rx, |(_, e)| {
            matches!(e, RepresentationEvent::AddedSegment { content, .. }
                if content.segment.time == 4)
        })
        .await;
        // first representation of the adaptation is the default pick
        assert!(fixture
            .loader
            .requests
            .lock()
            .iter()
            .all(|url| url.starts_with("low")));
    }

    #[tokio::test]
    async fn test_seamless_switch_keeps_old_data() {
        let mut fixture = PeriodFixture::new(SwitchingMode::Seamless);
        let _handle = fixture.spawn();
        wait_for(&mut fixture.events_rx, |(_, e)| {
            matches!(e, RepresentationEvent::AddedSegment { content, .. }
                if content.segment.time == 4)
        })
        .await;

        let high = fixture.adaptation().representation("r-high").unwrap().clone();
        fixture.abr.select("a1", high);
        // move ahead so the new representation has segments to fetch
        fixture.clock_tx.send(ClockTick::new(8.0)).unwrap();
        wait_for(&mut fixture.events_rx, |(_, e)| {
            matches!(e, RepresentationEvent::AddedSegment { content, .. }
                if content.representation.id == "r-high")
        })
        .await;

        // nothing was removed from the decoder buffer
        let mock = fixture.factory.handle_for(TrackType::Video).unwrap();
        assert!(!mock
            .ops()
            .iter()
            .any(|op| matches!(op, MockOp::Remove { .. })));
        // both representations are visible in the inventory
        let handle = fixture.store.get(TrackType::Video).unwrap();
        let inventory = handle.inventory.lock();
        let representation_ids: Vec<_> = inventory
            .inventory()
            .iter()
            .map(|e| e.context.representation_id.clone())
            .collect();
        assert!(representation_ids.contains(&"r-low".to_string()));
        assert!(representation_ids.contains(&"r-high".to_string()));
    }

    #[tokio::test]
    async fn test_direct_switch_flushes_old_representation() {
        let mut fixture = PeriodFixture::new(SwitchingMode::Direct);
        let _handle = fixture.spawn();
        wait_for(&mut fixture.events_rx, |(_, e)| {
            matches!(e, RepresentationEvent::AddedSegment { content, .. }
                if content.segment.time == 4)
        })
        .await;

        let high = fixture.adaptation().representation("r-high").unwrap().clone();
        fixture.abr.select("a1", high);
        wait_for(&mut fixture.events_rx, |(_, e)| {
            matches!(e, RepresentationEvent::AddedSegment { content, .. }
                if content.representation.id == "r-high")
        })
        .await;

        // the old representation's ranges were removed
        let mock = fixture.factory.handle_for(TrackType::Video).unwrap();
        assert!(mock
            .ops()
            .iter()
            .any(|op| matches!(op, MockOp::Remove { .. })));
        let handle = fixture.store.get(TrackType::Video).unwrap();
        let inventory = handle.inventory.lock();
        assert!(inventory
            .inventory()
            .iter()
            .all(|e| e.context.representation_id == "r-high"));
    }

    #[tokio::test]
    async fn test_track_switch_refetches_init() {
        let mut fixture = PeriodFixture::new(SwitchingMode::Seamless);
        let _handle = fixture.spawn();
        wait_for(&mut fixture.events_rx, |(_, e)| {
            matches!(e, RepresentationEvent::AddedSegment { content, .. }
                if content.segment.time == 4)
        })
        .await;

        // switching to the same adaptation object still recreates the
        // representation buffer, which re-requests the init segment
        let adaptation = fixture.adaptation();
        fixture
            .tracks
            .select("p1", TrackType::Video, Some(adaptation));
        let init_requests = |fixture: &PeriodFixture| {
            fixture
                .loader
                .requests
                .lock()
                .iter()
                .filter(|url| url.ends_with("init.mp4"))
                .count()
        };
        for _ in 0..100 {
            if init_requests(&fixture) >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(init_requests(&fixture) >= 2);
    }

    #[tokio::test]
    async fn test_period_without_track_reports_full() {
        let mut fixture = PeriodFixture::new(SwitchingMode::Seamless);
        // ask for a type the period has no adaptation for
        let handle = PeriodBufferHandle::spawn(PeriodBufferArgs {
            manifest: fixture.manifest.clone(),
            period: fixture.manifest.periods()[0].clone(),
            track_type: TrackType::Text,
            clock: fixture.clock_rx.clone(),
            store: fixture.store.clone(),
            loader: fixture.loader.clone(),
            parser: Arc::new(PassthroughParser),
            tracks: fixture.tracks.clone(),
            abr: fixture.abr.clone(),
            config: fixture.config.clone(),
            events: fixture.events_tx.clone(),
        });
        wait_for(&mut fixture.events_rx, |(_, e)| {
            matches!(e, RepresentationEvent::FullBuffer)
        })
        .await;
        handle.destroy();
    }
}
