//! Serialized buffer queue
//!
//! Decoder buffers tolerate at most one in-flight mutation. The queue
//! serializes every append and remove behind a FIFO owned by a dedicated
//! task; callers get a handle resolving when their mutation reached the
//! decoder and it reported quiescence. Dropping the handle before the
//! mutation starts cancels it; dropping it afterwards abandons the result
//! without aborting the decoder.

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use xxhash_rust::xxh64::xxh64;

use crate::config::QueueConfig;
use crate::error::BufferError;
use crate::manifest::TrackType;
use crate::raw::time_ranges::TimeRange;
use crate::raw::{AppendedData, RawBuffer, RawBufferEvent, RawBufferEvents};

/// Everything needed to push one parsed chunk.
///
/// When both `init_data` and `media` are present the push expands into
/// two appends, init first. The init append is skipped when the queue
/// already pushed identical init bytes (content hash).
#[derive(Debug, Clone)]
pub struct PushedChunk {
    pub codec: String,
    /// Seconds added to each appended sample's presentation time
    pub timestamp_offset: f64,
    /// `(start, end)`; `None` resets to 0 / unbounded respectively
    pub append_window: (Option<f64>, Option<f64>),
    pub init_data: Option<Bytes>,
    pub media: Option<AppendedData>,
}

#[derive(Debug)]
enum QueuedPayload {
    Push(PushedChunk),
    Remove { start: f64, end: f64 },
}

struct QueuedTask {
    payload: QueuedPayload,
    done: oneshot::Sender<Result<Vec<TimeRange>, BufferError>>,
}

/// Handle to an operation submitted to a [`BufferQueue`].
///
/// Dropping it before the operation becomes in-flight cancels the
/// operation; an in-flight operation runs to completion regardless.
#[derive(Debug)]
pub struct PendingOperation {
    result: oneshot::Receiver<Result<Vec<TimeRange>, BufferError>>,
}

impl PendingOperation {
    /// Resolve once the mutation reached the decoder buffer and it
    /// reported quiescence. Returns the buffered ranges observed right
    /// after the mutation.
    pub async fn wait(self) -> Result<Vec<TimeRange>, BufferError> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => Err(BufferError::Disposed),
        }
    }
}

/// FIFO append/remove scheduler owning one decoder buffer
#[derive(Debug)]
pub struct BufferQueue {
    buffer_type: TrackType,
    tasks: mpsc::UnboundedSender<QueuedTask>,
    buffered_rx: watch::Receiver<Vec<TimeRange>>,
    worker: JoinHandle<()>,
}

impl BufferQueue {
    pub fn new(
        buffer_type: TrackType,
        raw: Box<dyn RawBuffer>,
        events: RawBufferEvents,
        config: &QueueConfig,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (buffered_tx, buffered_rx) = watch::channel(Vec::new());
        let worker = QueueWorker {
            buffer_type,
            raw,
            events,
            buffered_tx,
            last_init_hash: None,
            flushing_interval: Duration::from_millis(config.flushing_interval_ms),
        };
        let handle = tokio::spawn(worker.run(task_rx));
        Self {
            buffer_type,
            tasks: task_tx,
            buffered_rx,
            worker: handle,
        }
    }

    pub fn buffer_type(&self) -> TrackType {
        self.buffer_type
    }

    /// Queue an append of `chunk` behind every already-queued operation
    pub fn push_chunk(&self, chunk: PushedChunk) -> PendingOperation {
        self.submit(QueuedPayload::Push(chunk))
    }

    /// Queue a removal of `[start, end)` behind every already-queued
    /// operation
    pub fn remove_buffer(&self, start: f64, end: f64) -> PendingOperation {
        self.submit(QueuedPayload::Remove { start, end })
    }

    fn submit(&self, payload: QueuedPayload) -> PendingOperation {
        let (done, result) = oneshot::channel();
        // a send error means the worker is gone; the dropped sender then
        // resolves the operation with `Disposed`
        let _ = self.tasks.send(QueuedTask { payload, done });
        PendingOperation { result }
    }

    /// Ranges observed on the decoder buffer after the last completed
    /// mutation
    pub fn buffered(&self) -> Vec<TimeRange> {
        self.buffered_rx.borrow().clone()
    }

    /// Tear the queue down. Queued operations resolve with `Disposed`;
    /// an in-flight mutation is abandoned.
    pub fn dispose(&self) {
        self.worker.abort();
    }
}

impl Drop for BufferQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[derive(Clone, Copy)]
enum MutationKind {
    Append,
    Remove { start: f64, end: f64 },
}

struct QueueWorker {
    buffer_type: TrackType,
    raw: Box<dyn RawBuffer>,
    events: RawBufferEvents,
    buffered_tx: watch::Sender<Vec<TimeRange>>,
    last_init_hash: Option<u64>,
    flushing_interval: Duration,
}

impl QueueWorker {
    async fn run(mut self, mut tasks: mpsc::UnboundedReceiver<QueuedTask>) {
        while let Some(task) = tasks.recv().await {
            if task.done.is_closed() {
                tracing::debug!("{} buffer: skipping cancelled operation", self.buffer_type);
                continue;
            }
            let result = match task.payload {
                QueuedPayload::Push(chunk) => self.process_push(chunk).await,
                QueuedPayload::Remove { start, end } => self.process_remove(start, end).await,
            };
            if result.is_err() {
                // force a fresh init push before the next media chunk
                self.last_init_hash = None;
            }
            let _ = self.buffered_tx.send(self.raw.buffered());
            let _ = task.done.send(result);
        }
        self.raw.abort();
    }

    async fn process_push(&mut self, chunk: PushedChunk) -> Result<Vec<TimeRange>, BufferError> {
        if let Some(init) = chunk.init_data.as_ref() {
            let hash = xxh64(init, 0);
            if self.last_init_hash != Some(hash) {
                self.reconcile(&chunk);
                self.drain_stale_events();
                self.raw.append_buffer(AppendedData::init(init.clone()))?;
                self.await_quiescence(MutationKind::Append).await?;
                self.last_init_hash = Some(hash);
            }
        }
        if let Some(media) = chunk.media.clone() {
            self.reconcile(&chunk);
            self.drain_stale_events();
            self.raw.append_buffer(media)?;
            self.await_quiescence(MutationKind::Append).await?;
        }
        Ok(self.raw.buffered())
    }

    async fn process_remove(
        &mut self,
        start: f64,
        end: f64,
    ) -> Result<Vec<TimeRange>, BufferError> {
        self.drain_stale_events();
        self.raw.remove(start, end)?;
        self.await_quiescence(MutationKind::Remove { start, end })
            .await?;
        Ok(self.raw.buffered())
    }

    /// Align the decoder buffer's codec, timestamp offset and append
    /// window with what the chunk expects, touching only what differs
    fn reconcile(&mut self, chunk: &PushedChunk) {
        if self.raw.codec() != chunk.codec {
            if self.raw.try_change_codec(&chunk.codec) {
                tracing::debug!(
                    "{} buffer: switched codec to {}",
                    self.buffer_type,
                    chunk.codec
                );
            } else {
                tracing::warn!(
                    "{} buffer: in-place codec switch to {} unsupported, keeping {}",
                    self.buffer_type,
                    chunk.codec,
                    self.raw.codec()
                );
            }
        }

        if (self.raw.timestamp_offset() - chunk.timestamp_offset).abs() > f64::EPSILON {
            self.raw.set_timestamp_offset(chunk.timestamp_offset);
        }

        match chunk.append_window.0 {
            Some(start) => {
                if (self.raw.append_window_start() - start).abs() > f64::EPSILON {
                    if start >= self.raw.append_window_end() {
                        // the window start must stay below its end
                        self.raw.set_append_window_end(start + 1.0);
                    }
                    self.raw.set_append_window_start(start);
                }
            }
            None => {
                if self.raw.append_window_start() > 0.0 {
                    self.raw.set_append_window_start(0.0);
                }
            }
        }
        match chunk.append_window.1 {
            Some(end) => {
                if (self.raw.append_window_end() - end).abs() > f64::EPSILON {
                    self.raw.set_append_window_end(end);
                }
            }
            None => {
                if self.raw.append_window_end().is_finite() {
                    self.raw.set_append_window_end(f64::INFINITY);
                }
            }
        }
    }

    /// Wait for the in-flight mutation to complete. A watchdog interval
    /// re-checks the decoder in case its completion event never arrives.
    async fn await_quiescence(&mut self, kind: MutationKind) -> Result<(), BufferError> {
        let mut watchdog = tokio::time::interval_at(
            tokio::time::Instant::now() + self.flushing_interval,
            self.flushing_interval,
        );
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(RawBufferEvent::UpdateEnd) => return Ok(()),
                    Some(RawBufferEvent::Error(reason)) => {
                        return Err(self.mutation_error(kind, reason));
                    }
                    None => return Err(BufferError::Disposed),
                },
                _ = watchdog.tick() => {
                    if !self.raw.updating() {
                        tracing::warn!(
                            "{} buffer: quiescent without a completion event, recovering",
                            self.buffer_type
                        );
                        return Ok(());
                    }
                }
            }
        }
    }

    fn mutation_error(&self, kind: MutationKind, reason: String) -> BufferError {
        match kind {
            MutationKind::Append => BufferError::AppendFailed {
                buffer_type: self.buffer_type.to_string(),
                reason,
            },
            MutationKind::Remove { start, end } => BufferError::RemoveFailed {
                buffer_type: self.buffer_type.to_string(),
                start,
                end,
                reason,
            },
        }
    }

    /// Discard completion events from a mutation nobody is waiting on
    /// anymore (possible after a watchdog recovery)
    fn drain_stale_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            tracing::debug!(
                "{} buffer: discarding stale event {:?}",
                self.buffer_type,
                event
            );
        }
    }
}
