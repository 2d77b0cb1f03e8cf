//! Playback clock observation
//!
//! The playback element publishes its position through a `watch` channel.
//! Every buffering task holds a receiver and re-evaluates on each change.

use tokio::sync::watch;

/// One observation of the playback head
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockTick {
    /// Current playback position in seconds
    pub position: f64,

    /// Offset of an imminent seek relative to `position`.
    /// Zero when no seek is pending.
    pub wanted_time_offset: f64,
}

impl ClockTick {
    pub fn new(position: f64) -> Self {
        Self {
            position,
            wanted_time_offset: 0.0,
        }
    }

    pub fn with_offset(position: f64, wanted_time_offset: f64) -> Self {
        Self {
            position,
            wanted_time_offset,
        }
    }

    /// The position buffering should work from: the current position plus
    /// any pending seek offset.
    pub fn wanted_position(&self) -> f64 {
        self.position + self.wanted_time_offset
    }
}

pub type ClockSender = watch::Sender<ClockTick>;
pub type ClockReceiver = watch::Receiver<ClockTick>;

/// Create a playback clock seeded with `initial`
pub fn clock_channel(initial: ClockTick) -> (ClockSender, ClockReceiver) {
    watch::channel(initial)
}
