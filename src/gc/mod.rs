//! Buffer garbage collection
//!
//! Keeps each decoder buffer inside `[position - behind, position + ahead]`
//! by issuing removals through the owning queue. Removals join the same
//! FIFO as appends, so collection never races a push.

use crate::config::{BufferConfig, GcConfig};
use crate::error::BufferError;
use crate::manifest::TrackType;
use crate::queue::BufferQueue;

/// Effective retention bounds for one buffer type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcLimits {
    pub max_behind_secs: Option<f64>,
    pub max_ahead_secs: Option<f64>,
}

impl GcLimits {
    /// Combine the configured bounds with the per-type hard caps,
    /// keeping the stricter of the two on each side
    pub fn effective(buffer: &BufferConfig, gc: &GcConfig, track_type: TrackType) -> Self {
        Self {
            max_behind_secs: stricter(buffer.max_buffer_behind_secs, gc.hard_max_behind(track_type)),
            max_ahead_secs: stricter(buffer.max_buffer_ahead_secs, gc.hard_max_ahead(track_type)),
        }
    }
}

fn stricter(configured: Option<f64>, hard_cap: Option<f64>) -> Option<f64> {
    match (configured, hard_cap) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Evict data outside the retention window around `position`.
///
/// Removals are only issued when the targeted interval actually
/// intersects a buffered range.
pub async fn collect_garbage(
    queue: &BufferQueue,
    position: f64,
    limits: GcLimits,
) -> Result<(), BufferError> {
    let buffered = queue.buffered();
    if buffered.is_empty() {
        return Ok(());
    }

    if let Some(max_behind) = limits.max_behind_secs {
        let bound = position - max_behind;
        if buffered.iter().any(|r| r.start < bound) {
            tracing::debug!(
                "{} buffer: clearing [0, {:.3}] behind position {:.3}",
                queue.buffer_type(),
                bound,
                position
            );
            queue.remove_buffer(0.0, bound).wait().await?;
        }
    }

    if let Some(max_ahead) = limits.max_ahead_secs {
        let bound = position + max_ahead;
        if buffered.iter().any(|r| r.end > bound) {
            tracing::debug!(
                "{} buffer: clearing [{:.3}, inf] ahead of position {:.3}",
                queue.buffer_type(),
                bound,
                position
            );
            queue.remove_buffer(bound, f64::INFINITY).wait().await?;
        }
    }

    Ok(())
}
