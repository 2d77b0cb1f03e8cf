use thiserror::Error;

/// Errors raised by a serialized buffer queue or its underlying decoder buffer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BufferError {
    /// The decoder buffer reported an error while an append was in flight
    #[error("append failed on {buffer_type} buffer: {reason}")]
    AppendFailed { buffer_type: String, reason: String },

    /// The decoder buffer reported an error while a remove was in flight
    #[error("remove [{start}, {end}] failed on {buffer_type} buffer: {reason}")]
    RemoveFailed {
        buffer_type: String,
        start: f64,
        end: f64,
        reason: String,
    },

    /// The operation was cancelled before reaching the decoder buffer
    #[error("operation aborted before reaching the decoder buffer")]
    Aborted,

    /// The queue was disposed while the operation was pending
    #[error("buffer queue disposed")]
    Disposed,

    /// No decoder buffer can be created for the requested type
    #[error("unknown buffer type: {0}")]
    TypeUnknown(String),

    /// The decoder buffer rejected the mutation synchronously
    #[error("decoder buffer rejected operation: {0}")]
    Rejected(String),
}

/// Errors surfaced by the segment loader
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    /// The server answered with a non-success HTTP status
    #[error("HTTP error {status} fetching {url}")]
    Http { status: u16, url: String },

    /// The request did not complete in time
    #[error("request timed out: {url}")]
    Timeout { url: String },

    /// The device has no network connectivity
    #[error("network offline")]
    Offline,

    /// Any other transport-level failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl NetworkError {
    /// HTTP status code carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            NetworkError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True if this error is an HTTP error with the given status
    pub fn is_http_error(&self, status: u16) -> bool {
        self.status() == Some(status)
    }

    /// True if the loader may retry this request after a backoff delay.
    /// 404 and 412 are retried (a segment may not be generated yet on a
    /// live origin), as are server errors, timeouts and offline failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::Http { status, .. } => {
                matches!(status, 404 | 412) || *status >= 500
            }
            NetworkError::Timeout { .. } | NetworkError::Offline => true,
            NetworkError::Transport(_) => false,
        }
    }

    /// True if this failure is caused by a lack of connectivity
    pub fn is_offline(&self) -> bool {
        matches!(self, NetworkError::Offline)
    }
}

/// Errors tied to the media presentation itself
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    /// The manifest (or a part of it) could not be interpreted
    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    /// The wanted position precedes everything announced by the manifest
    #[error("position {position}s is before the earliest manifest position {minimum}s")]
    TimeBeforeManifest { position: f64, minimum: f64 },

    /// The wanted position exceeds everything announced by the manifest
    #[error("position {position}s is after the latest manifest position {maximum}s")]
    TimeAfterManifest { position: f64, maximum: f64 },

    /// A segment timeline element could not be interpreted
    #[error("malformed segment timeline: {0}")]
    Timeline(String),

    /// A fetched segment could not be parsed
    #[error("segment parse error for representation {representation_id}: {reason}")]
    SegmentParse {
        representation_id: String,
        reason: String,
    },

    /// The media source must be torn down and rebuilt before playback can
    /// continue (key rotation, manifest expiry, codec mismatch)
    #[error("media source reload required: {0}")]
    ReloadRequired(String),
}

/// A non-fatal condition surfaced to the player front-end
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackWarning {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Top-level error type for the buffering engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// An error from a serialized buffer queue
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// An error from the segment loader
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// An error tied to the media presentation
    #[error("media error: {0}")]
    Media(#[from] MediaError),

    /// A standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or validated
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;
