//! Segment loading and parsing seams
//!
//! Network transport and container parsing are external collaborators.
//! The engine consumes them through two traits: [`SegmentLoader`] fetches
//! raw segment bytes, [`SegmentParser`] turns a response into a pushable
//! chunk. Transient loader failures are retried with bounded exponential
//! backoff before they surface.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BackoffConfig;
use crate::error::{MediaError, NetworkError};
use crate::manifest::{Adaptation, Period, Representation, SegmentInfo};

/// Full identity of one segment request
#[derive(Debug, Clone)]
pub struct SegmentContent {
    pub period: Arc<Period>,
    pub adaptation: Arc<Adaptation>,
    pub representation: Arc<Representation>,
    pub segment: SegmentInfo,
}

/// A fetched segment
#[derive(Debug, Clone)]
pub struct LoadedSegment {
    pub data: Bytes,
    /// Transferred size in bytes, when the transport reports it
    pub size: Option<usize>,
    /// Transfer duration in milliseconds, when the transport reports it
    pub duration_ms: Option<u64>,
}

/// Fetches segment bytes over the transport of the active streaming
/// protocol
#[async_trait]
pub trait SegmentLoader: Send + Sync {
    async fn load(&self, content: &SegmentContent) -> Result<LoadedSegment, NetworkError>;
}

/// Media-time description of a parsed chunk, in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkTimingInfo {
    pub time: f64,
    pub duration: Option<f64>,
}

/// Outcome of parsing one fetched segment
#[derive(Debug, Clone)]
pub enum ParsedChunk {
    /// Decoder configuration bytes, pushed before any media of the
    /// representation
    InitSegment { data: Bytes },
    /// A media chunk ready for the decoder
    MediaSegment {
        data: Bytes,
        timing: Option<ChunkTimingInfo>,
        /// Seconds to add to each sample's presentation time
        offset_secs: f64,
        /// Append window reported by the container, when any
        append_window: (Option<f64>, Option<f64>),
    },
}

/// Turns loader responses into pushable chunks for one transport
pub trait SegmentParser: Send + Sync {
    fn parse(
        &self,
        response: &LoadedSegment,
        content: &SegmentContent,
    ) -> Result<ParsedChunk, MediaError>;
}

/// Fetch `content`, retrying transient failures with exponential backoff.
///
/// The delay doubles from `initial_backoff_delay_ms` up to
/// `maximum_backoff_delay_ms`; offline failures get their own retry
/// budget. Non-retryable errors surface immediately.
pub async fn load_with_backoff(
    loader: &dyn SegmentLoader,
    content: &SegmentContent,
    config: &BackoffConfig,
) -> Result<LoadedSegment, NetworkError> {
    let mut attempt = 0u32;
    let mut delay = Duration::from_millis(config.initial_backoff_delay_ms);
    let max_delay = Duration::from_millis(config.maximum_backoff_delay_ms);
    loop {
        match loader.load(content).await {
            Ok(loaded) => return Ok(loaded),
            Err(error) => {
                let budget = if error.is_offline() {
                    config.max_retry_offline
                } else {
                    config.max_retry
                };
                if !error.is_retryable() || attempt >= budget {
                    return Err(error);
                }
                attempt += 1;
                tracing::warn!(
                    "segment load failed for representation {} ({}), retry {}/{} in {}ms",
                    content.representation.id,
                    error,
                    attempt,
                    budget,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::manifest::{Adaptation, Period, TrackType};

    fn content_for(urls: Vec<String>) -> SegmentContent {
        let index: Arc<dyn crate::manifest::SegmentIndex> =
            Arc::new(crate::manifest::timeline::TimelineIndex::new(
                crate::manifest::timeline::TimelineIndexOptions {
                    timescale: 1000,
                    presentation_time_offset: 0,
                    period_start: 0.0,
                    period_end: None,
                    is_dynamic: false,
                    start_number: None,
                    initialization_urls: vec![],
                    media_urls: vec![],
                    timeline_xml: String::new(),
                },
            ));
        let representation = Arc::new(Representation::new(
            "r1",
            1_500_000,
            "avc1.640028",
            "video/mp4",
            index,
        ));
        SegmentContent {
            period: Arc::new(Period::new("p1", 0.0, Some(60.0), vec![])),
            adaptation: Arc::new(Adaptation::new("a1", TrackType::Video, vec![])),
            representation,
            segment: SegmentInfo {
                id: "0".to_string(),
                time: 0,
                timescale: 1000,
                duration: 4000,
                is_init: false,
                media_urls: urls,
                byte_range: None,
                start_secs: 0.0,
                duration_secs: 4.0,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retries_then_succeeds() {
        let loader = FakeLoader::new();
        loader.respond("seg.mp4", b"data");
        loader.fail_with(vec![
            NetworkError::Http {
                status: 503,
                url: "seg.mp4".into(),
            },
            NetworkError::Timeout {
                url: "seg.mp4".into(),
            },
        ]);
        let content = content_for(vec!["seg.mp4".to_string()]);
        let loaded = load_with_backoff(&loader, &content, &BackoffConfig::default())
            .await
            .unwrap();
        assert_eq!(&loaded.data[..], b"data");
        assert_eq!(loader.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_gives_up_after_max_retry() {
        let loader = FakeLoader::new();
        loader.fail_with(vec![
            NetworkError::Http {
                status: 500,
                url: String::new()
            };
            10
        ]);
        let content = content_for(vec!["missing.mp4".to_string()]);
        let config = BackoffConfig {
            max_retry: 2,
            ..BackoffConfig::default()
        };
        let err = load_with_backoff(&loader, &content, &config)
            .await
            .unwrap_err();
        assert!(err.is_http_error(500));
        // initial attempt + 2 retries
        assert_eq!(loader.request_count(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let loader = FakeLoader::new();
        loader.fail_with(vec![NetworkError::Transport("tls handshake".into())]);
        let content = content_for(vec!["seg.mp4".to_string()]);
        let err = load_with_backoff(&loader, &content, &BackoffConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Transport(_)));
        assert_eq!(loader.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_doubles_up_to_cap() {
        let loader = FakeLoader::new();
        loader.fail_with(vec![
            NetworkError::Http {
                status: 503,
                url: String::new()
            };
            5
        ]);
        loader.respond("seg.mp4", b"data");
        let content = content_for(vec!["seg.mp4".to_string()]);
        let config = BackoffConfig {
            initial_backoff_delay_ms: 200,
            maximum_backoff_delay_ms: 500,
            max_retry: 8,
            max_retry_offline: 8,
        };
        let started = tokio::time::Instant::now();
        load_with_backoff(&loader, &content, &config).await.unwrap();
        // 200 + 400 + 500 + 500 + 500 = 2100ms of accumulated delay
        assert_eq!(started.elapsed(), Duration::from_millis(2100));
    }

    #[test]
    fn test_passthrough_parser_init_and_media() {
        let loader_response = LoadedSegment {
            data: Bytes::from_static(b"bytes"),
            size: Some(5),
            duration_ms: None,
        };
        let mut content = content_for(vec![]);
        let parsed = PassthroughParser
            .parse(&loader_response, &content)
            .unwrap();
        assert!(matches!(parsed, ParsedChunk::MediaSegment { .. }));

        content.segment.is_init = true;
        let parsed = PassthroughParser
            .parse(&loader_response, &content)
            .unwrap();
        assert!(matches!(parsed, ParsedChunk::InitSegment { .. }));
    }
}
