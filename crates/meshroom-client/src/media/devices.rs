//! Local capture tracks and the capture backend seam
//!
//! A [`LocalTrack`] wraps the webrtc-rs sample track that peer connections
//! send from. Capture pipelines push encoded samples through
//! [`LocalTrack::write_sample`]; disabled or stopped tracks swallow them.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// What a local track captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(self) -> MediaKind {
        match self {
            TrackSource::Microphone => MediaKind::Audio,
            TrackSource::Camera | TrackSource::Screen => MediaKind::Video,
        }
    }

    fn codec(self) -> RTCRtpCodecCapability {
        match self.kind() {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }
}

/// Handle to a captured track. Clones share the same underlying track.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

struct LocalTrackInner {
    source: TrackSource,
    rtp: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

impl LocalTrack {
    pub fn new(source: TrackSource, rtp: Arc<TrackLocalStaticSample>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(LocalTrackInner {
                source,
                rtp,
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    /// Create a sample track for `source` with the default codec for its kind
    pub fn with_source(source: TrackSource, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let rtp = Arc::new(TrackLocalStaticSample::new(
            source.codec(),
            id.into(),
            stream_id.into(),
        ));
        Self::new(source, rtp)
    }

    pub fn id(&self) -> &str {
        self.inner.rtp.id()
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Returns true if the flag changed
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.inner.enabled.swap(enabled, Ordering::SeqCst) != enabled
    }

    /// Stop the track for good. Returns false if it had already ended.
    pub fn stop(&self) -> bool {
        self.inner.ended.send_if_modified(|ended| {
            if *ended {
                false
            } else {
                *ended = true;
                true
            }
        })
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolves once the track has ended, whether stopped here or by the
    /// capture source going away.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.rtp.clone()
    }

    /// Write an encoded sample. Dropped silently while disabled.
    pub async fn write_sample(&self, data: Vec<u8>, duration: Duration) -> Result<()> {
        if self.is_ended() {
            return Err(anyhow!("Track {} has ended", self.id()));
        }
        if !self.is_enabled() {
            return Ok(());
        }

        let sample = Sample {
            data: data.into(),
            duration,
            ..Default::default()
        };
        self.inner.rtp.write_sample(&sample).await?;
        Ok(())
    }

    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("source", &self.source())
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Camera and microphone captured together
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub microphone: LocalTrack,
    pub camera: LocalTrack,
}

/// Local capture capability
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request camera and microphone. May wait on a permission decision.
    async fn user_media(&self) -> Result<LocalStream>;

    /// Request a screen or window capture
    async fn display_media(&self) -> Result<LocalTrack>;
}

/// Hands out webrtc-rs sample tracks for an external capture pipeline to
/// feed. Capture never fails here; device probing belongs to the pipeline.
pub struct RtpMediaDevices {
    stream_id: String,
}

impl RtpMediaDevices {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

impl Default for RtpMediaDevices {
    fn default() -> Self {
        Self::new("meshroom-local")
    }
}

#[async_trait]
impl MediaDevices for RtpMediaDevices {
    async fn user_media(&self) -> Result<LocalStream> {
        tracing::debug!("Creating camera and microphone tracks");
        Ok(LocalStream {
            microphone: LocalTrack::with_source(TrackSource::Microphone, "audio", &self.stream_id),
            camera: LocalTrack::with_source(TrackSource::Camera, "video", &self.stream_id),
        })
    }

    async fn display_media(&self) -> Result<LocalTrack> {
        tracing::debug!("Creating screen capture track");
        Ok(LocalTrack::with_source(
            TrackSource::Screen,
            "screen",
            format!("{}-screen", self.stream_id),
        ))
    }
}
