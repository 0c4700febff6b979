#![forbid(unsafe_code)]

// Local capture: device access and the lease that owns captured tracks

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("device access denied: {0}")]
    DeviceDenied(String),
    #[error("device unavailable: {0}")]
    Unavailable(String),
    #[error("peer connection error: {0}")]
    Backend(String),
}

type Release = Box<dyn FnOnce() + Send + Sync>;

/// Captured camera/microphone tracks. Dropping the lease releases the
/// devices, so every path that forgets it also stops capture.
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    release: Option<Release>,
}

impl LocalMedia {
    pub fn new(
        stream_id: impl Into<String>,
        tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
            release: Some(Box::new(release)),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            debug!("Releasing local media {}", self.stream_id);
            release();
        }
    }
}

/// Source of local camera and microphone capture
#[async_trait]
pub trait MediaDevices: Send {
    async fn acquire(&mut self) -> Result<LocalMedia, MediaError>;
}

/// Opus + VP8 sample tracks the application feeds with encoded frames.
/// Stands in for platform capture where the host app owns the devices.
pub struct SampleTrackDevices {
    label: String,
}

impl SampleTrackDevices {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

#[async_trait]
impl MediaDevices for SampleTrackDevices {
    async fn acquire(&mut self) -> Result<LocalMedia, MediaError> {
        let stream_id = format!("stream-{}", self.label);
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            format!("audio-{}", self.label),
            stream_id.clone(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            format!("video-{}", self.label),
            stream_id.clone(),
        ));
        let label = self.label.clone();
        Ok(LocalMedia::new(
            stream_id,
            vec![audio as Arc<dyn TrackLocal + Send + Sync>, video],
            move || debug!("Sample tracks for {} stopped", label),
        ))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeDevices;
    use super::*;

    #[tokio::test]
    async fn test_drop_releases_devices_once() {
        let mut devices = FakeDevices::default();
        let media = devices.acquire().await.unwrap();
        assert_eq!(devices.live(), 1);
        drop(media);
        assert_eq!(devices.live(), 0);
    }

    #[tokio::test]
    async fn test_denied_access() {
        let mut devices = FakeDevices { deny: true, ..Default::default() };
        assert!(matches!(devices.acquire().await, Err(MediaError::DeviceDenied(_))));
    }

    #[tokio::test]
    async fn test_sample_tracks() {
        let mut devices = SampleTrackDevices::new("alice");
        let media = devices.acquire().await.unwrap();
        assert_eq!(media.stream_id(), "stream-alice");
        assert_eq!(media.tracks().len(), 2);
        assert_eq!(media.tracks()[0].kind(), webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio);
    }
}
