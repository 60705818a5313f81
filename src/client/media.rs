use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::ClientConfig;
use crate::error::CaptureError;

// ─── Constraints ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Which local tracks to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

// ─── Local tracks ───────────────────────────────────────────────────────────

/// One captured track. Toggling `enabled` mutes it without renegotiation;
/// `stop` ends it for good.
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    live: AtomicBool,
    track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let codec = match kind {
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
        };
        let id = format!("{}-{}", kind.as_str(), Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_owned(),
        ));

        Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            track,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Track handed to every peer connection.
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Push one encoded frame. Disabled tracks discard it; stopped tracks
    /// reject it.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), webrtc::Error> {
        if !self.is_live() {
            return Err(webrtc::Error::new(format!("track {} is stopped", self.id)));
        }
        if !self.is_enabled() {
            return Ok(());
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
    }
}

/// The local stream shared read-only by every peer connection.
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn new(constraints: MediaConstraints) -> Self {
        let stream_id = format!("ww-local-{}", Uuid::new_v4());
        let tracks = constraints
            .kinds()
            .into_iter()
            .map(|kind| Arc::new(LocalTrack::new(kind, &stream_id)))
            .collect();
        Self { stream_id, tracks }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Flip every track of `kind`; `None` if there is none.
    pub fn toggle(&self, kind: MediaKind) -> Option<bool> {
        let currently = self.tracks_of(kind).any(|t| t.is_enabled());
        let mut found = false;
        for track in self.tracks_of(kind) {
            track.set_enabled(!currently);
            found = true;
        }
        found.then_some(!currently)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn any_live(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }
}

// ─── Capture ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait MediaCapture: Send + Sync + 'static {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, CaptureError>;
}

/// Capture backed by device nodes. Each configured device is opened once to
/// check it is present and accessible; frames are then fed by the
/// application through [`LocalTrack::write_sample`].
#[derive(Debug, Clone, Default)]
pub struct DeviceCapture {
    audio_device: Option<PathBuf>,
    video_device: Option<PathBuf>,
}

impl DeviceCapture {
    pub fn new(audio_device: Option<PathBuf>, video_device: Option<PathBuf>) -> Self {
        Self {
            audio_device,
            video_device,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.audio_device.clone(), config.video_device.clone())
    }

    fn device_for(&self, kind: MediaKind) -> Option<&PathBuf> {
        match kind {
            MediaKind::Audio => self.audio_device.as_ref(),
            MediaKind::Video => self.video_device.as_ref(),
        }
    }
}

#[async_trait]
impl MediaCapture for DeviceCapture {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, CaptureError> {
        if !constraints.audio && !constraints.video {
            return Err(CaptureError::ConstraintsUnsatisfiable(
                "neither audio nor video requested".into(),
            ));
        }

        for kind in constraints.kinds() {
            let Some(path) = self.device_for(kind) else {
                continue;
            };
            debug!(device = %path.display(), kind = kind.as_str(), "probing capture device");
            tokio::fs::OpenOptions::new()
                .read(true)
                .open(path)
                .await
                .map_err(CaptureError::from)?;
        }

        let media = LocalMedia::new(constraints);
        info!(
            stream = media.stream_id(),
            tracks = media.tracks().len(),
            "local media acquired"
        );
        Ok(media)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn both_kinds_disabled_is_unsatisfiable() {
        let err = DeviceCapture::default()
            .acquire(MediaConstraints {
                audio: false,
                video: false,
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::ConstraintsUnsatisfiable(_)));
    }

    #[tokio::test]
    async fn missing_device_is_not_found() {
        let capture = DeviceCapture::new(None, Some(PathBuf::from("/definitely/not/a/camera")));
        let err = capture.acquire(MediaConstraints::default()).await.err().unwrap();
        assert!(matches!(err, CaptureError::NotFound));
        assert_eq!(err.user_message(), "No camera or microphone found");
    }

    #[tokio::test]
    async fn unprobed_capture_yields_requested_tracks() {
        let media = DeviceCapture::default()
            .acquire(MediaConstraints {
                audio: true,
                video: false,
            })
            .await
            .unwrap();
        assert_eq!(media.tracks().len(), 1);
        assert_eq!(media.tracks()[0].kind(), MediaKind::Audio);
        assert!(media.tracks()[0].is_live());
    }

    #[test]
    fn toggle_flips_only_the_requested_kind() {
        let media = LocalMedia::new(MediaConstraints::default());

        assert_eq!(media.toggle(MediaKind::Audio), Some(false));
        assert!(media.tracks_of(MediaKind::Audio).all(|t| !t.is_enabled()));
        assert!(media.tracks_of(MediaKind::Video).all(|t| t.is_enabled()));

        assert_eq!(media.toggle(MediaKind::Audio), Some(true));

        let audio_only = LocalMedia::new(MediaConstraints {
            audio: true,
            video: false,
        });
        assert_eq!(audio_only.toggle(MediaKind::Video), None);
    }

    #[test]
    fn stop_all_leaves_nothing_live() {
        let media = LocalMedia::new(MediaConstraints::default());
        assert!(media.any_live());
        media.stop_all();
        assert!(!media.any_live());
    }

    #[tokio::test]
    async fn disabled_tracks_discard_and_stopped_tracks_reject() {
        let track = LocalTrack::new(MediaKind::Video, "stream");
        track.set_enabled(false);
        assert!(track
            .write_sample(Bytes::from_static(b"frame"), Duration::from_millis(33))
            .await
            .is_ok());

        track.stop();
        assert!(track
            .write_sample(Bytes::from_static(b"frame"), Duration::from_millis(33))
            .await
            .is_err());
    }
}
