//! Local capture: tracks, streams, the device capability seam and the
//! fallback-driven acquirer.

pub mod acquirer;
pub mod constraints;
pub mod device;
pub mod synthetic;

pub use acquirer::{MediaAcquirer, MediaError, StrategyFailure};
pub use constraints::{FacingMode, MediaConstraints, Strategy, VideoConstraints};
pub use device::{DeviceClass, DeviceProfile};
pub use synthetic::SyntheticDevices;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// What the device actually delivered. Hosts may leave fields unreported.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackSettings {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
}

impl TrackSettings {
    pub fn video(width: u32, height: u32, frame_rate: f64) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            frame_rate: Some(frame_rate),
        }
    }

    pub fn resolution(&self) -> Option<(u32, u32)> {
        Some((self.width?, self.height?))
    }
}

/// Releases the underlying device when a capture track stops.
pub trait CaptureHandle: Send + Sync {
    fn release(&self);
}

pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    settings: TrackSettings,
    enabled: AtomicBool,
    ended: AtomicBool,
    handle: Option<Arc<dyn CaptureHandle>>,
}

impl MediaTrack {
    pub fn captured(kind: TrackKind, settings: TrackSettings, handle: Arc<dyn CaptureHandle>) -> Self {
        Self::build(kind, settings, Some(handle))
    }

    /// A track received from a remote peer; stopping it frees no device.
    pub fn remote(kind: TrackKind, settings: TrackSettings) -> Self {
        Self::build(kind, settings, None)
    }

    fn build(kind: TrackKind, settings: TrackSettings, handle: Option<Arc<dyn CaptureHandle>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            settings,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            handle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn settings(&self) -> TrackSettings {
        self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !self.ended.load(Ordering::SeqCst)
    }

    /// Ends the track. Returns `true` only for the call that actually stopped it.
    pub fn stop(&self) -> bool {
        if self.ended.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(handle) = &self.handle {
            handle.release();
        }
        true
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Shared handle to a set of tracks. Clones refer to the same tracks.
#[derive(Clone, Debug)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

#[derive(Debug)]
struct StreamInner {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::from_shared(tracks.into_iter().map(Arc::new).collect())
    }

    pub fn from_shared(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: Uuid::new_v4().to_string(),
                tracks,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.inner.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<MediaTrack>> + '_ {
        self.inner.tracks.iter().filter(move |track| track.kind() == kind)
    }

    pub fn video_settings(&self) -> Option<TrackSettings> {
        self.tracks_of(TrackKind::Video)
            .find(|track| track.is_live())
            .map(|track| track.settings())
    }

    pub fn is_active(&self) -> bool {
        self.inner.tracks.iter().any(|track| track.is_live())
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    /// `Some(true)` when every track of `kind` is enabled, `None` without such tracks.
    pub fn all_enabled(&self, kind: TrackKind) -> Option<bool> {
        let mut tracks = self.tracks_of(kind).peekable();
        tracks.peek()?;
        Some(tracks.all(|track| track.is_enabled()))
    }

    /// Stops every track; returns how many were stopped by this call.
    pub fn stop_all(&self) -> usize {
        self.inner.tracks.iter().filter(|track| track.stop()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaErrorKind {
    PermissionDenied,
    DeviceNotFound,
    Overconstrained,
    DeviceBusy,
    InsecureContext,
    Aborted,
    Other,
}

impl MediaErrorKind {
    /// Failures no later strategy can recover from.
    pub fn is_terminal(self) -> bool {
        matches!(self, MediaErrorKind::PermissionDenied | MediaErrorKind::InsecureContext)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaErrorKind::PermissionDenied => "permission-denied",
            MediaErrorKind::DeviceNotFound => "device-not-found",
            MediaErrorKind::Overconstrained => "overconstrained",
            MediaErrorKind::DeviceBusy => "device-busy",
            MediaErrorKind::InsecureContext => "insecure-context",
            MediaErrorKind::Aborted => "aborted",
            MediaErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for MediaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct CaptureError {
    pub kind: MediaErrorKind,
    pub message: String,
}

impl CaptureError {
    pub fn new(kind: MediaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Host capability for opening capture devices.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, CaptureError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandle(Arc<AtomicUsize>);

    impl CaptureHandle for CountingHandle {
        fn release(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn stopping_twice_releases_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let stream = MediaStream::new(vec![
            MediaTrack::captured(
                TrackKind::Audio,
                TrackSettings::default(),
                Arc::new(CountingHandle(releases.clone())),
            ),
            MediaTrack::captured(
                TrackKind::Video,
                TrackSettings::video(640, 480, 30.0),
                Arc::new(CountingHandle(releases.clone())),
            ),
        ]);
        assert!(stream.is_active());
        assert_eq!(stream.stop_all(), 2);
        assert_eq!(stream.clone().stop_all(), 0);
        assert!(!stream.is_active());
        assert_eq!(releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn enabled_flags_reported_per_kind() {
        let stream = MediaStream::new(vec![MediaTrack::remote(
            TrackKind::Video,
            TrackSettings::video(320, 240, 15.0),
        )]);
        assert_eq!(stream.all_enabled(TrackKind::Audio), None);
        stream.set_enabled(TrackKind::Video, false);
        assert_eq!(stream.all_enabled(TrackKind::Video), Some(false));
        assert_eq!(stream.video_settings().and_then(|s| s.resolution()), Some((320, 240)));
    }
}
