//! A scriptable camera/microphone pair for simulations and tests.

use super::{
    CaptureError, CaptureHandle, MediaConstraints, MediaDevices, MediaStream, MediaTrack,
    TrackKind, TrackSettings,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy)]
struct Camera {
    width: u32,
    height: u32,
    frame_rate: f64,
    report_settings: bool,
}

pub struct SyntheticDevices {
    camera: Mutex<Camera>,
    scripted: Mutex<VecDeque<CaptureError>>,
    permanent: Mutex<Option<CaptureError>>,
    issued: Mutex<Vec<MediaStream>>,
    live: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    attempts: AtomicUsize,
    captures: AtomicUsize,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::with_native_resolution(1280, 720)
    }

    pub fn with_native_resolution(width: u32, height: u32) -> Self {
        Self {
            camera: Mutex::new(Camera {
                width,
                height,
                frame_rate: 30.0,
                report_settings: true,
            }),
            scripted: Mutex::new(VecDeque::new()),
            permanent: Mutex::new(None),
            issued: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
            releases: Arc::new(AtomicUsize::new(0)),
            attempts: AtomicUsize::new(0),
            captures: AtomicUsize::new(0),
        }
    }

    /// Fails the next captures, one error per call, before behaving normally.
    pub fn script_failures(&self, errors: impl IntoIterator<Item = CaptureError>) {
        self.scripted.lock().extend(errors);
    }

    pub fn fail_always(&self, error: CaptureError) {
        *self.permanent.lock() = Some(error);
    }

    pub fn set_report_settings(&self, report: bool) {
        self.camera.lock().report_settings = report;
    }

    /// Ends every stream handed out so far, as if the device was unplugged.
    pub fn unplug(&self) {
        for stream in self.issued.lock().iter() {
            stream.stop_all();
        }
    }

    pub fn last_stream(&self) -> Option<MediaStream> {
        self.issued.lock().last().cloned()
    }

    /// Capture handles opened and not yet released.
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Every `release` call observed, duplicates included.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    fn open_handle(&self) -> Arc<dyn CaptureHandle> {
        self.live.fetch_add(1, Ordering::SeqCst);
        Arc::new(SyntheticHandle {
            live: Arc::clone(&self.live),
            releases: Arc::clone(&self.releases),
            released: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, CaptureError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.permanent.lock().clone() {
            return Err(error);
        }
        if let Some(error) = self.scripted.lock().pop_front() {
            return Err(error);
        }

        let camera = *self.camera.lock();
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::captured(
                TrackKind::Audio,
                TrackSettings::default(),
                self.open_handle(),
            ));
        }
        if let Some(video) = &constraints.video {
            let settings = if camera.report_settings {
                TrackSettings::video(
                    video.width.map_or(camera.width, |w| w.min(camera.width)),
                    video.height.map_or(camera.height, |h| h.min(camera.height)),
                    video
                        .frame_rate
                        .map_or(camera.frame_rate, |fps| fps.min(camera.frame_rate)),
                )
            } else {
                TrackSettings::default()
            };
            tracks.push(MediaTrack::captured(TrackKind::Video, settings, self.open_handle()));
        }

        let stream = MediaStream::new(tracks);
        self.captures.fetch_add(1, Ordering::SeqCst);
        self.issued.lock().push(stream.clone());
        Ok(stream)
    }
}

struct SyntheticHandle {
    live: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl CaptureHandle for SyntheticHandle {
    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if !self.released.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
