use super::constraints::{MediaConstraints, Strategy, ladder};
use super::device::{DeviceClass, DeviceProfile};
use super::{MediaDevices, MediaErrorKind, MediaStream, TrackKind};
use std::sync::Arc;

/// Smallest video a mobile capture may deliver before the next rung is tried.
pub const MIN_MOBILE_WIDTH: u32 = 240;
pub const MIN_MOBILE_HEIGHT: u32 = 180;

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyFailure {
    pub strategy: String,
    pub kind: MediaErrorKind,
    pub reason: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("could not start camera/microphone ({kind}) on {device_class}: {remediation}")]
pub struct MediaError {
    pub kind: MediaErrorKind,
    pub device_class: DeviceClass,
    pub remediation: String,
    pub attempts: Vec<StrategyFailure>,
}

impl MediaError {
    fn new(kind: MediaErrorKind, device_class: DeviceClass, attempts: Vec<StrategyFailure>) -> Self {
        Self {
            kind,
            device_class,
            remediation: remediation(kind, device_class),
            attempts,
        }
    }

    /// One line per strategy tried, in order.
    pub fn detail(&self) -> String {
        self.attempts
            .iter()
            .map(|failure| format!("{}: {} ({})", failure.strategy, failure.kind, failure.reason))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct MediaAcquirer {
    devices: Arc<dyn MediaDevices>,
    profile: DeviceProfile,
    class: DeviceClass,
}

impl MediaAcquirer {
    pub fn new(devices: Arc<dyn MediaDevices>, profile: DeviceProfile) -> Self {
        let class = DeviceClass::classify(&profile);
        tracing::debug!(target = "huddle::media", device_class = %class, "classified capture device");
        Self {
            devices,
            profile,
            class,
        }
    }

    /// Opens a capture stream, walking the fallback ladder until a strategy
    /// yields a stream that passes validation.
    pub async fn acquire(&self, explicit: Option<MediaConstraints>) -> Result<MediaStream, MediaError> {
        if !self.profile.secure_context {
            tracing::warn!(target = "huddle::media", "capture requires a secure context");
            return Err(MediaError::new(
                MediaErrorKind::InsecureContext,
                self.class,
                Vec::new(),
            ));
        }

        let mut strategies = Vec::new();
        if let Some(constraints) = explicit {
            strategies.push(Strategy {
                name: "explicit",
                constraints,
            });
        }
        strategies.extend(ladder(self.class));

        let mut attempts: Vec<StrategyFailure> = Vec::new();
        for strategy in strategies {
            match self.devices.get_user_media(&strategy.constraints).await {
                Ok(stream) => match self.validate(&stream) {
                    Ok(()) => {
                        tracing::info!(
                            target = "huddle::media",
                            strategy = strategy.name,
                            device_class = %self.class,
                            failed_attempts = attempts.len(),
                            "local media acquired"
                        );
                        return Ok(stream);
                    }
                    Err(reason) => {
                        stream.stop_all();
                        tracing::debug!(
                            target = "huddle::media",
                            strategy = strategy.name,
                            %reason,
                            "capture rejected"
                        );
                        attempts.push(StrategyFailure {
                            strategy: strategy.name.to_string(),
                            kind: MediaErrorKind::Overconstrained,
                            reason,
                        });
                    }
                },
                Err(err) => {
                    tracing::debug!(
                        target = "huddle::media",
                        strategy = strategy.name,
                        error = %err,
                        "capture strategy failed"
                    );
                    let terminal = err.kind.is_terminal();
                    attempts.push(StrategyFailure {
                        strategy: strategy.name.to_string(),
                        kind: err.kind,
                        reason: err.message,
                    });
                    if terminal {
                        break;
                    }
                }
            }
        }

        let kind = attempts
            .last()
            .map(|failure| failure.kind)
            .unwrap_or(MediaErrorKind::Other);
        let error = MediaError::new(kind, self.class, attempts);
        tracing::warn!(
            target = "huddle::media",
            error = %error,
            detail = %error.detail(),
            "all capture strategies failed"
        );
        Err(error)
    }

    fn validate(&self, stream: &MediaStream) -> Result<(), String> {
        if !stream.is_active() {
            return Err("stream has no live tracks".into());
        }
        if !self.class.is_mobile() {
            return Ok(());
        }
        let Some(track) = stream.tracks_of(TrackKind::Video).find(|track| track.is_live()) else {
            return Err("no live video track".into());
        };
        match track.settings().resolution() {
            Some((width, height)) if width < MIN_MOBILE_WIDTH || height < MIN_MOBILE_HEIGHT => Err(
                format!("video {width}x{height} below {MIN_MOBILE_WIDTH}x{MIN_MOBILE_HEIGHT}"),
            ),
            _ => Ok(()),
        }
    }
}

/// User-facing advice for a failure kind on a device class.
pub fn remediation(kind: MediaErrorKind, class: DeviceClass) -> String {
    let text = match (kind, class) {
        (MediaErrorKind::PermissionDenied, DeviceClass::Ios) => {
            "Allow camera and microphone for this site in Settings > Safari > Camera, then reload."
        }
        (MediaErrorKind::PermissionDenied, DeviceClass::Android) => {
            "Tap the lock icon in the address bar, allow camera and microphone, then reload."
        }
        (MediaErrorKind::PermissionDenied, _) => {
            "Camera or microphone access was blocked. Allow access in the browser's site settings and try again."
        }
        (MediaErrorKind::DeviceNotFound, DeviceClass::Desktop) => {
            "No camera or microphone was found. Connect a device and try again."
        }
        (MediaErrorKind::DeviceNotFound, _) => {
            "No usable camera was found on this device."
        }
        (MediaErrorKind::DeviceBusy, DeviceClass::Desktop) => {
            "The camera is in use by another application. Close it and try again."
        }
        (MediaErrorKind::DeviceBusy, _) => {
            "The camera is busy. Close other apps using the camera and try again."
        }
        (MediaErrorKind::Overconstrained, _) => {
            "The camera could not satisfy any supported video quality."
        }
        (MediaErrorKind::InsecureContext, _) => {
            "Camera access requires a secure (https) connection."
        }
        (MediaErrorKind::Aborted, _) => "Camera start-up was interrupted. Try again.",
        (MediaErrorKind::Other, _) => "An unexpected error occurred while starting the camera.",
    };
    text.to_string()
}
