use super::device::DeviceClass;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub facing: Option<FacingMode>,
}

impl VideoConstraints {
    pub fn sized(width: u32, height: u32, frame_rate: f64) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            frame_rate: Some(frame_rate),
            facing: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    /// `None` requests no video at all.
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn with_video(video: VideoConstraints) -> Self {
        Self {
            audio: true,
            video: Some(video),
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::with_video(VideoConstraints::default())
    }
}

/// A named rung of the fallback ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    pub name: &'static str,
    pub constraints: MediaConstraints,
}

impl Strategy {
    fn new(name: &'static str, video: VideoConstraints) -> Self {
        Self {
            name,
            constraints: MediaConstraints::with_video(video),
        }
    }
}

/// Ordered strategies for a device class, richest first.
pub fn ladder(class: DeviceClass) -> Vec<Strategy> {
    match class {
        DeviceClass::Desktop => vec![
            Strategy::new("high", VideoConstraints::sized(1280, 720, 30.0)),
            Strategy::new("standard", VideoConstraints::sized(640, 480, 30.0)),
            Strategy::new("basic", VideoConstraints::default()),
        ],
        mobile => {
            let mut strategies = vec![Strategy::new(
                "high",
                VideoConstraints {
                    facing: Some(FacingMode::User),
                    ..VideoConstraints::sized(1280, 720, 30.0)
                },
            )];
            if mobile == DeviceClass::Android {
                strategies.push(Strategy::new(
                    "android-optimized",
                    VideoConstraints {
                        facing: Some(FacingMode::User),
                        ..VideoConstraints::sized(960, 540, 24.0)
                    },
                ));
            }
            strategies.extend([
                Strategy::new(
                    "medium",
                    VideoConstraints {
                        facing: Some(FacingMode::User),
                        ..VideoConstraints::sized(640, 480, 24.0)
                    },
                ),
                Strategy::new("low", VideoConstraints::sized(320, 240, 15.0)),
                Strategy::new(
                    "basic",
                    VideoConstraints {
                        facing: Some(FacingMode::User),
                        ..VideoConstraints::default()
                    },
                ),
                Strategy::new("minimal", VideoConstraints::default()),
            ]);
            strategies
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(class: DeviceClass) -> Vec<&'static str> {
        ladder(class).into_iter().map(|s| s.name).collect()
    }

    #[test]
    fn desktop_and_mobile_ladders() {
        assert_eq!(names(DeviceClass::Desktop), ["high", "standard", "basic"]);
        assert_eq!(
            names(DeviceClass::Android),
            ["high", "android-optimized", "medium", "low", "basic", "minimal"]
        );
        assert_eq!(names(DeviceClass::Ios), ["high", "medium", "low", "basic", "minimal"]);
    }
}
