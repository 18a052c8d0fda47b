use serde::{Deserialize, Serialize};
use std::fmt;

/// Facts the host reports about the device running the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub user_agent: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub max_touch_points: u32,
    pub secure_context: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) huddle".into(),
            viewport_width: 1440,
            viewport_height: 900,
            max_touch_points: 0,
            secure_context: true,
        }
    }
}

impl DeviceProfile {
    pub fn android_phone() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Linux; Android 14; Pixel 8) Mobile".into(),
            viewport_width: 412,
            viewport_height: 915,
            max_touch_points: 5,
            secure_context: true,
        }
    }

    pub fn iphone() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) Mobile".into(),
            viewport_width: 390,
            viewport_height: 844,
            max_touch_points: 5,
            secure_context: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
    Desktop,
    Android,
    Ios,
    OtherMobile,
}

const SMALL_VIEWPORT: u32 = 820;

impl DeviceClass {
    /// Best-effort classification; a wrong guess only changes which
    /// constraint ladder is tried.
    pub fn classify(profile: &DeviceProfile) -> Self {
        let ua = profile.user_agent.to_ascii_lowercase();
        if ua.contains("android") {
            return DeviceClass::Android;
        }
        if ["iphone", "ipad", "ipod"].iter().any(|needle| ua.contains(needle)) {
            return DeviceClass::Ios;
        }
        // iPadOS reports a desktop Safari UA but exposes touch.
        if ua.contains("macintosh") && profile.max_touch_points > 1 {
            return DeviceClass::Ios;
        }
        let narrow = profile.viewport_width.min(profile.viewport_height) <= SMALL_VIEWPORT;
        if ua.contains("mobi") || (profile.max_touch_points > 0 && narrow) {
            return DeviceClass::OtherMobile;
        }
        DeviceClass::Desktop
    }

    pub fn is_mobile(self) -> bool {
        !matches!(self, DeviceClass::Desktop)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Android => "android",
            DeviceClass::Ios => "ios",
            DeviceClass::OtherMobile => "mobile",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_devices() {
        assert_eq!(DeviceClass::classify(&DeviceProfile::default()), DeviceClass::Desktop);
        assert_eq!(DeviceClass::classify(&DeviceProfile::android_phone()), DeviceClass::Android);
        assert_eq!(DeviceClass::classify(&DeviceProfile::iphone()), DeviceClass::Ios);
    }

    #[test]
    fn touch_mac_is_treated_as_ios() {
        let profile = DeviceProfile {
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) Safari".into(),
            max_touch_points: 5,
            ..DeviceProfile::default()
        };
        assert_eq!(DeviceClass::classify(&profile), DeviceClass::Ios);
    }

    #[test]
    fn small_touch_screen_without_mobile_ua() {
        let profile = DeviceProfile {
            user_agent: "Mozilla/5.0 (X11; Linux armv7l) KaiOS".into(),
            viewport_width: 360,
            viewport_height: 640,
            max_touch_points: 1,
            secure_context: true,
        };
        assert_eq!(DeviceClass::classify(&profile), DeviceClass::OtherMobile);
        assert!(DeviceClass::OtherMobile.is_mobile());
    }
}
