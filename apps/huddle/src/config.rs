use crate::backoff::BackoffPolicy;
use crate::monitor::MonitorConfig;
use crate::peer::{EndpointConfig, FactoryConfig};
use crate::session::SessionConfig;
use crate::signaling::websocket::derive_websocket_url;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Huddle configuration: a TOML file, then `HUDDLE_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HuddleConfig {
    pub signaling: SignalingSection,
    pub peer: PeerSection,
    pub session: SessionSection,
    pub monitor: MonitorSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingSection {
    pub url: String,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub max_attempts: u32,
}

impl Default for SignalingSection {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3000".to_string(),
            retry_base_ms: 1_000,
            retry_max_ms: 5_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSection {
    pub primary: EndpointConfig,
    pub fallback: Option<EndpointConfig>,
    pub open_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_attempts: u32,
    pub min_reconnect_gap_ms: u64,
    pub liveness_ms: u64,
}

impl Default for PeerSection {
    fn default() -> Self {
        let mut primary = EndpointConfig::new("127.0.0.1", 9000);
        primary.path = "/peerjs".to_string();
        primary.secure = false;
        Self {
            primary,
            fallback: Some(EndpointConfig::new("0.peerjs.com", 443)),
            open_timeout_ms: 15_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 16_000,
            reconnect_attempts: 5,
            min_reconnect_gap_ms: 2_000,
            liveness_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub room_id: String,
    pub join_settle_ms: u64,
    pub rejoin_delay_ms: u64,
    pub unavailable_retries: u32,
    pub unavailable_step_ms: u64,
    pub chat_history: usize,
    pub start_muted: bool,
    pub start_video: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            room_id: "lobby".to_string(),
            join_settle_ms: 1_000,
            rejoin_delay_ms: 3_000,
            unavailable_retries: 3,
            unavailable_step_ms: 2_000,
            chat_history: 200,
            start_muted: true,
            start_video: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub sample_interval_ms: u64,
    pub probe_interval_ms: u64,
    pub fps_window_ms: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            probe_interval_ms: 5_000,
            fps_window_ms: 5_000,
        }
    }
}

impl HuddleConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Defaults (or `path`, when given) with environment overrides applied.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(url) = env_value("HUDDLE_SIGNALING_URL") {
            self.signaling.url = url;
        }
        if let Some(host) = env_value("HUDDLE_PEER_HOST") {
            self.peer.primary.host = host;
        }
        if let Some(port) = env_value("HUDDLE_PEER_PORT") {
            self.peer.primary.port = port.parse().map_err(|_| ConfigError::Env {
                var: "HUDDLE_PEER_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(secure) = env_value("HUDDLE_PEER_SECURE") {
            self.peer.primary.secure = parse_flag("HUDDLE_PEER_SECURE", &secure)?;
        }
        if let Some(disable) = env_value("HUDDLE_DISABLE_FALLBACK") {
            if parse_flag("HUDDLE_DISABLE_FALLBACK", &disable)? {
                self.peer.fallback = None;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        derive_websocket_url(&self.signaling.url).map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if self.session.room_id.trim().is_empty() {
            return Err(ConfigError::Invalid("session.room_id must not be empty".into()));
        }
        for (name, endpoint) in [("peer.primary", Some(&self.peer.primary)), ("peer.fallback", self.peer.fallback.as_ref())] {
            let Some(endpoint) = endpoint else { continue };
            if endpoint.host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name}.host must not be empty")));
            }
            if endpoint.port == 0 {
                return Err(ConfigError::Invalid(format!("{name}.port must not be 0")));
            }
            if !endpoint.path.starts_with('/') {
                return Err(ConfigError::Invalid(format!("{name}.path must start with '/'")));
            }
            endpoint
                .rtc_ice_servers()
                .map_err(|err| ConfigError::Invalid(format!("{name}.ice_servers: {err}")))?;
        }
        if self.peer.open_timeout_ms == 0 {
            return Err(ConfigError::Invalid("peer.open_timeout_ms must be positive".into()));
        }
        if self.peer.liveness_ms == 0 {
            return Err(ConfigError::Invalid("peer.liveness_ms must be positive".into()));
        }
        if self.signaling.retry_base_ms > self.signaling.retry_max_ms
            || self.peer.reconnect_base_ms > self.peer.reconnect_max_ms
        {
            return Err(ConfigError::Invalid("retry base delay exceeds its ceiling".into()));
        }
        if self.monitor.sample_interval_ms == 0
            || self.monitor.probe_interval_ms == 0
            || self.monitor.fps_window_ms == 0
        {
            return Err(ConfigError::Invalid("monitor intervals must be positive".into()));
        }
        Ok(())
    }

    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        self.validate()?;
        let mut config = SessionConfig::new(
            self.session.room_id.trim(),
            self.signaling.url.clone(),
            self.peer.primary.clone(),
        );
        config.fallback = self.peer.fallback.clone();
        config.factory = FactoryConfig {
            open_timeout: ms(self.peer.open_timeout_ms),
            reconnect: BackoffPolicy::exponential(
                ms(self.peer.reconnect_base_ms),
                ms(self.peer.reconnect_max_ms),
                self.peer.reconnect_attempts,
            ),
            min_reconnect_gap: ms(self.peer.min_reconnect_gap_ms),
            liveness_interval: ms(self.peer.liveness_ms),
        };
        config.signaling_backoff = BackoffPolicy::exponential(
            ms(self.signaling.retry_base_ms),
            ms(self.signaling.retry_max_ms),
            self.signaling.max_attempts,
        );
        config.monitor = MonitorConfig {
            sample_interval: ms(self.monitor.sample_interval_ms),
            probe_interval: ms(self.monitor.probe_interval_ms),
            fps_window: ms(self.monitor.fps_window_ms),
        };
        config.join_settle_delay = ms(self.session.join_settle_ms);
        config.rejoin_delay = ms(self.session.rejoin_delay_ms);
        config.unavailable_retry =
            BackoffPolicy::linear(ms(self.session.unavailable_step_ms), self.session.unavailable_retries);
        config.chat_history = self.session.chat_history;
        config.start_muted = self.session.start_muted;
        config.start_video = self.session.start_video;
        Ok(config)
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn env_value(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env {
            var,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variables are process-wide.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "HUDDLE_SIGNALING_URL",
        "HUDDLE_PEER_HOST",
        "HUDDLE_PEER_PORT",
        "HUDDLE_PEER_SECURE",
        "HUDDLE_DISABLE_FALLBACK",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = HuddleConfig::default();
        config.validate().unwrap();
        let session = config.session_config().unwrap();
        assert_eq!(session.room_id, "lobby");
        assert_eq!(session.chat_history, 200);
        assert_eq!(session.factory.open_timeout, Duration::from_secs(15));
        assert_eq!(
            session.unavailable_retry.schedule().collect::<Vec<_>>(),
            vec![Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(6)]
        );
        assert!(session.fallback.is_some());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let raw = r#"
            [session]
            room_id = "standup"

            [peer.primary]
            host = "peers.internal"
            port = 9443
        "#;
        let config: HuddleConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.session.room_id, "standup");
        assert_eq!(config.session.join_settle_ms, 1_000);
        assert_eq!(config.peer.primary.host, "peers.internal");
        assert_eq!(config.peer.primary.path, "/");
        assert!(config.peer.primary.secure);
        assert_eq!(config.signaling.max_attempts, 5);
    }

    #[test]
    fn env_overrides_apply() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("HUDDLE_SIGNALING_URL", "https://rooms.example.com");
            env::set_var("HUDDLE_PEER_HOST", "peers.example.com");
            env::set_var("HUDDLE_PEER_PORT", "9443");
            env::set_var("HUDDLE_PEER_SECURE", "yes");
            env::set_var("HUDDLE_DISABLE_FALLBACK", "1");
        }
        let config = HuddleConfig::resolve(None);
        clear_env();
        let config = config.unwrap();
        assert_eq!(config.signaling.url, "https://rooms.example.com");
        assert_eq!(config.peer.primary.host, "peers.example.com");
        assert_eq!(config.peer.primary.port, 9443);
        assert!(config.peer.primary.secure);
        assert!(config.peer.fallback.is_none());
    }

    #[test]
    fn bad_port_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("HUDDLE_PEER_PORT", "ninety");
        }
        let result = HuddleConfig::resolve(None);
        clear_env();
        assert!(matches!(result, Err(ConfigError::Env { var: "HUDDLE_PEER_PORT", .. })));
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = HuddleConfig::default();
        config.signaling.url = "ftp://rooms.example.com".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = HuddleConfig::default();
        config.session.room_id = "  ".into();
        assert!(config.session_config().is_err());

        let mut config = HuddleConfig::default();
        config.peer.primary.path = "peerjs".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut config = HuddleConfig::default();
        config.peer.liveness_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(message)) if message.contains("liveness")));
        assert!(config.session_config().is_err());

        let mut config = HuddleConfig::default();
        config.monitor.fps_window_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn relay_without_credentials_is_rejected() {
        let raw = r#"
            [peer.primary]
            host = "peers.internal"
            port = 9000

            [[peer.primary.ice_servers]]
            urls = ["turn:relay.internal:3478"]
        "#;
        let config: HuddleConfig = toml::from_str(raw).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(message)) if message.contains("peer.primary")));
    }
}
