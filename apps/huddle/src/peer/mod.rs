//! Seams to the host's peer-to-peer broker, plus the factory that owns the
//! session's single broker identity.

pub mod factory;

pub use factory::{FactoryConfig, FactoryEvent, PeerConnectionFactory};

use crate::media::MediaStream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("peer {0} is unavailable")]
    PeerUnavailable(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("broker connection lost")]
    Disconnected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("peer connection destroyed")]
    Destroyed,
    #[error("invalid peer configuration: {0}")]
    InvalidConfig(String),
    #[error("{0}")]
    Other(String),
}

impl PeerError {
    /// Failures a reconnect may cure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PeerError::Timeout(_) | PeerError::Network(_) | PeerError::Disconnected
        )
    }

    /// Failures that justify trying the fallback endpoint.
    pub fn is_network(&self) -> bool {
        matches!(self, PeerError::Timeout(_) | PeerError::Network(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Where the broker lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_secure")]
    pub secure: bool,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
}

fn default_path() -> String {
    "/".into()
}

fn default_secure() -> bool {
    true
}

pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::stun("stun:stun.l.google.com:19302")]
}

impl EndpointConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: default_path(),
            secure: default_secure(),
            key: None,
            ice_servers: default_ice_servers(),
        }
    }

    pub fn url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}{}", self.host, self.port, self.path)
    }

    /// ICE servers in `webrtc` form. Rejects urls a peer connection could
    /// not use and relay servers without credentials.
    pub fn rtc_ice_servers(&self) -> Result<Vec<RTCIceServer>, PeerError> {
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(PeerError::InvalidConfig(format!("{self}: ice server without urls")));
            }
            for url in &server.urls {
                let scheme = url.split_once(':').map(|(scheme, _)| scheme).unwrap_or_default();
                match scheme {
                    "stun" | "stuns" => {}
                    "turn" | "turns" if server.username.is_some() && server.credential.is_some() => {}
                    "turn" | "turns" => {
                        return Err(PeerError::InvalidConfig(format!("{url}: relay server needs username and credential")));
                    }
                    _ => return Err(PeerError::InvalidConfig(format!("{url}: not a stun or turn url"))),
                }
            }
        }
        Ok(self.ice_servers.iter().map(IceServerConfig::to_rtc).collect())
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// One statistics report for a call. Fields the host cannot provide stay `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportStats {
    pub sampled_at: Instant,
    pub bytes_received: Option<u64>,
    pub frames_decoded: Option<u64>,
    pub round_trip_time: Option<Duration>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
}

impl TransportStats {
    pub fn empty(sampled_at: Instant) -> Self {
        Self {
            sampled_at,
            bytes_received: None,
            frames_decoded: None,
            round_trip_time: None,
            frame_width: None,
            frame_height: None,
        }
    }
}

pub enum CallEvent {
    Stream(MediaStream),
    IceState(RTCIceConnectionState),
    Closed,
    Error(PeerError),
}

impl fmt::Debug for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallEvent::Stream(stream) => f.debug_tuple("Stream").field(&stream.id()).finish(),
            CallEvent::IceState(state) => f.debug_tuple("IceState").field(state).finish(),
            CallEvent::Closed => f.write_str("Closed"),
            CallEvent::Error(err) => f.debug_tuple("Error").field(err).finish(),
        }
    }
}

pub enum LinkEvent {
    IncomingCall(Arc<dyn MediaCall>),
    Disconnected,
    Error(PeerError),
}

/// Connection to the broker under one identity.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn id(&self) -> &str;
    fn is_open(&self) -> bool;
    /// Events for this link; yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>>;
    /// Re-establishes the broker connection under the same identity.
    async fn reconnect(&self) -> Result<(), PeerError>;
    async fn call(&self, remote_id: &str, stream: &MediaStream) -> Result<Arc<dyn MediaCall>, PeerError>;
    fn destroy(&self);
}

/// A media call with one remote peer, either placed or received.
#[async_trait]
pub trait MediaCall: Send + Sync {
    fn call_id(&self) -> &str;
    fn remote_id(&self) -> &str;
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CallEvent>>;
    async fn answer(&self, stream: &MediaStream) -> Result<(), PeerError>;
    fn close(&self);
    async fn stats(&self) -> Option<TransportStats>;
    fn ice_state(&self) -> RTCIceConnectionState;
    /// Application-level echo: the remote sends `payload` straight back.
    async fn echo(&self, payload: u64) -> Result<u64, PeerError>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn open(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn PeerLink>, PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_and_ice_servers() {
        let mut endpoint = EndpointConfig::new("peers.example.com", 443);
        endpoint.path = "/broker".into();
        assert_eq!(endpoint.url(), "https://peers.example.com:443/broker");
        let servers = endpoint.rtc_ice_servers().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302".to_string()]);
    }

    #[test]
    fn relay_servers_need_credentials() {
        let mut endpoint = EndpointConfig::new("peers.example.com", 443);
        endpoint.ice_servers.push(IceServerConfig::stun("turn:relay.example.com:3478"));
        assert!(matches!(endpoint.rtc_ice_servers(), Err(PeerError::InvalidConfig(_))));

        let relay = endpoint.ice_servers.last_mut().unwrap();
        relay.username = Some("huddle".into());
        relay.credential = Some("secret".into());
        let servers = endpoint.rtc_ice_servers().unwrap();
        assert_eq!(servers[1].username, "huddle");

        endpoint.ice_servers.push(IceServerConfig::stun("relay.example.com"));
        assert!(matches!(endpoint.rtc_ice_servers(), Err(PeerError::InvalidConfig(_))));
    }

    #[test]
    fn transient_classification() {
        assert!(PeerError::Disconnected.is_transient());
        assert!(PeerError::Timeout(Duration::from_secs(1)).is_network());
        assert!(!PeerError::Protocol("bad key".into()).is_transient());
        assert!(!PeerError::PeerUnavailable("x".into()).is_transient());
    }
}
