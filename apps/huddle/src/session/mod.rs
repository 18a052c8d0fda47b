//! The call session: room membership, the peer roster, join/leave races,
//! retries and teardown, driven by a single actor task.

mod actor;
mod calls;
mod participants;
mod timers;

use crate::backoff::BackoffPolicy;
use crate::media::{DeviceProfile, MediaConstraints, MediaDevices, MediaError};
use crate::monitor::{ConnectionStatus, MetricsUpdate, MonitorConfig};
use crate::peer::{EndpointConfig, FactoryConfig, PeerError, PeerTransport};
use crate::signaling::{ChannelState, SignalingConnector, SignalingError};
use huddle_proto::ChatMessage;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room_id: String,
    pub signaling_url: String,
    pub primary: EndpointConfig,
    pub fallback: Option<EndpointConfig>,
    pub constraints: Option<MediaConstraints>,
    pub factory: FactoryConfig,
    pub signaling_backoff: BackoffPolicy,
    pub monitor: MonitorConfig,
    /// Pause between a `peer-joined` notice and dialing that peer.
    pub join_settle_delay: Duration,
    /// Retries for dials the broker rejects as peer-unavailable.
    pub unavailable_retry: BackoffPolicy,
    /// Pause before re-dialing a peer whose call closed without a leave notice.
    pub rejoin_delay: Duration,
    pub chat_history: usize,
    pub start_muted: bool,
    pub start_video: bool,
}

impl SessionConfig {
    pub fn new(room_id: impl Into<String>, signaling_url: impl Into<String>, primary: EndpointConfig) -> Self {
        Self {
            room_id: room_id.into(),
            signaling_url: signaling_url.into(),
            primary,
            fallback: None,
            constraints: None,
            factory: FactoryConfig::default(),
            signaling_backoff: BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(5), 5),
            monitor: MonitorConfig::default(),
            join_settle_delay: Duration::from_secs(1),
            unavailable_retry: BackoffPolicy::linear(Duration::from_secs(2), 3),
            rejoin_delay: Duration::from_secs(3),
            chat_history: 200,
            start_muted: true,
            start_video: true,
        }
    }
}

/// Host capabilities the session runs on.
#[derive(Clone)]
pub struct SessionDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub profile: DeviceProfile,
    pub signaling: Arc<dyn SignalingConnector>,
    pub transport: Arc<dyn PeerTransport>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("peer connection: {0}")]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("session is not active")]
    NotActive,
    #[error("chat message is empty")]
    EmptyMessage,
    #[error("session task has exited")]
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    AcquiringMedia,
    EstablishingIdentity,
    JoiningRoom,
    Active,
    Leaving,
    Terminated,
    Failed(SessionError),
}

impl SessionState {
    pub fn is_finished(&self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::AcquiringMedia => f.write_str("acquiring-media"),
            SessionState::EstablishingIdentity => f.write_str("establishing-identity"),
            SessionState::JoiningRoom => f.write_str("joining-room"),
            SessionState::Active => f.write_str("active"),
            SessionState::Leaving => f.write_str("leaving"),
            SessionState::Terminated => f.write_str("terminated"),
            SessionState::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    State(SessionState),
    ParticipantJoined { peer_id: String, count: usize },
    ParticipantLeft { peer_id: String, count: usize },
    Metrics(MetricsUpdate),
    Chat(ChatMessage),
    Signaling(ChannelState),
    Broker { connected: bool },
    Controls(Controls),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    pub muted: bool,
    pub video_on: bool,
    pub recording: bool,
}

/// One video element the presentation layer renders.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTile {
    pub element_id: String,
    pub peer_id: String,
    pub label: String,
    pub is_self: bool,
    pub status: ConnectionStatus,
    pub connected_for: Duration,
    pub ping: Option<String>,
    pub rate: Option<String>,
    pub resolution: Option<String>,
    pub fps: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub room_id: String,
    pub local_id: Option<String>,
    pub controls: Controls,
    pub signaling: Option<ChannelState>,
    pub broker_connected: bool,
    pub participant_count: usize,
    pub tiles: Vec<VideoTile>,
    pub chat: Vec<ChatMessage>,
}

impl SessionSnapshot {
    pub fn remote_peers(&self) -> Vec<&str> {
        self.tiles
            .iter()
            .filter(|tile| !tile.is_self)
            .map(|tile| tile.peer_id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyId,
    OwnId,
    AlreadyConnected,
    AlreadyPending,
    NotReady,
    NoLocalMedia,
    Departed,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Dialing,
    Skipped(SkipReason),
}

pub(crate) enum Command {
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Connect(String, oneshot::Sender<ConnectOutcome>),
    ToggleMute(oneshot::Sender<Controls>),
    ToggleVideo(oneshot::Sender<Controls>),
    ToggleRecording(oneshot::Sender<Controls>),
    SendChat(String, oneshot::Sender<Result<ChatMessage, SessionError>>),
    Leave(oneshot::Sender<()>),
}

/// Cheap, cloneable control surface for a running session. Dropping every
/// handle leaves the call.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    updates: broadcast::Sender<SessionUpdate>,
}

const UPDATE_CAPACITY: usize = 256;

impl SessionHandle {
    /// Spawns the session and begins joining `config.room_id`.
    pub fn start(config: SessionConfig, deps: SessionDeps) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (updates_tx, _) = broadcast::channel(UPDATE_CAPACITY);
        let session = actor::SessionActor::new(config, deps, commands_rx, state_tx, updates_tx.clone());
        tokio::spawn(session.run());
        Self {
            commands: commands_tx,
            state: state_rx,
            updates: updates_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Resolves with the first state matching `predicate`.
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> SessionState
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut state = self.state.clone();
        loop {
            {
                let current = state.borrow_and_update();
                if predicate(&current) {
                    return current.clone();
                }
            }
            if state.changed().await.is_err() {
                return state.borrow().clone();
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(Command::Snapshot).await
    }

    pub async fn connect_to_new_user(&self, peer_id: &str) -> Result<ConnectOutcome, SessionError> {
        let peer_id = peer_id.to_string();
        self.request(|reply| Command::Connect(peer_id, reply)).await
    }

    pub async fn toggle_mute(&self) -> Result<Controls, SessionError> {
        self.request(Command::ToggleMute).await
    }

    pub async fn toggle_video(&self) -> Result<Controls, SessionError> {
        self.request(Command::ToggleVideo).await
    }

    pub async fn toggle_recording(&self) -> Result<Controls, SessionError> {
        self.request(Command::ToggleRecording).await
    }

    pub async fn send_chat(&self, text: &str) -> Result<ChatMessage, SessionError> {
        let text = text.to_string();
        self.request(|reply| Command::SendChat(text, reply)).await?
    }

    /// Leaves the call and releases everything. Safe to call any number of times.
    pub async fn leave_call(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Leave(reply)).is_ok() {
            let _ = done.await;
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }
}
