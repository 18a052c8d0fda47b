//! Reconnecting client for the room presence/messaging server.

pub mod websocket;

pub use websocket::WebSocketConnector;

use crate::backoff::BackoffPolicy;
use async_trait::async_trait;
use huddle_proto::{ChatMessage, ClientEvent, PeerRef, RoomJoin, ServerEvent};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling connect failed: {0}")]
    Connect(String),
    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),
    #[error("signaling channel not connected")]
    NotConnected,
    #[error("signaling channel permanently disconnected")]
    Disconnected,
    #[error("signaling channel destroyed")]
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect ceiling reached; nothing further will be delivered.
    Disconnected,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Connecting => f.write_str("connecting"),
            ChannelState::Connected => f.write_str("connected"),
            ChannelState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            ChannelState::Disconnected => f.write_str("disconnected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    PeerJoined(PeerRef),
    PeerLeft(PeerRef),
    Chat(ChatMessage),
    State(ChannelState),
}

/// One live connection to the server. Dropping it tears the connection down.
pub struct SignalingLink {
    pub outbound: mpsc::UnboundedSender<ClientEvent>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<ClientEvent>,
        inbound: mpsc::UnboundedReceiver<ServerEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        self.tasks = tasks;
        self
    }
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SignalingLink, SignalingError>;
}

enum Command {
    Join(RoomJoin),
    Send(ClientEvent),
}

pub struct SignalingChannel {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelState>,
    destroyed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Starts the connection supervisor. Events, including state changes,
    /// are delivered on `events` until the channel is destroyed.
    pub fn connect(
        connector: Arc<dyn SignalingConnector>,
        url: impl Into<String>,
        policy: BackoffPolicy,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Arc<Self> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let supervisor = Supervisor {
            connector,
            url: url.into(),
            policy,
            commands: commands_rx,
            events,
            state: state_tx,
            join: None,
        };
        let task = tokio::spawn(supervisor.run());
        Arc::new(Self {
            commands: commands_tx,
            state: state_rx,
            destroyed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Announces presence in `room_id`. The announcement is remembered and
    /// replayed whenever the connection is re-established.
    pub fn announce_join(&self, room_id: &str, local_id: &str) -> Result<(), SignalingError> {
        self.ensure_usable()?;
        let join = RoomJoin {
            room_id: room_id.to_string(),
            peer_id: local_id.to_string(),
        };
        self.commands
            .send(Command::Join(join))
            .map_err(|_| SignalingError::Disconnected)
    }

    pub fn send_chat_message(&self, message: ChatMessage) -> Result<(), SignalingError> {
        self.ensure_usable()?;
        if self.state() != ChannelState::Connected {
            return Err(SignalingError::NotConnected);
        }
        self.commands
            .send(Command::Send(ClientEvent::ChatMessage(message)))
            .map_err(|_| SignalingError::Disconnected)
    }

    /// Disconnects and stops all further delivery. Safe to call repeatedly.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        tracing::debug!(target = "huddle::signaling", "signaling channel destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_usable(&self) -> Result<(), SignalingError> {
        if self.is_destroyed() {
            return Err(SignalingError::Destroyed);
        }
        if self.state() == ChannelState::Disconnected {
            return Err(SignalingError::Disconnected);
        }
        Ok(())
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

enum LinkEnd {
    Lost,
    Shutdown,
}

struct Supervisor {
    connector: Arc<dyn SignalingConnector>,
    url: String,
    policy: BackoffPolicy,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    state: watch::Sender<ChannelState>,
    join: Option<RoomJoin>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        let mut first = true;
        loop {
            if !first {
                let Some(delay) = self.policy.delay_for(attempt) else {
                    tracing::warn!(
                        target = "huddle::signaling",
                        url = %self.url,
                        attempts = attempt,
                        "signaling reconnect attempts exhausted"
                    );
                    self.set_state(ChannelState::Disconnected);
                    return;
                };
                attempt += 1;
                self.set_state(ChannelState::Reconnecting { attempt });
                tracing::debug!(
                    target = "huddle::signaling",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling signaling reconnect"
                );
                if !self.idle_for(delay).await {
                    return;
                }
            }
            first = false;

            match self.connector.connect(&self.url).await {
                Ok(link) => {
                    attempt = 0;
                    self.set_state(ChannelState::Connected);
                    tracing::info!(target = "huddle::signaling", url = %self.url, "signaling connected");
                    match self.pump(link).await {
                        LinkEnd::Lost => {
                            tracing::warn!(target = "huddle::signaling", "signaling connection lost");
                        }
                        LinkEnd::Shutdown => return,
                    }
                }
                Err(err) => {
                    tracing::warn!(target = "huddle::signaling", error = %err, attempt, "signaling connect failed");
                }
            }
        }
    }

    /// Waits out a reconnect delay while still accepting commands. Returns
    /// `false` when the owning channel has gone away.
    async fn idle_for(&mut self, delay: std::time::Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Join(join)) => self.join = Some(join),
                    Some(Command::Send(event)) => {
                        tracing::debug!(target = "huddle::signaling", ?event, "dropping outbound event while offline");
                    }
                    None => return false,
                },
            }
        }
    }

    async fn pump(&mut self, mut link: SignalingLink) -> LinkEnd {
        if let Some(join) = self.join.clone() {
            if link.outbound.send(ClientEvent::JoinRoom(join)).is_err() {
                return LinkEnd::Lost;
            }
        }
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let event = match command {
                        Some(Command::Join(join)) => {
                            self.join = Some(join.clone());
                            ClientEvent::JoinRoom(join)
                        }
                        Some(Command::Send(event)) => event,
                        None => return LinkEnd::Shutdown,
                    };
                    if link.outbound.send(event).is_err() {
                        return LinkEnd::Lost;
                    }
                }
                inbound = link.inbound.recv() => {
                    let Some(event) = inbound else {
                        return LinkEnd::Lost;
                    };
                    tracing::trace!(target = "huddle::signaling", ?event, "signaling event");
                    let event = match event {
                        ServerEvent::UserConnected(peer) => SignalingEvent::PeerJoined(peer),
                        ServerEvent::UserDisconnected(peer) => SignalingEvent::PeerLeft(peer),
                        ServerEvent::ChatMessage(message) => SignalingEvent::Chat(message),
                    };
                    if self.events.send(event).is_err() {
                        return LinkEnd::Shutdown;
                    }
                }
            }
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
        let _ = self.events.send(SignalingEvent::State(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Hands out scripted links; `Err` entries refuse the connection.
    struct ScriptedConnector {
        script: Mutex<VecDeque<Result<SignalingLink, SignalingError>>>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                calls: std::sync::atomic::AtomicUsize::new(0),
            })
        }

        fn push_link(&self) -> (mpsc::UnboundedSender<ServerEvent>, mpsc::UnboundedReceiver<ClientEvent>) {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            self.script.lock().push_back(Ok(SignalingLink::new(out_tx, in_rx)));
            (in_tx, out_rx)
        }

        fn push_refusal(&self) {
            self.script
                .lock()
                .push_back(Err(SignalingError::Connect("refused".into())));
        }
    }

    #[async_trait]
    impl SignalingConnector for ScriptedConnector {
        async fn connect(&self, _url: &str) -> Result<SignalingLink, SignalingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(SignalingError::Connect("no more links".into())))
        }
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(5), 3)
    }

    async fn next_non_state(rx: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
        loop {
            match rx.recv().await.unwrap() {
                SignalingEvent::State(_) => continue,
                other => return other,
            }
        }
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn forwards_events_including_self_echo() {
        let connector = ScriptedConnector::new();
        let (server_tx, mut client_rx) = connector.push_link();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::connect(connector.clone(), "loopback://", policy(), events_tx);

        channel.announce_join("room", "me").unwrap();
        let sent = client_rx.recv().await.unwrap();
        assert_eq!(
            sent,
            ClientEvent::JoinRoom(RoomJoin {
                room_id: "room".into(),
                peer_id: "me".into()
            })
        );

        server_tx.send(ServerEvent::UserConnected(PeerRef::raw("me"))).unwrap();
        assert_eq!(next_non_state(&mut events_rx).await, SignalingEvent::PeerJoined(PeerRef::raw("me")));
        server_tx.send(ServerEvent::UserDisconnected(PeerRef::raw("bob"))).unwrap();
        assert_eq!(next_non_state(&mut events_rx).await, SignalingEvent::PeerLeft(PeerRef::raw("bob")));
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn replays_join_after_reconnect() {
        let connector = ScriptedConnector::new();
        let (server_tx, mut first_rx) = connector.push_link();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::connect(connector.clone(), "loopback://", policy(), events_tx);
        channel.announce_join("room", "me").unwrap();
        assert!(matches!(first_rx.recv().await, Some(ClientEvent::JoinRoom(_))));

        connector.push_refusal();
        let (_server_tx2, mut second_rx) = connector.push_link();
        drop(server_tx);

        let replayed = second_rx.recv().await.unwrap();
        assert!(matches!(replayed, ClientEvent::JoinRoom(join) if join.peer_id == "me"));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn gives_up_after_ceiling() {
        let connector = ScriptedConnector::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::connect(connector.clone(), "loopback://", policy(), events_tx);

        let mut states = Vec::new();
        while let Some(event) = events_rx.recv().await {
            if let SignalingEvent::State(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                ChannelState::Reconnecting { attempt: 1 },
                ChannelState::Reconnecting { attempt: 2 },
                ChannelState::Reconnecting { attempt: 3 },
                ChannelState::Disconnected,
            ]
        );
        assert_eq!(connector.calls.load(Ordering::SeqCst), 4);
        assert_eq!(channel.announce_join("room", "me"), Err(SignalingError::Disconnected));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn chat_requires_connection_and_destroy_is_idempotent() {
        let connector = ScriptedConnector::new();
        connector.push_refusal();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::connect(connector.clone(), "loopback://", policy(), events_tx);
        tokio::task::yield_now().await;

        let message = ChatMessage {
            text: "hi".into(),
            sender: "me".into(),
            timestamp: 0,
        };
        assert_eq!(channel.send_chat_message(message.clone()), Err(SignalingError::NotConnected));

        channel.destroy();
        channel.destroy();
        assert!(channel.is_destroyed());
        assert_eq!(channel.send_chat_message(message), Err(SignalingError::Destroyed));
    }
}
