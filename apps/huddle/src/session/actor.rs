use super::calls::instrument_call;
use super::participants::{ActiveCall, ConnectionAttempt, Direction, Participant, Participants};
use super::timers::Timers;
use super::{
    Command, ConnectOutcome, Controls, SessionConfig, SessionDeps, SessionError, SessionSnapshot, SessionState,
    SessionUpdate, SkipReason, VideoTile,
};
use crate::media::{MediaAcquirer, MediaError, MediaStream, TrackKind};
use crate::monitor::{ConnectionMonitor, ConnectionStatus, MetricsUpdate, Tracked};
use crate::peer::{CallEvent, FactoryEvent, MediaCall, PeerConnectionFactory, PeerError};
use crate::signaling::{ChannelState, SignalingChannel, SignalingEvent};
use huddle_proto::{ChatMessage, PeerRef};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Work the session schedules for itself.
pub(crate) enum Internal {
    /// The settle delay after a `peer-joined` notice elapsed.
    SettledJoin(String),
    /// Retry of a dial rejected as peer-unavailable.
    Dial { target: String, attempt: u32 },
    DialFinished {
        target: String,
        attempt: u32,
        result: Result<Arc<dyn MediaCall>, PeerError>,
    },
    Call {
        peer_id: String,
        call_id: String,
        event: CallEvent,
    },
    /// Re-dial after a call closed without a leave notice.
    Redial(String),
}

enum Input {
    Command(Command),
    Abandoned,
    Internal(Internal),
    Signaling(SignalingEvent),
    Factory(FactoryEvent),
    Metrics(MetricsUpdate),
}

enum Step<T> {
    Done(T),
    Command(Option<Command>),
}

pub(crate) struct SessionActor {
    config: SessionConfig,
    deps: SessionDeps,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<SessionState>,
    updates: broadcast::Sender<SessionUpdate>,
    state: SessionState,

    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    signaling_tx: mpsc::UnboundedSender<SignalingEvent>,
    signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>,
    factory_tx: mpsc::UnboundedSender<FactoryEvent>,
    factory_rx: mpsc::UnboundedReceiver<FactoryEvent>,
    metrics_rx: mpsc::UnboundedReceiver<MetricsUpdate>,

    local_id: Option<String>,
    local_stream: Option<MediaStream>,
    factory: Option<Arc<PeerConnectionFactory>>,
    signaling: Option<Arc<SignalingChannel>>,
    monitor: Arc<ConnectionMonitor>,

    participants: Participants,
    /// Calls currently held, keyed by call id.
    calls: HashMap<String, ActiveCall>,
    pending: HashMap<String, ConnectionAttempt>,
    settling: HashSet<String>,
    departed: HashSet<String>,
    answered: HashSet<String>,
    chat: VecDeque<ChatMessage>,
    controls: Controls,
    signaling_state: Option<ChannelState>,
    broker_connected: bool,

    timers: Timers,
    leave_requested: bool,
    leave_waiters: Vec<oneshot::Sender<()>>,
    torn_down: bool,
}

impl SessionActor {
    pub(crate) fn new(
        config: SessionConfig,
        deps: SessionDeps,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<SessionState>,
        updates: broadcast::Sender<SessionUpdate>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let (factory_tx, factory_rx) = mpsc::unbounded_channel();
        let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
        let monitor = ConnectionMonitor::start(config.monitor, metrics_tx);
        let controls = Controls {
            muted: config.start_muted,
            video_on: config.start_video,
            recording: false,
        };
        Self {
            config,
            deps,
            commands,
            state_tx,
            updates,
            state: SessionState::Idle,
            internal_tx,
            internal_rx,
            signaling_tx,
            signaling_rx,
            factory_tx,
            factory_rx,
            metrics_rx,
            local_id: None,
            local_stream: None,
            factory: None,
            signaling: None,
            monitor,
            participants: Participants::default(),
            calls: HashMap::new(),
            pending: HashMap::new(),
            settling: HashSet::new(),
            departed: HashSet::new(),
            answered: HashSet::new(),
            chat: VecDeque::new(),
            controls,
            signaling_state: None,
            broker_connected: false,
            timers: Timers::default(),
            leave_requested: false,
            leave_waiters: Vec::new(),
            torn_down: false,
        }
    }

    pub(crate) async fn run(mut self) {
        match self.start_up().await {
            Ok(()) if self.leave_requested => self.leave(),
            Ok(()) => {
                self.transition(SessionState::Active);
                self.event_loop().await;
            }
            Err(err) => self.fail(err),
        }
        self.serve_finished().await;
    }

    /// Returns early with `Ok(())` once a leave is requested; `run` then
    /// tears down whatever was installed so far.
    async fn start_up(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::AcquiringMedia);
        let acquirer = MediaAcquirer::new(Arc::clone(&self.deps.devices), self.deps.profile.clone());
        let constraints = self.config.constraints.clone();
        let Some(acquired) = self
            .until_done(async move { acquirer.acquire(constraints).await })
            .await
        else {
            return Ok(());
        };
        let stream = acquired?;
        self.install_local_stream(stream.clone());

        self.transition(SessionState::EstablishingIdentity);
        let transport = Arc::clone(&self.deps.transport);
        let primary = self.config.primary.clone();
        let fallback = self.config.fallback.clone();
        let factory_config = self.config.factory;
        let events = self.factory_tx.clone();
        let Some(built) = self
            .until_done(async move {
                PeerConnectionFactory::build(transport, &primary, fallback.as_ref(), factory_config, events).await
            })
            .await
        else {
            return Ok(());
        };
        let factory = built?;
        let local_id = factory.local_id().to_string();
        self.factory = Some(factory);
        self.broker_connected = true;
        self.local_id = Some(local_id.clone());
        self.participants.upsert(Participant::local(&local_id, stream.clone()));
        self.monitor.track(&local_id, Tracked::Local(stream));

        self.transition(SessionState::JoiningRoom);
        let channel = SignalingChannel::connect(
            Arc::clone(&self.deps.signaling),
            self.config.signaling_url.clone(),
            self.config.signaling_backoff,
            self.signaling_tx.clone(),
        );
        self.signaling = Some(Arc::clone(&channel));
        channel.announce_join(&self.config.room_id, &local_id)?;
        Ok(())
    }

    /// Drives `work` while still answering commands. A leave request, or every
    /// handle going away, drops `work` where it stands and yields `None`.
    /// Startup steps only hand resources back on completion, so nothing is
    /// left half-acquired.
    async fn until_done<F: Future>(&mut self, work: F) -> Option<F::Output> {
        tokio::pin!(work);
        loop {
            let step = tokio::select! {
                output = &mut work => Step::Done(output),
                command = self.commands.recv() => Step::Command(command),
            };
            match step {
                Step::Done(output) => return Some(output),
                Step::Command(Some(Command::Leave(reply))) => {
                    tracing::info!(
                        target = "huddle::session",
                        room_id = %self.config.room_id,
                        state = %self.state,
                        "leave requested during startup; abandoning in-flight step"
                    );
                    self.leave_waiters.push(reply);
                    self.leave_requested = true;
                    return None;
                }
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Command(None) => {
                    self.leave_requested = true;
                    return None;
                }
            }
        }
    }

    async fn event_loop(&mut self) {
        while !self.state.is_finished() {
            let input = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Input::Command(command),
                    None => Input::Abandoned,
                },
                Some(internal) = self.internal_rx.recv() => Input::Internal(internal),
                Some(event) = self.signaling_rx.recv() => Input::Signaling(event),
                Some(event) = self.factory_rx.recv() => Input::Factory(event),
                Some(update) = self.metrics_rx.recv() => Input::Metrics(update),
            };
            match input {
                Input::Command(command) => self.handle_command(command).await,
                Input::Abandoned => {
                    tracing::info!(target = "huddle::session", "all session handles dropped; leaving call");
                    self.leave();
                }
                Input::Internal(internal) => self.handle_internal(internal).await,
                Input::Signaling(event) => self.handle_signaling(event),
                Input::Factory(event) => self.handle_factory(event).await,
                Input::Metrics(update) => self.handle_metrics(update),
            }
        }
    }

    /// Keeps answering queries after the session ended until every handle is gone.
    async fn serve_finished(&mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle_command(command).await;
        }
    }

    fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        tracing::info!(
            target = "huddle::session",
            room_id = %self.config.room_id,
            local_id = self.local_id.as_deref().unwrap_or("-"),
            from = %self.state,
            to = %next,
            "session state changed"
        );
        self.state = next.clone();
        self.state_tx.send_replace(next.clone());
        let _ = self.updates.send(SessionUpdate::State(next));
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Connect(peer_id, reply) => {
                let outcome = self.connect_to_new_user(&peer_id).await;
                let _ = reply.send(outcome);
            }
            Command::ToggleMute(reply) => {
                let _ = reply.send(self.toggle(TrackKind::Audio));
            }
            Command::ToggleVideo(reply) => {
                let _ = reply.send(self.toggle(TrackKind::Video));
            }
            Command::ToggleRecording(reply) => {
                self.controls.recording = !self.controls.recording;
                self.emit(SessionUpdate::Controls(self.controls));
                let _ = reply.send(self.controls);
            }
            Command::SendChat(text, reply) => {
                let _ = reply.send(self.send_chat(&text));
            }
            Command::Leave(reply) => {
                self.leave_waiters.push(reply);
                self.leave();
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::SettledJoin(peer_id) => {
                self.settling.remove(&peer_id);
                self.dial_known_peer(&peer_id, "peer joined").await;
            }
            Internal::Redial(peer_id) => self.dial_known_peer(&peer_id, "call dropped").await,
            Internal::Dial { target, attempt } => self.retry_dial(target, attempt),
            Internal::DialFinished { target, attempt, result } => self.on_dial_finished(target, attempt, result),
            Internal::Call { peer_id, call_id, event } => self.handle_call_event(peer_id, call_id, event),
        }
    }

    fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::PeerJoined(peer) => self.on_peer_joined(&peer),
            SignalingEvent::PeerLeft(peer) => self.on_peer_left(&peer),
            SignalingEvent::Chat(message) => {
                self.push_chat(message.clone());
                self.emit(SessionUpdate::Chat(message));
            }
            SignalingEvent::State(state) => {
                if state == ChannelState::Disconnected {
                    tracing::warn!(
                        target = "huddle::session",
                        room_id = %self.config.room_id,
                        "signaling gave up; established calls continue without room updates"
                    );
                }
                self.signaling_state = Some(state);
                self.emit(SessionUpdate::Signaling(state));
            }
        }
    }

    async fn handle_factory(&mut self, event: FactoryEvent) {
        match event {
            FactoryEvent::IncomingCall(call) => self.on_incoming_call(call).await,
            FactoryEvent::ConnectionLost => {
                tracing::warn!(target = "huddle::session", "broker connection lost; reconnecting");
                self.broker_connected = false;
                self.emit(SessionUpdate::Broker { connected: false });
            }
            FactoryEvent::Reconnected => {
                tracing::info!(target = "huddle::session", "broker connection restored");
                self.broker_connected = true;
                self.emit(SessionUpdate::Broker { connected: true });
            }
            FactoryEvent::CallFailed { remote_id, error } => {
                tracing::debug!(target = "huddle::session", peer_id = %remote_id, %error, "broker rejected call");
            }
            FactoryEvent::Fatal(error) => {
                tracing::error!(target = "huddle::session", %error, "broker connection failed permanently");
                self.fail(SessionError::Peer(error));
            }
        }
    }

    fn handle_metrics(&mut self, update: MetricsUpdate) {
        let Some(participant) = self.participants.get_mut(&update.peer_id) else {
            return;
        };
        if !participant.is_self {
            participant.status = update.metrics.status;
        }
        participant.metrics = Some(update.metrics.clone());
        self.emit(SessionUpdate::Metrics(update));
    }

    fn on_peer_joined(&mut self, peer: &PeerRef) {
        let Some(peer_id) = peer.normalize() else {
            tracing::warn!(target = "huddle::session", raw = %peer, "ignoring peer-joined without a usable id");
            return;
        };
        self.departed.remove(&peer_id);
        if self.local_id.as_deref() == Some(peer_id.as_str()) {
            tracing::debug!(target = "huddle::session", peer_id = %peer_id, "ignoring echo of own join");
            return;
        }
        if self.participants.contains(&peer_id) || self.pending.contains_key(&peer_id) {
            tracing::debug!(target = "huddle::session", peer_id = %peer_id, "ignoring join for known peer");
            return;
        }
        if !self.settling.insert(peer_id.clone()) {
            tracing::debug!(target = "huddle::session", peer_id = %peer_id, "join already scheduled");
            return;
        }
        tracing::info!(target = "huddle::session", peer_id = %peer_id, "peer joined room");
        self.timers.schedule(
            self.config.join_settle_delay,
            &self.internal_tx,
            Internal::SettledJoin(peer_id),
        );
    }

    fn on_peer_left(&mut self, peer: &PeerRef) {
        let Some(peer_id) = peer.normalize() else {
            tracing::warn!(target = "huddle::session", raw = %peer, "ignoring peer-left without a usable id");
            return;
        };
        if self.local_id.as_deref() == Some(peer_id.as_str()) {
            return;
        }
        tracing::info!(target = "huddle::session", peer_id = %peer_id, "peer left room");
        self.departed.insert(peer_id.clone());
        self.settling.remove(&peer_id);
        self.pending.remove(&peer_id);
        let stale: Vec<String> = self
            .calls
            .iter()
            .filter(|(_, active)| active.peer_id == peer_id)
            .map(|(call_id, _)| call_id.clone())
            .collect();
        for call_id in stale {
            if let Some(active) = self.calls.remove(&call_id) {
                active.call.close();
            }
        }
        self.remove_participant(&peer_id);
    }

    async fn dial_known_peer(&mut self, peer_id: &str, reason: &str) {
        if self.departed.contains(peer_id) {
            tracing::debug!(target = "huddle::session", peer_id, reason, "peer already left; not dialing");
            return;
        }
        match self.connect_to_new_user(peer_id).await {
            ConnectOutcome::Dialing => {}
            ConnectOutcome::Skipped(skip) => {
                tracing::debug!(target = "huddle::session", peer_id, reason, ?skip, "dial skipped");
            }
        }
    }

    async fn connect_to_new_user(&mut self, peer_id: &str) -> ConnectOutcome {
        let peer_id = peer_id.trim();
        let skip = if !self.is_active() {
            Some(SkipReason::Inactive)
        } else if peer_id.is_empty() {
            Some(SkipReason::EmptyId)
        } else if self.local_id.as_deref() == Some(peer_id) {
            Some(SkipReason::OwnId)
        } else if self.participants.contains(peer_id) {
            Some(SkipReason::AlreadyConnected)
        } else if self.pending.contains_key(peer_id) {
            Some(SkipReason::AlreadyPending)
        } else if !self.factory.as_ref().is_some_and(|factory| factory.is_ready()) {
            Some(SkipReason::NotReady)
        } else if self.local_stream.is_none() {
            Some(SkipReason::NoLocalMedia)
        } else {
            None
        };
        if let Some(reason) = skip {
            return ConnectOutcome::Skipped(reason);
        }

        let stream_active = self.local_stream.as_ref().is_some_and(MediaStream::is_active);
        if !stream_active && !self.refresh_local_stream().await {
            return ConnectOutcome::Skipped(SkipReason::NoLocalMedia);
        }
        self.dial(peer_id.to_string(), 0);
        ConnectOutcome::Dialing
    }

    fn dial(&mut self, target: String, attempt: u32) {
        let (Some(factory), Some(stream)) = (self.factory.clone(), self.local_stream.clone()) else {
            self.pending.remove(&target);
            return;
        };
        tracing::info!(target = "huddle::session", peer_id = %target, attempt, "calling peer");
        self.pending.insert(
            target.clone(),
            ConnectionAttempt {
                attempt,
                max_retries: self.config.unavailable_retry.max_attempts,
                call_id: None,
            },
        );
        let internal = self.internal_tx.clone();
        self.timers.spawn(async move {
            let result = factory.call(&target, &stream).await;
            let _ = internal.send(Internal::DialFinished { target, attempt, result });
        });
    }

    fn retry_dial(&mut self, target: String, attempt: u32) {
        let still_wanted = self.is_active()
            && self
                .pending
                .get(&target)
                .is_some_and(|pending| pending.attempt + 1 == attempt)
            && !self.departed.contains(&target)
            && !self.participants.contains(&target);
        let stream_active = self.local_stream.as_ref().is_some_and(MediaStream::is_active);
        if !still_wanted || !stream_active {
            tracing::debug!(target = "huddle::session", peer_id = %target, attempt, "retry no longer needed");
            self.pending.remove(&target);
            return;
        }
        self.dial(target, attempt);
    }

    fn on_dial_finished(&mut self, target: String, attempt: u32, result: Result<Arc<dyn MediaCall>, PeerError>) {
        match result {
            Ok(call) => {
                let active = self.is_active();
                let Some(pending) = self.pending.get_mut(&target).filter(|_| active) else {
                    tracing::debug!(target = "huddle::session", peer_id = %target, "dial completed after it was abandoned");
                    call.close();
                    return;
                };
                pending.call_id = Some(call.call_id().to_string());
                self.adopt_call(call, &target, Direction::Outbound);
            }
            Err(PeerError::PeerUnavailable(reason)) if self.pending.contains_key(&target) => {
                match self.config.unavailable_retry.delay_for(attempt) {
                    Some(delay) => {
                        tracing::info!(
                            target = "huddle::session",
                            peer_id = %target,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            %reason,
                            "peer unavailable; retrying"
                        );
                        self.timers.schedule(
                            delay,
                            &self.internal_tx,
                            Internal::Dial {
                                target,
                                attempt: attempt + 1,
                            },
                        );
                    }
                    None => {
                        let retries = self.pending.remove(&target).map_or(0, |pending| pending.max_retries);
                        tracing::warn!(target = "huddle::session", peer_id = %target, retries, "peer still unavailable; giving up");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(target = "huddle::session", peer_id = %target, %error, "call failed");
                self.pending.remove(&target);
            }
        }
    }

    fn adopt_call(&mut self, call: Arc<dyn MediaCall>, peer_id: &str, direction: Direction) {
        if let Some(handle) = instrument_call(&call, peer_id, &self.internal_tx) {
            self.timers.track(handle);
        }
        self.calls.insert(
            call.call_id().to_string(),
            ActiveCall {
                peer_id: peer_id.to_string(),
                call,
                direction,
            },
        );
    }

    async fn on_incoming_call(&mut self, call: Arc<dyn MediaCall>) {
        let call_id = call.call_id().to_string();
        if !self.answered.insert(call_id.clone()) {
            tracing::debug!(target = "huddle::session", call_id = %call_id, "duplicate incoming call ignored");
            return;
        }
        let peer_id = call.remote_id().trim().to_string();
        let stream = self.local_stream.clone().filter(MediaStream::is_active);
        let Some(stream) = stream.filter(|_| self.is_active() && !peer_id.is_empty()) else {
            tracing::warn!(
                target = "huddle::session",
                call_id = %call_id,
                peer_id = %peer_id,
                "rejecting incoming call without an active local stream"
            );
            call.close();
            return;
        };
        self.departed.remove(&peer_id);
        tracing::info!(target = "huddle::session", call_id = %call_id, peer_id = %peer_id, "answering incoming call");
        self.adopt_call(Arc::clone(&call), &peer_id, Direction::Inbound);
        if let Err(error) = call.answer(&stream).await {
            tracing::warn!(target = "huddle::session", call_id = %call_id, peer_id = %peer_id, %error, "answer failed");
            self.calls.remove(&call_id);
            call.close();
        }
    }

    fn handle_call_event(&mut self, peer_id: String, call_id: String, event: CallEvent) {
        match event {
            CallEvent::Stream(stream) => self.on_remote_stream(peer_id, call_id, stream),
            CallEvent::IceState(ice) => {
                let current = self.participants.get_mut(&peer_id);
                if let Some(participant) = current.filter(|p| p.call_id() == Some(call_id.as_str())) {
                    participant.status = ConnectionStatus::from(ice);
                }
            }
            CallEvent::Closed => self.on_call_closed(&peer_id, &call_id),
            CallEvent::Error(error) => {
                tracing::warn!(target = "huddle::session", peer_id = %peer_id, call_id = %call_id, %error, "call error");
                self.on_call_closed(&peer_id, &call_id);
            }
        }
    }

    fn on_remote_stream(&mut self, peer_id: String, call_id: String, stream: MediaStream) {
        let Some(active) = self.calls.get(&call_id) else {
            tracing::debug!(target = "huddle::session", call_id = %call_id, "stream for a call no longer held");
            return;
        };
        let call = Arc::clone(&active.call);
        let local_id = self.local_id.clone().unwrap_or_default();
        let new_caller = active.caller(&local_id).to_string();
        self.pending.remove(&peer_id);

        if let Some(existing) = self.participants.get_mut(&peer_id) {
            if existing.call_id() == Some(call_id.as_str()) {
                tracing::debug!(target = "huddle::session", peer_id = %peer_id, call_id = %call_id, "remote stream replaced");
                existing.stream = Some(stream);
                self.monitor.track(&peer_id, Tracked::Remote(call));
                self.monitor.refresh_all();
                return;
            }
            // Both ends dialed each other: keep the call placed by the lower id.
            let current_id = existing.call_id().map(str::to_string);
            let current = current_id.as_ref().and_then(|id| self.calls.get(id));
            let keep_new = current.is_none_or(|current| new_caller.as_str() <= current.caller(&local_id));
            if !keep_new {
                tracing::debug!(target = "huddle::session", peer_id = %peer_id, call_id = %call_id, "dropping duplicate call");
                self.calls.remove(&call_id);
                call.close();
                return;
            }
            if let Some(replaced) = current_id.and_then(|id| self.calls.remove(&id)) {
                tracing::debug!(target = "huddle::session", peer_id = %peer_id, call_id = replaced.call.call_id(), "replacing call");
                replaced.call.close();
            }
        }

        let joined = self
            .participants
            .upsert(Participant::remote(&peer_id, Arc::clone(&call), stream))
            .is_none();
        self.monitor.track(&peer_id, Tracked::Remote(call));
        if joined {
            let count = self.participants.len();
            tracing::info!(target = "huddle::session", peer_id = %peer_id, count, "participant connected");
            self.emit(SessionUpdate::ParticipantJoined { peer_id, count });
        }
        self.monitor.refresh_all();
    }

    fn on_call_closed(&mut self, peer_id: &str, call_id: &str) {
        let Some(active) = self.calls.remove(call_id) else {
            return;
        };
        active.call.close();
        if self
            .pending
            .get(peer_id)
            .is_some_and(|attempt| attempt.call_id.as_deref() == Some(call_id))
        {
            self.pending.remove(peer_id);
        }
        let was_current = self
            .participants
            .get(peer_id)
            .is_some_and(|participant| participant.call_id() == Some(call_id));
        if !was_current {
            return;
        }
        self.remove_participant(peer_id);

        let lower_id = self.local_id.as_deref().is_some_and(|local| local < peer_id);
        if self.is_active() && lower_id && !self.departed.contains(peer_id) {
            tracing::info!(
                target = "huddle::session",
                peer_id,
                delay_ms = self.config.rejoin_delay.as_millis() as u64,
                "call dropped without leave notice; scheduling redial"
            );
            self.timers.schedule(
                self.config.rejoin_delay,
                &self.internal_tx,
                Internal::Redial(peer_id.to_string()),
            );
        }
    }

    fn remove_participant(&mut self, peer_id: &str) {
        if self.local_id.as_deref() == Some(peer_id) {
            return;
        }
        if self.participants.remove(peer_id).is_none() {
            return;
        }
        self.monitor.untrack(peer_id);
        let count = self.participants.len();
        tracing::info!(target = "huddle::session", peer_id, count, "participant removed");
        self.emit(SessionUpdate::ParticipantLeft {
            peer_id: peer_id.to_string(),
            count,
        });
    }

    fn install_local_stream(&mut self, stream: MediaStream) {
        stream.set_enabled(TrackKind::Audio, !self.controls.muted);
        stream.set_enabled(TrackKind::Video, self.controls.video_on);
        self.local_stream = Some(stream);
    }

    /// Re-acquires local media after the capture ended, swapping it into the
    /// self entry.
    async fn refresh_local_stream(&mut self) -> bool {
        tracing::info!(target = "huddle::session", "local stream inactive; re-acquiring media");
        let acquirer = MediaAcquirer::new(Arc::clone(&self.deps.devices), self.deps.profile.clone());
        let stream = match acquirer.acquire(self.config.constraints.clone()).await {
            Ok(stream) => stream,
            Err(MediaError { kind, .. }) => {
                tracing::warn!(target = "huddle::session", kind = kind.as_str(), "could not refresh local media");
                return false;
            }
        };
        if !self.is_active() {
            stream.stop_all();
            return false;
        }
        let previous = self.local_stream.take();
        self.install_local_stream(stream.clone());
        if let Some(local_id) = self.local_id.clone() {
            if let Some(local) = self.participants.get_mut(&local_id) {
                local.stream = Some(stream.clone());
            }
            self.monitor.track(&local_id, Tracked::Local(stream));
        }
        if let Some(previous) = previous {
            previous.stop_all();
        }
        true
    }

    fn toggle(&mut self, kind: TrackKind) -> Controls {
        let enable = match kind {
            TrackKind::Audio => self.controls.muted,
            TrackKind::Video => !self.controls.video_on,
        };
        let actual = match &self.local_stream {
            Some(stream) => {
                stream.set_enabled(kind, enable);
                stream.all_enabled(kind).unwrap_or(enable)
            }
            None => enable,
        };
        match kind {
            TrackKind::Audio => self.controls.muted = !actual,
            TrackKind::Video => self.controls.video_on = actual,
        }
        tracing::debug!(target = "huddle::session", ?kind, enabled = actual, "toggled local track");
        self.emit(SessionUpdate::Controls(self.controls));
        self.controls
    }

    fn send_chat(&mut self, text: &str) -> Result<ChatMessage, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let (Some(local_id), Some(signaling)) = (self.local_id.clone(), self.signaling.clone()) else {
            return Err(SessionError::NotActive);
        };
        if !self.is_active() {
            return Err(SessionError::NotActive);
        }
        let message = ChatMessage {
            text: text.to_string(),
            sender: local_id,
            timestamp: unix_millis(),
        };
        signaling.send_chat_message(message.clone())?;
        self.push_chat(message.clone());
        self.emit(SessionUpdate::Chat(message.clone()));
        Ok(message)
    }

    fn push_chat(&mut self, message: ChatMessage) {
        if self.config.chat_history == 0 {
            return;
        }
        while self.chat.len() >= self.config.chat_history {
            self.chat.pop_front();
        }
        self.chat.push_back(message);
    }

    fn snapshot(&self) -> SessionSnapshot {
        let tiles = self
            .participants
            .ordered()
            .into_iter()
            .map(|participant| {
                let metrics = participant.metrics.as_ref();
                VideoTile {
                    element_id: format!("video-{}", participant.peer_id),
                    peer_id: participant.peer_id.clone(),
                    label: if participant.is_self {
                        "You".to_string()
                    } else {
                        participant.peer_id.chars().take(8).collect()
                    },
                    is_self: participant.is_self,
                    status: participant.status,
                    connected_for: participant.connected_at.elapsed(),
                    ping: metrics.and_then(|m| m.ping_ms).map(|ms| format!("{ms} ms")),
                    rate: metrics
                        .and_then(|m| m.bitrate_kbps)
                        .map(|kbps| format!("{kbps:.1} kbps")),
                    resolution: metrics
                        .and_then(|m| m.resolution)
                        .map(|(width, height)| format!("{width}x{height}")),
                    fps: metrics.and_then(|m| m.fps).map(|fps| format!("{fps:.0} fps")),
                }
            })
            .collect();
        SessionSnapshot {
            state: self.state.clone(),
            room_id: self.config.room_id.clone(),
            local_id: self.local_id.clone(),
            controls: self.controls,
            signaling: self.signaling_state,
            broker_connected: self.broker_connected && !self.torn_down,
            participant_count: self.participants.len(),
            tiles,
            chat: self.chat.iter().cloned().collect(),
        }
    }

    fn leave(&mut self) {
        if !self.state.is_finished() {
            self.transition(SessionState::Leaving);
            self.teardown();
            self.transition(SessionState::Terminated);
        }
        for waiter in self.leave_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn fail(&mut self, error: SessionError) {
        tracing::error!(target = "huddle::session", room_id = %self.config.room_id, %error, "session failed");
        self.teardown();
        self.transition(SessionState::Failed(error));
        for waiter in self.leave_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Releases media, calls, signaling, the broker, the monitor and every
    /// timer, in that order. Idempotent.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        let stopped = self.local_stream.take().map_or(0, |stream| stream.stop_all());
        let closed = self.calls.len();
        for (_, active) in self.calls.drain() {
            active.call.close();
        }
        self.participants.drain().for_each(drop);
        self.pending.clear();
        self.settling.clear();
        if let Some(signaling) = self.signaling.take() {
            signaling.destroy();
        }
        if let Some(factory) = self.factory.take() {
            factory.destroy();
        }
        self.monitor.stop();
        let cancelled = self.timers.cancel_all();
        tracing::info!(
            target = "huddle::session",
            room_id = %self.config.room_id,
            stopped_tracks = stopped,
            closed_calls = closed,
            cancelled_tasks = cancelled,
            "session resources released"
        );
    }
}

impl Drop for SessionActor {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
