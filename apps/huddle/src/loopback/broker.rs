use super::{Inner, LoopbackConfig};
use crate::media::{MediaStream, MediaTrack};
use crate::peer::{
    CallEvent, EndpointConfig, LinkEvent, MediaCall, PeerError, PeerLink, PeerTransport,
    TransportStats,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

/// Peer broker living inside the process.
pub struct LoopbackBroker {
    inner: Arc<Inner>,
}

impl LoopbackBroker {
    pub(super) fn new(inner: Arc<Inner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl PeerTransport for LoopbackBroker {
    async fn open(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn PeerLink>, PeerError> {
        if self.inner.hanging_hosts.lock().contains(&endpoint.host) {
            return std::future::pending().await;
        }
        if self.inner.unreachable_hosts.lock().contains(&endpoint.host) {
            return Err(PeerError::Network(format!("{endpoint} unreachable")));
        }

        let id = self
            .inner
            .assigned_ids
            .lock()
            .pop_front()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..12].to_string());
        let state = Arc::new(LinkState::new(id.clone()));
        {
            let mut links = self.inner.links.lock();
            if links.get(&id).is_some_and(|existing| existing.is_open()) {
                return Err(PeerError::Protocol(format!("id {id} is taken")));
            }
            links.insert(id.clone(), Arc::clone(&state));
        }
        self.inner.links_opened.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(target = "huddle::loopback", peer_id = %id, endpoint = %endpoint, "broker link opened");
        Ok(Arc::new(LoopbackLink {
            state,
            inner: Arc::clone(&self.inner),
        }))
    }
}

pub(super) struct LinkState {
    pub id: String,
    open: AtomicBool,
    destroyed: AtomicBool,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    calls: Mutex<Vec<Weak<CallPair>>>,
}

impl LinkState {
    fn new(id: String) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id,
            open: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.destroyed.load(Ordering::SeqCst)
    }

    pub fn disconnect(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events_tx.send(LinkEvent::Disconnected);
        }
    }

    pub fn close_calls(&self) -> usize {
        let pairs: Vec<Arc<CallPair>> = self
            .calls
            .lock()
            .drain(..)
            .filter_map(|pair| pair.upgrade())
            .collect();
        pairs.iter().filter(|pair| pair.close()).count()
    }

    pub fn renegotiate_calls(&self) -> usize {
        let pairs: Vec<Arc<CallPair>> = self.calls.lock().iter().filter_map(Weak::upgrade).collect();
        pairs.iter().filter(|pair| pair.renegotiate()).count()
    }

    fn remember(&self, pair: &Arc<CallPair>) {
        let mut calls = self.calls.lock();
        calls.retain(|existing| existing.strong_count() > 0);
        calls.push(Arc::downgrade(pair));
    }
}

pub struct LoopbackLink {
    state: Arc<LinkState>,
    inner: Arc<Inner>,
}

#[async_trait]
impl PeerLink for LoopbackLink {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.state.events_rx.lock().take()
    }

    async fn reconnect(&self) -> Result<(), PeerError> {
        if self.state.destroyed.load(Ordering::SeqCst) {
            return Err(PeerError::Destroyed);
        }
        if self.inner.refuse_reconnect.load(Ordering::SeqCst) {
            return Err(PeerError::Network("broker unreachable".into()));
        }
        self.state.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn call(&self, remote_id: &str, stream: &MediaStream) -> Result<Arc<dyn MediaCall>, PeerError> {
        self.inner.calls_placed.fetch_add(1, Ordering::SeqCst);
        if self.state.destroyed.load(Ordering::SeqCst) {
            return Err(PeerError::Destroyed);
        }
        if !self.state.is_open() {
            return Err(PeerError::Disconnected);
        }
        {
            let mut unavailable = self.inner.unavailable.lock();
            if let Some(remaining) = unavailable.get_mut(remote_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(PeerError::PeerUnavailable(remote_id.to_string()));
                }
            }
        }
        let Some(remote) = self
            .inner
            .links
            .lock()
            .get(remote_id)
            .filter(|link| link.is_open())
            .cloned()
        else {
            return Err(PeerError::PeerUnavailable(remote_id.to_string()));
        };

        let config = self.inner.config.lock().clone();
        let (pair, caller_rx, callee_rx) = CallPair::new(
            self.state.id.clone(),
            remote_id.to_string(),
            stream.clone(),
            config.clone(),
            Arc::clone(&self.inner),
        );
        self.state.remember(&pair);
        remote.remember(&pair);

        let caller: Arc<LoopbackCall> = Arc::new(LoopbackCall::new(Arc::clone(&pair), Side::Caller, caller_rx));
        let callee: Arc<LoopbackCall> = Arc::new(LoopbackCall::new(Arc::clone(&pair), Side::Callee, callee_rx));
        let _ = pair
            .caller_tx
            .send(CallEvent::IceState(RTCIceConnectionState::Checking));

        let deliveries = if config.duplicate_incoming_calls { 2 } else { 1 };
        for _ in 0..deliveries {
            let _ = remote
                .events_tx
                .send(LinkEvent::IncomingCall(Arc::clone(&callee) as Arc<dyn MediaCall>));
        }
        tracing::trace!(target = "huddle::loopback", call_id = %pair.id, from = %self.state.id, to = %remote_id, "call placed");
        Ok(caller)
    }

    fn destroy(&self) {
        if self.state.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.open.store(false, Ordering::SeqCst);
        {
            let mut links = self.inner.links.lock();
            if links
                .get(&self.state.id)
                .is_some_and(|existing| Arc::ptr_eq(existing, &self.state))
            {
                links.remove(&self.state.id);
            }
        }
        self.state.close_calls();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Caller,
    Callee,
}

pub(super) struct CallPair {
    id: String,
    caller_id: String,
    callee_id: String,
    caller_stream: MediaStream,
    callee_stream: Mutex<Option<MediaStream>>,
    mirrors: Mutex<Vec<MediaStream>>,
    answered_at: Mutex<Option<Instant>>,
    closed: AtomicBool,
    caller_tx: mpsc::UnboundedSender<CallEvent>,
    callee_tx: mpsc::UnboundedSender<CallEvent>,
    config: LoopbackConfig,
    inner: Arc<Inner>,
}

type CallReceivers = (
    Arc<CallPair>,
    mpsc::UnboundedReceiver<CallEvent>,
    mpsc::UnboundedReceiver<CallEvent>,
);

impl CallPair {
    fn new(
        caller_id: String,
        callee_id: String,
        caller_stream: MediaStream,
        config: LoopbackConfig,
        inner: Arc<Inner>,
    ) -> CallReceivers {
        let (caller_tx, caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, callee_rx) = mpsc::unbounded_channel();
        let pair = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            caller_id,
            callee_id,
            caller_stream,
            callee_stream: Mutex::new(None),
            mirrors: Mutex::new(Vec::new()),
            answered_at: Mutex::new(None),
            closed: AtomicBool::new(false),
            caller_tx,
            callee_tx,
            config,
            inner,
        });
        (pair, caller_rx, callee_rx)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns `true` for the call that actually closed the pair.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        for mirror in self.mirrors.lock().drain(..) {
            mirror.stop_all();
        }
        let _ = self.caller_tx.send(CallEvent::Closed);
        let _ = self.callee_tx.send(CallEvent::Closed);
        tracing::trace!(target = "huddle::loopback", call_id = %self.id, "call closed");
        true
    }

    /// Hands both ends a fresh copy of the other side's media, as a track
    /// renegotiation would.
    fn renegotiate(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let Some(callee_stream) = self.callee_stream.lock().clone() else {
            return false;
        };
        let _ = self.callee_tx.send(CallEvent::Stream(self.mirror(&self.caller_stream)));
        let _ = self.caller_tx.send(CallEvent::Stream(self.mirror(&callee_stream)));
        tracing::trace!(target = "huddle::loopback", call_id = %self.id, "call renegotiated");
        true
    }

    fn mirror(&self, source: &MediaStream) -> MediaStream {
        let mirrored = MediaStream::new(
            source
                .tracks()
                .iter()
                .map(|track| MediaTrack::remote(track.kind(), track.settings()))
                .collect(),
        );
        self.mirrors.lock().push(mirrored.clone());
        mirrored
    }

    fn jittered_rtt(&self) -> Duration {
        let jitter_ms = self.config.rtt_jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.rtt + Duration::from_millis(extra)
    }
}

pub struct LoopbackCall {
    pair: Arc<CallPair>,
    side: Side,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<CallEvent>>>,
}

impl LoopbackCall {
    fn new(pair: Arc<CallPair>, side: Side, events_rx: mpsc::UnboundedReceiver<CallEvent>) -> Self {
        Self {
            pair,
            side,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn remote_stream(&self) -> Option<MediaStream> {
        match self.side {
            Side::Caller => self.pair.callee_stream.lock().clone(),
            Side::Callee => Some(self.pair.caller_stream.clone()),
        }
    }
}

#[async_trait]
impl MediaCall for LoopbackCall {
    fn call_id(&self) -> &str {
        &self.pair.id
    }

    fn remote_id(&self) -> &str {
        match self.side {
            Side::Caller => &self.pair.callee_id,
            Side::Callee => &self.pair.caller_id,
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CallEvent>> {
        self.events_rx.lock().take()
    }

    async fn answer(&self, stream: &MediaStream) -> Result<(), PeerError> {
        self.pair.inner.answers.fetch_add(1, Ordering::SeqCst);
        if self.side == Side::Caller {
            return Err(PeerError::Protocol("only the callee can answer".into()));
        }
        if self.pair.is_closed() {
            return Err(PeerError::Other("call already closed".into()));
        }
        {
            let mut answered_at = self.pair.answered_at.lock();
            if answered_at.is_some() {
                return Ok(());
            }
            *answered_at = Some(Instant::now());
        }
        *self.pair.callee_stream.lock() = Some(stream.clone());

        let for_callee = self.pair.mirror(&self.pair.caller_stream);
        let for_caller = self.pair.mirror(stream);
        let _ = self.pair.callee_tx.send(CallEvent::Stream(for_callee));
        let _ = self
            .pair
            .callee_tx
            .send(CallEvent::IceState(RTCIceConnectionState::Connected));
        let _ = self.pair.caller_tx.send(CallEvent::Stream(for_caller));
        let _ = self
            .pair
            .caller_tx
            .send(CallEvent::IceState(RTCIceConnectionState::Connected));
        Ok(())
    }

    fn close(&self) {
        self.pair.close();
    }

    async fn stats(&self) -> Option<TransportStats> {
        let now = Instant::now();
        let Some(answered_at) = *self.pair.answered_at.lock() else {
            return Some(TransportStats::empty(now));
        };
        let elapsed = now.saturating_duration_since(answered_at).as_secs_f64();
        let config = &self.pair.config;
        let mut stats = TransportStats::empty(now);
        stats.bytes_received = Some((elapsed * config.bytes_per_sec as f64) as u64);
        stats.frames_decoded = Some((elapsed * config.frame_rate) as u64);
        if config.report_rtt {
            stats.round_trip_time = Some(self.pair.jittered_rtt());
        }
        if let Some((width, height)) = self
            .remote_stream()
            .and_then(|stream| stream.video_settings())
            .and_then(|settings| settings.resolution())
        {
            stats.frame_width = Some(width);
            stats.frame_height = Some(height);
        }
        Some(stats)
    }

    fn ice_state(&self) -> RTCIceConnectionState {
        if self.pair.is_closed() {
            RTCIceConnectionState::Closed
        } else if self.pair.answered_at.lock().is_some() {
            RTCIceConnectionState::Connected
        } else {
            RTCIceConnectionState::Checking
        }
    }

    async fn echo(&self, payload: u64) -> Result<u64, PeerError> {
        if self.pair.is_closed() {
            return Err(PeerError::Disconnected);
        }
        let delay = self.pair.jittered_rtt();
        tokio::time::sleep(delay).await;
        if self.pair.is_closed() {
            return Err(PeerError::Disconnected);
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::super::LoopbackNetwork;
    use super::*;
    use crate::media::{TrackKind, TrackSettings};

    fn local_stream() -> MediaStream {
        MediaStream::new(vec![MediaTrack::remote(
            TrackKind::Video,
            TrackSettings::video(640, 480, 30.0),
        )])
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn call_answer_and_close_flow() {
        let network = LoopbackNetwork::default();
        network.assign_ids(["alice", "bob"]);
        let broker = network.broker();
        let alice = broker.open(&EndpointConfig::new("local", 9000)).await.unwrap();
        let bob = broker.open(&EndpointConfig::new("local", 9000)).await.unwrap();
        let mut bob_events = bob.take_events().unwrap();

        let outgoing = alice.call("bob", &local_stream()).await.unwrap();
        let mut caller_events = outgoing.take_events().unwrap();
        let Some(LinkEvent::IncomingCall(incoming)) = bob_events.recv().await else {
            panic!("expected incoming call");
        };
        assert_eq!(incoming.remote_id(), "alice");
        assert_eq!(incoming.call_id(), outgoing.call_id());

        incoming.answer(&local_stream()).await.unwrap();
        assert!(matches!(caller_events.recv().await, Some(CallEvent::IceState(RTCIceConnectionState::Checking))));
        assert!(matches!(caller_events.recv().await, Some(CallEvent::Stream(_))));
        assert_eq!(outgoing.ice_state(), RTCIceConnectionState::Connected);

        tokio::time::advance(Duration::from_secs(2)).await;
        let stats = outgoing.stats().await.unwrap();
        assert_eq!(stats.bytes_received, Some(2 * 64 * 1024));
        assert_eq!(stats.frame_width, Some(640));

        bob.destroy();
        loop {
            if let Some(CallEvent::Closed) = caller_events.recv().await {
                break;
            }
        }
        assert_eq!(network.open_links(), vec!["alice".to_string()]);
        assert!(matches!(alice.call("bob", &local_stream()).await, Err(PeerError::PeerUnavailable(_))));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn scripted_unavailability_and_unreachable_hosts() {
        let network = LoopbackNetwork::default();
        network.assign_ids(["alice", "bob"]);
        network.mark_unreachable("down.example");
        let broker = network.broker();
        assert!(matches!(
            broker.open(&EndpointConfig::new("down.example", 1)).await,
            Err(PeerError::Network(_))
        ));
        let alice = broker.open(&EndpointConfig::new("local", 1)).await.unwrap();
        let _bob = broker.open(&EndpointConfig::new("local", 1)).await.unwrap();
        network.make_unavailable("bob", 1);
        assert!(matches!(alice.call("bob", &local_stream()).await, Err(PeerError::PeerUnavailable(_))));
        assert!(alice.call("bob", &local_stream()).await.is_ok());
        assert_eq!(network.calls_placed(), 2);
    }
}
