use super::{EndpointConfig, LinkEvent, MediaCall, PeerError, PeerLink, PeerTransport};
use crate::backoff::BackoffPolicy;
use crate::media::MediaStream;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactoryConfig {
    pub open_timeout: Duration,
    pub reconnect: BackoffPolicy,
    /// Minimum spacing between two reconnect attempts.
    pub min_reconnect_gap: Duration,
    pub liveness_interval: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(15),
            reconnect: BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(16), 5),
            min_reconnect_gap: Duration::from_secs(2),
            liveness_interval: Duration::from_secs(5),
        }
    }
}

pub enum FactoryEvent {
    IncomingCall(Arc<dyn MediaCall>),
    ConnectionLost,
    Reconnected,
    CallFailed { remote_id: String, error: PeerError },
    /// The broker connection is gone for good.
    Fatal(PeerError),
}

impl std::fmt::Debug for FactoryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FactoryEvent::IncomingCall(call) => f
                .debug_struct("IncomingCall")
                .field("call_id", &call.call_id())
                .field("remote_id", &call.remote_id())
                .finish(),
            FactoryEvent::ConnectionLost => f.write_str("ConnectionLost"),
            FactoryEvent::Reconnected => f.write_str("Reconnected"),
            FactoryEvent::CallFailed { remote_id, error } => f
                .debug_struct("CallFailed")
                .field("remote_id", remote_id)
                .field("error", error)
                .finish(),
            FactoryEvent::Fatal(err) => f.debug_tuple("Fatal").field(err).finish(),
        }
    }
}

impl FactoryConfig {
    /// Rejects settings the link supervisor cannot run with.
    pub fn validate(&self) -> Result<(), PeerError> {
        if self.open_timeout.is_zero() {
            return Err(PeerError::InvalidConfig("open timeout must be non-zero".into()));
        }
        if self.liveness_interval.is_zero() {
            return Err(PeerError::InvalidConfig("liveness interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Owns the session's broker identity and keeps it connected.
pub struct PeerConnectionFactory {
    link: Arc<dyn PeerLink>,
    local_id: String,
    ready: Arc<AtomicBool>,
    destroyed: AtomicBool,
    events: mpsc::UnboundedSender<FactoryEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerConnectionFactory {
    /// Opens the broker connection, falling back to `fallback` once when the
    /// primary endpoint times out or is unreachable.
    pub async fn build(
        transport: Arc<dyn PeerTransport>,
        primary: &EndpointConfig,
        fallback: Option<&EndpointConfig>,
        config: FactoryConfig,
        events: mpsc::UnboundedSender<FactoryEvent>,
    ) -> Result<Arc<Self>, PeerError> {
        config.validate()?;
        let (link, endpoint) = match open_with_timeout(&transport, primary, config.open_timeout).await {
            Ok(link) => (link, primary),
            Err(err) if err.is_network() => {
                let Some(fallback) = fallback else {
                    tracing::warn!(target = "huddle::peer", endpoint = %primary, error = %err, "broker unreachable and no fallback configured");
                    return Err(err);
                };
                tracing::warn!(
                    target = "huddle::peer",
                    primary = %primary,
                    fallback = %fallback,
                    error = %err,
                    "primary broker failed; trying fallback"
                );
                let link = open_with_timeout(&transport, fallback, config.open_timeout).await?;
                (link, fallback)
            }
            Err(err) => return Err(err),
        };

        let link_events = link
            .take_events()
            .ok_or_else(|| PeerError::Protocol("link events already taken".into()))?;
        let local_id = link.id().to_string();
        tracing::info!(target = "huddle::peer", local_id = %local_id, endpoint = %endpoint, "broker identity established");

        let factory = Arc::new(Self {
            link: Arc::clone(&link),
            local_id,
            ready: Arc::new(AtomicBool::new(true)),
            destroyed: AtomicBool::new(false),
            events: events.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let supervisor = LinkSupervisor {
            link,
            config,
            ready: Arc::clone(&factory.ready),
            events,
            last_attempt: None,
        };
        let handle = tokio::spawn(supervisor.run(link_events));
        factory.tasks.lock().push(handle);
        Ok(factory)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Connected to the broker and able to place calls.
    pub fn is_ready(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst) && self.ready.load(Ordering::SeqCst)
    }

    pub async fn call(&self, remote_id: &str, stream: &MediaStream) -> Result<Arc<dyn MediaCall>, PeerError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(PeerError::Destroyed);
        }
        if !self.ready.load(Ordering::SeqCst) {
            return Err(PeerError::Disconnected);
        }
        match self.link.call(remote_id, stream).await {
            Ok(call) => Ok(call),
            Err(error) => {
                let _ = self.events.send(FactoryEvent::CallFailed {
                    remote_id: remote_id.to_string(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Stops supervision and closes the broker connection. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ready.store(false, Ordering::SeqCst);
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.link.destroy();
        tracing::debug!(target = "huddle::peer", local_id = %self.local_id, "peer connection factory destroyed");
    }
}

impl Drop for PeerConnectionFactory {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

async fn open_with_timeout(
    transport: &Arc<dyn PeerTransport>,
    endpoint: &EndpointConfig,
    timeout: Duration,
) -> Result<Arc<dyn PeerLink>, PeerError> {
    let ice_servers = endpoint.rtc_ice_servers()?;
    tracing::debug!(
        target = "huddle::peer",
        endpoint = %endpoint,
        ice_servers = ice_servers.len(),
        "opening broker link"
    );
    match tokio::time::timeout(timeout, transport.open(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(PeerError::Timeout(timeout)),
    }
}

enum Recovery {
    Restored,
    GaveUp,
}

struct LinkSupervisor {
    link: Arc<dyn PeerLink>,
    config: FactoryConfig,
    ready: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<FactoryEvent>,
    last_attempt: Option<Instant>,
}

impl LinkSupervisor {
    async fn run(mut self, mut link_events: mpsc::UnboundedReceiver<LinkEvent>) {
        let mut liveness = tokio::time::interval_at(
            Instant::now() + self.config.liveness_interval,
            self.config.liveness_interval,
        );
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = link_events.recv() => {
                    let Some(event) = event else {
                        tracing::debug!(target = "huddle::peer", "link event stream ended");
                        return;
                    };
                    match event {
                        LinkEvent::IncomingCall(call) => {
                            if self.events.send(FactoryEvent::IncomingCall(call)).is_err() {
                                return;
                            }
                        }
                        LinkEvent::Disconnected => {
                            if self.link.is_open() {
                                tracing::debug!(target = "huddle::peer", "ignoring stale disconnect notice");
                                continue;
                            }
                            if let Recovery::GaveUp = self.recover("broker disconnected").await {
                                return;
                            }
                        }
                        LinkEvent::Error(err) if err.is_transient() => {
                            if self.link.is_open() {
                                tracing::debug!(target = "huddle::peer", error = %err, "transient broker error on open link");
                                continue;
                            }
                            if let Recovery::GaveUp = self.recover("transient broker error").await {
                                return;
                            }
                        }
                        LinkEvent::Error(err) => {
                            tracing::error!(target = "huddle::peer", error = %err, "unrecoverable broker error");
                            self.ready.store(false, Ordering::SeqCst);
                            let _ = self.events.send(FactoryEvent::Fatal(err));
                            return;
                        }
                    }
                }
                _ = liveness.tick() => {
                    if !self.link.is_open() && self.ready.load(Ordering::SeqCst) {
                        tracing::warn!(target = "huddle::peer", "liveness check found a dead broker link");
                        if let Recovery::GaveUp = self.recover("liveness check failed").await {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn recover(&mut self, reason: &str) -> Recovery {
        self.ready.store(false, Ordering::SeqCst);
        let _ = self.events.send(FactoryEvent::ConnectionLost);
        tracing::warn!(target = "huddle::peer", reason, "broker connection lost; reconnecting");

        let policy = self.config.reconnect;
        let mut attempt: u32 = 0;
        loop {
            let Some(delay) = policy.delay_for(attempt) else {
                let err = PeerError::ReconnectExhausted { attempts: attempt };
                tracing::error!(target = "huddle::peer", error = %err, "broker reconnect exhausted");
                let _ = self.events.send(FactoryEvent::Fatal(err));
                return Recovery::GaveUp;
            };
            let wait = match self.last_attempt {
                Some(last) => delay.max(
                    self.config
                        .min_reconnect_gap
                        .saturating_sub(last.elapsed()),
                ),
                None => delay,
            };
            tokio::time::sleep(wait).await;
            self.last_attempt = Some(Instant::now());
            attempt += 1;

            match self.link.reconnect().await {
                Ok(()) => {
                    self.ready.store(true, Ordering::SeqCst);
                    tracing::info!(target = "huddle::peer", attempt, "broker connection restored");
                    let _ = self.events.send(FactoryEvent::Reconnected);
                    return Recovery::Restored;
                }
                Err(err) if err.is_transient() => {
                    tracing::debug!(target = "huddle::peer", attempt, error = %err, "broker reconnect attempt failed");
                }
                Err(err) => {
                    tracing::error!(target = "huddle::peer", error = %err, "broker reconnect failed permanently");
                    let _ = self.events.send(FactoryEvent::Fatal(err));
                    return Recovery::GaveUp;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{CallEvent, TransportStats};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

    struct MockLink {
        id: String,
        open: AtomicBool,
        events_tx: mpsc::UnboundedSender<LinkEvent>,
        events_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
        reconnects: Mutex<VecDeque<Result<(), PeerError>>>,
        reconnect_calls: AtomicUsize,
        destroy_calls: AtomicUsize,
    }

    impl MockLink {
        fn new(id: &str) -> Arc<Self> {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                id: id.into(),
                open: AtomicBool::new(true),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                reconnects: Mutex::new(VecDeque::new()),
                reconnect_calls: AtomicUsize::new(0),
                destroy_calls: AtomicUsize::new(0),
            })
        }

        fn drop_connection(&self) {
            self.open.store(false, Ordering::SeqCst);
            let _ = self.events_tx.send(LinkEvent::Disconnected);
        }
    }

    #[async_trait]
    impl PeerLink for MockLink {
        fn id(&self) -> &str {
            &self.id
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
            self.events_rx.lock().take()
        }

        async fn reconnect(&self) -> Result<(), PeerError> {
            self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self
                .reconnects
                .lock()
                .pop_front()
                .unwrap_or(Err(PeerError::Network("still down".into())));
            if outcome.is_ok() {
                self.open.store(true, Ordering::SeqCst);
            }
            outcome
        }

        async fn call(&self, remote_id: &str, _stream: &MediaStream) -> Result<Arc<dyn MediaCall>, PeerError> {
            Err(PeerError::PeerUnavailable(remote_id.to_string()))
        }

        fn destroy(&self) {
            self.destroy_calls.fetch_add(1, Ordering::SeqCst);
            self.open.store(false, Ordering::SeqCst);
        }
    }

    /// Opens links per endpoint host; unknown hosts hang forever.
    struct MockTransport {
        links: Mutex<Vec<(String, Result<Arc<MockLink>, PeerError>)>>,
        opened: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn new(links: Vec<(&str, Result<Arc<MockLink>, PeerError>)>) -> Arc<Self> {
            Arc::new(Self {
                links: Mutex::new(links.into_iter().map(|(h, l)| (h.to_string(), l)).collect()),
                opened: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PeerTransport for MockTransport {
        async fn open(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn PeerLink>, PeerError> {
            self.opened.lock().push(endpoint.host.clone());
            let found = self
                .links
                .lock()
                .iter()
                .find(|(host, _)| *host == endpoint.host)
                .map(|(_, link)| link.clone());
            match found {
                Some(Ok(link)) => Ok(link as Arc<dyn PeerLink>),
                Some(Err(err)) => Err(err),
                None => std::future::pending().await,
            }
        }
    }

    struct NullCall;

    #[async_trait]
    impl MediaCall for NullCall {
        fn call_id(&self) -> &str {
            "c-1"
        }
        fn remote_id(&self) -> &str {
            "remote"
        }
        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CallEvent>> {
            None
        }
        async fn answer(&self, _stream: &MediaStream) -> Result<(), PeerError> {
            Ok(())
        }
        fn close(&self) {}
        async fn stats(&self) -> Option<TransportStats> {
            None
        }
        fn ice_state(&self) -> RTCIceConnectionState {
            RTCIceConnectionState::New
        }
        async fn echo(&self, payload: u64) -> Result<u64, PeerError> {
            Ok(payload)
        }
    }

    fn config() -> FactoryConfig {
        FactoryConfig {
            open_timeout: Duration::from_secs(15),
            reconnect: BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(8), 3),
            min_reconnect_gap: Duration::from_secs(2),
            liveness_interval: Duration::from_secs(5),
        }
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn falls_back_when_primary_times_out() {
        let fallback_link = MockLink::new("public-id");
        let transport = MockTransport::new(vec![("public", Ok(fallback_link.clone()))]);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let started = Instant::now();

        let factory = PeerConnectionFactory::build(
            transport.clone(),
            &EndpointConfig::new("self-hosted", 9000),
            Some(&EndpointConfig::new("public", 443)),
            config(),
            events_tx,
        )
        .await
        .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(15));
        assert_eq!(factory.local_id(), "public-id");
        assert!(factory.is_ready());
        assert_eq!(*transport.opened.lock(), vec!["self-hosted".to_string(), "public".to_string()]);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn timeout_without_fallback_fails() {
        let transport = MockTransport::new(vec![]);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let err = PeerConnectionFactory::build(
            transport,
            &EndpointConfig::new("self-hosted", 9000),
            None,
            config(),
            events_tx,
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err, PeerError::Timeout(Duration::from_secs(15)));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn protocol_error_skips_fallback() {
        let transport = MockTransport::new(vec![
            ("self-hosted", Err(PeerError::Protocol("invalid key".into()))),
            ("public", Ok(MockLink::new("public-id"))),
        ]);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let result = PeerConnectionFactory::build(
            transport.clone(),
            &EndpointConfig::new("self-hosted", 9000),
            Some(&EndpointConfig::new("public", 443)),
            config(),
            events_tx,
        )
        .await;
        assert!(matches!(result, Err(PeerError::Protocol(_))));
        assert_eq!(transport.opened.lock().len(), 1);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn zero_liveness_interval_is_rejected_before_opening() {
        let transport = MockTransport::new(vec![("self-hosted", Ok(MockLink::new("me")))]);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let result = PeerConnectionFactory::build(
            transport.clone(),
            &EndpointConfig::new("self-hosted", 9000),
            None,
            FactoryConfig {
                liveness_interval: Duration::ZERO,
                ..config()
            },
            events_tx,
        )
        .await;
        assert!(matches!(result, Err(PeerError::InvalidConfig(_))));
        assert!(transport.opened.lock().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn malformed_ice_server_skips_the_broker() {
        let transport = MockTransport::new(vec![("self-hosted", Ok(MockLink::new("me")))]);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut primary = EndpointConfig::new("self-hosted", 9000);
        primary.ice_servers = vec![crate::peer::IceServerConfig::stun("turn:relay.test:3478")];
        let result = PeerConnectionFactory::build(transport.clone(), &primary, None, config(), events_tx).await;
        assert!(matches!(result, Err(PeerError::InvalidConfig(_))));
        assert!(transport.opened.lock().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn reconnects_after_disconnect() {
        let link = MockLink::new("me");
        link.reconnects
            .lock()
            .extend([Err(PeerError::Network("down".into())), Ok(())]);
        let transport = MockTransport::new(vec![("self-hosted", Ok(link.clone()))]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let factory = PeerConnectionFactory::build(
            transport,
            &EndpointConfig::new("self-hosted", 9000),
            None,
            config(),
            events_tx,
        )
        .await
        .unwrap();

        link.drop_connection();
        assert!(matches!(events_rx.recv().await, Some(FactoryEvent::ConnectionLost)));
        assert!(!factory.is_ready());
        assert!(matches!(events_rx.recv().await, Some(FactoryEvent::Reconnected)));
        assert!(factory.is_ready());
        assert_eq!(link.reconnect_calls.load(Ordering::SeqCst), 2);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn exhausted_reconnects_are_fatal_and_spaced() {
        let link = MockLink::new("me");
        let transport = MockTransport::new(vec![("self-hosted", Ok(link.clone()))]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _factory = PeerConnectionFactory::build(
            transport,
            &EndpointConfig::new("self-hosted", 9000),
            None,
            config(),
            events_tx,
        )
        .await
        .unwrap();

        let started = Instant::now();
        link.drop_connection();
        assert!(matches!(events_rx.recv().await, Some(FactoryEvent::ConnectionLost)));
        match events_rx.recv().await {
            Some(FactoryEvent::Fatal(PeerError::ReconnectExhausted { attempts })) => assert_eq!(attempts, 3),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(link.reconnect_calls.load(Ordering::SeqCst), 3);
        // 1s + max(2s, gap) + 4s
        assert!(started.elapsed() >= Duration::from_secs(7));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn liveness_check_detects_silent_death() {
        let link = MockLink::new("me");
        link.reconnects.lock().push_back(Ok(()));
        let transport = MockTransport::new(vec![("self-hosted", Ok(link.clone()))]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _factory = PeerConnectionFactory::build(
            transport,
            &EndpointConfig::new("self-hosted", 9000),
            None,
            config(),
            events_tx,
        )
        .await
        .unwrap();

        link.open.store(false, Ordering::SeqCst);
        assert!(matches!(events_rx.recv().await, Some(FactoryEvent::ConnectionLost)));
        assert!(matches!(events_rx.recv().await, Some(FactoryEvent::Reconnected)));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn forwards_incoming_calls_and_destroys_once() {
        let link = MockLink::new("me");
        let transport = MockTransport::new(vec![("self-hosted", Ok(link.clone()))]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let factory = PeerConnectionFactory::build(
            transport,
            &EndpointConfig::new("self-hosted", 9000),
            None,
            config(),
            events_tx,
        )
        .await
        .unwrap();

        link.events_tx.send(LinkEvent::IncomingCall(Arc::new(NullCall))).unwrap();
        match events_rx.recv().await {
            Some(FactoryEvent::IncomingCall(call)) => assert_eq!(call.call_id(), "c-1"),
            other => panic!("unexpected event {other:?}"),
        }

        let stream = MediaStream::new(Vec::new());
        assert!(matches!(
            factory.call("bob", &stream).await,
            Err(PeerError::PeerUnavailable(_))
        ));
        assert!(matches!(events_rx.recv().await, Some(FactoryEvent::CallFailed { .. })));

        factory.destroy();
        factory.destroy();
        assert_eq!(link.destroy_calls.load(Ordering::SeqCst), 1);
        assert!(!factory.is_ready());
        assert!(matches!(factory.call("bob", &stream).await, Err(PeerError::Destroyed)));
    }
}
