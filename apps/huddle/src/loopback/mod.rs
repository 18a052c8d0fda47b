//! In-process stand-ins for the signaling server and the peer broker.
//!
//! Every session created against the same [`LoopbackNetwork`] sees the same
//! rooms and can call every other open identity. The simulator and the
//! integration tests run entirely on top of this.

mod broker;
mod signaling;

pub use broker::{LoopbackBroker, LoopbackCall, LoopbackLink};
pub use signaling::LoopbackSignaling;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Deliver `user-connected` to the joining client as well.
    pub echo_self_join: bool,
    /// Announce peers as `{"userId": ..}` objects instead of bare strings.
    pub structured_peer_refs: bool,
    /// Deliver every incoming call twice.
    pub duplicate_incoming_calls: bool,
    /// Whether call stats carry a round-trip time.
    pub report_rtt: bool,
    pub rtt: Duration,
    pub rtt_jitter: Duration,
    pub bytes_per_sec: u64,
    pub frame_rate: f64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            echo_self_join: false,
            structured_peer_refs: false,
            duplicate_incoming_calls: false,
            report_rtt: true,
            rtt: Duration::from_millis(20),
            rtt_jitter: Duration::ZERO,
            bytes_per_sec: 64 * 1024,
            frame_rate: 30.0,
        }
    }
}

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    config: Mutex<LoopbackConfig>,
    rooms: Mutex<HashMap<String, Vec<signaling::RoomMember>>>,
    connections: Mutex<HashMap<u64, signaling::ConnectionControl>>,
    links: Mutex<HashMap<String, Arc<broker::LinkState>>>,
    assigned_ids: Mutex<VecDeque<String>>,
    unreachable_hosts: Mutex<HashSet<String>>,
    hanging_hosts: Mutex<HashSet<String>>,
    unavailable: Mutex<HashMap<String, u32>>,
    refuse_signaling: AtomicBool,
    refuse_reconnect: AtomicBool,
    next_connection: AtomicU64,
    calls_placed: AtomicUsize,
    answers: AtomicUsize,
    links_opened: AtomicUsize,
    signaling_connects: AtomicUsize,
}

impl LoopbackNetwork {
    pub fn new(config: LoopbackConfig) -> Self {
        let network = Self::default();
        *network.inner.config.lock() = config;
        network
    }

    pub fn signaling(&self) -> Arc<LoopbackSignaling> {
        Arc::new(LoopbackSignaling::new(Arc::clone(&self.inner)))
    }

    pub fn broker(&self) -> Arc<LoopbackBroker> {
        Arc::new(LoopbackBroker::new(Arc::clone(&self.inner)))
    }

    /// Broker identities handed out to the next links, in order.
    pub fn assign_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .assigned_ids
            .lock()
            .extend(ids.into_iter().map(Into::into));
    }

    /// Opening a broker link against `host` fails with a network error.
    pub fn mark_unreachable(&self, host: &str) {
        self.inner.unreachable_hosts.lock().insert(host.to_string());
    }

    /// Opening a broker link against `host` never completes.
    pub fn mark_hanging(&self, host: &str) {
        self.inner.hanging_hosts.lock().insert(host.to_string());
    }

    /// The next `count` calls to `peer_id` fail as if the peer were not yet registered.
    pub fn make_unavailable(&self, peer_id: &str, count: u32) {
        self.inner
            .unavailable
            .lock()
            .insert(peer_id.to_string(), count);
    }

    pub fn refuse_signaling(&self, refuse: bool) {
        self.inner.refuse_signaling.store(refuse, Ordering::SeqCst);
    }

    pub fn refuse_reconnect(&self, refuse: bool) {
        self.inner.refuse_reconnect.store(refuse, Ordering::SeqCst);
    }

    /// Severs the signaling connection(s) of `peer_id`.
    pub fn drop_signaling(&self, peer_id: &str) -> usize {
        let connections = self.inner.connections.lock();
        connections
            .values()
            .filter(|control| control.peer_id().as_deref() == Some(peer_id))
            .map(|control| control.kill())
            .count()
    }

    /// Severs the broker link of `peer_id` without telling anyone in the room.
    pub fn drop_link(&self, peer_id: &str) -> bool {
        let link = self.inner.links.lock().get(peer_id).cloned();
        match link {
            Some(link) => {
                link.disconnect();
                true
            }
            None => false,
        }
    }

    /// Closes every call `peer_id` takes part in, as if the media path died.
    pub fn drop_calls(&self, peer_id: &str) -> usize {
        let link = self.inner.links.lock().get(peer_id).cloned();
        link.map(|link| link.close_calls()).unwrap_or(0)
    }

    /// Re-delivers the media of every answered call `peer_id` takes part in.
    pub fn renegotiate(&self, peer_id: &str) -> usize {
        let link = self.inner.links.lock().get(peer_id).cloned();
        link.map(|link| link.renegotiate_calls()).unwrap_or(0)
    }

    pub fn room_members(&self, room_id: &str) -> Vec<String> {
        self.inner
            .rooms
            .lock()
            .get(room_id)
            .map(|members| members.iter().map(|member| member.peer_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn open_links(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .links
            .lock()
            .values()
            .filter(|link| link.is_open())
            .map(|link| link.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn calls_placed(&self) -> usize {
        self.inner.calls_placed.load(Ordering::SeqCst)
    }

    pub fn answers(&self) -> usize {
        self.inner.answers.load(Ordering::SeqCst)
    }

    pub fn links_opened(&self) -> usize {
        self.inner.links_opened.load(Ordering::SeqCst)
    }

    pub fn signaling_connects(&self) -> usize {
        self.inner.signaling_connects.load(Ordering::SeqCst)
    }
}
