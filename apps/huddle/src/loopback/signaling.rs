use super::Inner;
use crate::signaling::{SignalingConnector, SignalingError, SignalingLink};
use async_trait::async_trait;
use huddle_proto::{ClientEvent, PeerRef, RoomJoin, ServerEvent};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::{Notify, mpsc};

pub(super) struct RoomMember {
    pub conn_id: u64,
    pub peer_id: String,
    pub tx: mpsc::UnboundedSender<ServerEvent>,
}

pub(super) struct ConnectionControl {
    peer: Arc<Mutex<Option<String>>>,
    kill: Arc<Notify>,
}

impl ConnectionControl {
    pub fn peer_id(&self) -> Option<String> {
        self.peer.lock().clone()
    }

    pub fn kill(&self) {
        self.kill.notify_one();
    }
}

/// Room server living inside the process.
pub struct LoopbackSignaling {
    inner: Arc<Inner>,
}

impl LoopbackSignaling {
    pub(super) fn new(inner: Arc<Inner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl SignalingConnector for LoopbackSignaling {
    async fn connect(&self, _url: &str) -> Result<SignalingLink, SignalingError> {
        if self.inner.refuse_signaling.load(Ordering::SeqCst) {
            return Err(SignalingError::Connect("loopback signaling refused".into()));
        }
        self.inner.signaling_connects.fetch_add(1, Ordering::SeqCst);
        let conn_id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let control = ConnectionControl {
            peer: Arc::new(Mutex::new(None)),
            kill: Arc::new(Notify::new()),
        };
        let kill = Arc::clone(&control.kill);
        let peer_slot = Arc::clone(&control.peer);
        self.inner.connections.lock().insert(conn_id, control);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _departure = Departure {
                inner: Arc::clone(&inner),
                conn_id,
            };
            loop {
                tokio::select! {
                    _ = kill.notified() => break,
                    event = outbound_rx.recv() => match event {
                        Some(ClientEvent::JoinRoom(join)) => {
                            *peer_slot.lock() = Some(join.peer_id.clone());
                            join_room(&inner, conn_id, join, &inbound_tx);
                        }
                        Some(ClientEvent::ChatMessage(message)) => {
                            broadcast_from(&inner, conn_id, ServerEvent::ChatMessage(message));
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(SignalingLink::new(outbound_tx, inbound_rx).with_tasks(vec![task]))
    }
}

fn peer_ref(inner: &Inner, peer_id: &str) -> PeerRef {
    if inner.config.lock().structured_peer_refs {
        let mut map = Map::new();
        map.insert("userId".into(), Value::String(peer_id.to_string()));
        PeerRef::Structured(map)
    } else {
        PeerRef::raw(peer_id)
    }
}

fn join_room(inner: &Inner, conn_id: u64, join: RoomJoin, tx: &mpsc::UnboundedSender<ServerEvent>) {
    let echo_self = inner.config.lock().echo_self_join;
    let announced = peer_ref(inner, &join.peer_id);
    let mut rooms = inner.rooms.lock();
    for members in rooms.values_mut() {
        members.retain(|member| member.conn_id != conn_id);
    }
    let members = rooms.entry(join.room_id.clone()).or_default();
    for member in members.iter() {
        let _ = member.tx.send(ServerEvent::UserConnected(announced.clone()));
    }
    if echo_self {
        let _ = tx.send(ServerEvent::UserConnected(announced));
    }
    members.push(RoomMember {
        conn_id,
        peer_id: join.peer_id,
        tx: tx.clone(),
    });
    tracing::trace!(target = "huddle::loopback", room = %join.room_id, members = members.len(), "peer joined room");
}

/// Relays to everyone in the sender's room except the sender.
fn broadcast_from(inner: &Inner, conn_id: u64, event: ServerEvent) {
    let rooms = inner.rooms.lock();
    let Some(members) = rooms
        .values()
        .find(|members| members.iter().any(|member| member.conn_id == conn_id))
    else {
        return;
    };
    for member in members.iter().filter(|member| member.conn_id != conn_id) {
        let _ = member.tx.send(event.clone());
    }
}

/// Leaves the room and tells the others when a connection goes away.
struct Departure {
    inner: Arc<Inner>,
    conn_id: u64,
}

impl Drop for Departure {
    fn drop(&mut self) {
        self.inner.connections.lock().remove(&self.conn_id);
        let mut rooms = self.inner.rooms.lock();
        for members in rooms.values_mut() {
            let Some(index) = members.iter().position(|member| member.conn_id == self.conn_id) else {
                continue;
            };
            let departed = members.remove(index);
            let announced = peer_ref(&self.inner, &departed.peer_id);
            for member in members.iter() {
                let _ = member.tx.send(ServerEvent::UserDisconnected(announced.clone()));
            }
        }
        rooms.retain(|_, members| !members.is_empty());
    }
}
