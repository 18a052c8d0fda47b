use crate::media::MediaStream;
use crate::monitor::{ConnectionMetrics, ConnectionStatus};
use crate::peer::MediaCall;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Outbound,
    Inbound,
}

/// A call the session currently holds, placed or answered.
pub(crate) struct ActiveCall {
    pub peer_id: String,
    pub call: Arc<dyn MediaCall>,
    pub direction: Direction,
}

impl ActiveCall {
    pub fn caller<'a>(&'a self, local_id: &'a str) -> &'a str {
        match self.direction {
            Direction::Outbound => local_id,
            Direction::Inbound => &self.peer_id,
        }
    }
}

pub(crate) struct Participant {
    pub peer_id: String,
    pub is_self: bool,
    pub call: Option<Arc<dyn MediaCall>>,
    pub stream: Option<MediaStream>,
    pub connected_at: Instant,
    pub status: ConnectionStatus,
    pub metrics: Option<ConnectionMetrics>,
}

impl Participant {
    pub fn local(peer_id: &str, stream: MediaStream) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            is_self: true,
            call: None,
            stream: Some(stream),
            connected_at: Instant::now(),
            status: ConnectionStatus::Local,
            metrics: None,
        }
    }

    pub fn remote(peer_id: &str, call: Arc<dyn MediaCall>, stream: MediaStream) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            is_self: false,
            call: Some(call),
            stream: Some(stream),
            connected_at: Instant::now(),
            status: ConnectionStatus::Connected,
            metrics: None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call.as_ref().map(|call| call.call_id())
    }
}

/// Participants keyed by peer id; at most one entry per peer.
#[derive(Default)]
pub(crate) struct Participants {
    entries: HashMap<String, Participant>,
}

impl Participants {
    pub fn contains(&self, peer_id: &str) -> bool {
        self.entries.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&Participant> {
        self.entries.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut Participant> {
        self.entries.get_mut(peer_id)
    }

    /// Inserts or replaces the entry for the participant's peer id.
    pub fn upsert(&mut self, participant: Participant) -> Option<Participant> {
        self.entries.insert(participant.peer_id.clone(), participant)
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<Participant> {
        self.entries.remove(peer_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Self first, then remote peers by id.
    pub fn ordered(&self) -> Vec<&Participant> {
        let mut all: Vec<&Participant> = self.entries.values().collect();
        all.sort_by(|a, b| b.is_self.cmp(&a.is_self).then_with(|| a.peer_id.cmp(&b.peer_id)));
        all
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Participant> + '_ {
        self.entries.drain().map(|(_, participant)| participant)
    }
}

/// Retry bookkeeping for an outbound dial that has not produced a stream yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectionAttempt {
    pub attempt: u32,
    pub max_retries: u32,
    pub call_id: Option<String>,
}
