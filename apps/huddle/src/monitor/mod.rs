//! Periodic health and quality sampling for every tracked participant.
//! The monitor only observes; it never alters connection state.

pub mod rate;

pub use rate::{FrameTicker, RateWindow, bytes_per_sec_to_kbps};

use crate::media::MediaStream;
use crate::peer::MediaCall;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Local,
}

impl From<RTCIceConnectionState> for ConnectionStatus {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                ConnectionStatus::Connected
            }
            RTCIceConnectionState::Disconnected | RTCIceConnectionState::Closed => {
                ConnectionStatus::Disconnected
            }
            RTCIceConnectionState::Failed => ConnectionStatus::Failed,
            _ => ConnectionStatus::Connecting,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Local => "local",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionMetrics {
    pub status: ConnectionStatus,
    pub ping_ms: Option<u64>,
    pub bitrate_kbps: Option<f64>,
    pub resolution: Option<(u32, u32)>,
    pub fps: Option<f64>,
}

impl ConnectionMetrics {
    pub fn with_status(status: ConnectionStatus) -> Self {
        Self {
            status,
            ping_ms: None,
            bitrate_kbps: None,
            resolution: None,
            fps: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsUpdate {
    pub peer_id: String,
    pub metrics: ConnectionMetrics,
}

#[derive(Clone)]
pub enum Tracked {
    Remote(Arc<dyn MediaCall>),
    Local(MediaStream),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub sample_interval: Duration,
    pub probe_interval: Duration,
    pub fps_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            probe_interval: Duration::from_secs(5),
            fps_window: Duration::from_secs(5),
        }
    }
}

struct Entry {
    target: Tracked,
    generation: u64,
    bytes: RateWindow,
    frames: RateWindow,
    ticker: FrameTicker,
    probe_rtt: Option<Duration>,
    probe: Option<JoinHandle<()>>,
}

impl Drop for Entry {
    fn drop(&mut self) {
        if let Some(probe) = self.probe.take() {
            probe.abort();
        }
    }
}

struct Shared {
    config: MonitorConfig,
    entries: Mutex<HashMap<String, Entry>>,
    updates: mpsc::UnboundedSender<MetricsUpdate>,
    generation: AtomicU64,
}

pub struct ConnectionMonitor {
    shared: Arc<Shared>,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionMonitor {
    /// Starts the periodic sampler; updates flow to `updates`.
    pub fn start(config: MonitorConfig, updates: mpsc::UnboundedSender<MetricsUpdate>) -> Arc<Self> {
        let shared = Arc::new(Shared {
            config,
            entries: Mutex::new(HashMap::new()),
            updates,
            generation: AtomicU64::new(0),
        });
        let mut tasks = Vec::new();
        if config.sample_interval.is_zero() {
            tracing::warn!(target = "huddle::monitor", "sample interval is zero; sampling on demand only");
        } else {
            let ticker_shared = Arc::clone(&shared);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(
                    Instant::now() + config.sample_interval,
                    config.sample_interval,
                );
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    sample_all(&ticker_shared).await;
                }
            }));
        }
        Arc::new(Self {
            shared,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        })
    }

    /// Begins (or restarts) monitoring `peer_id`; previous rate history is discarded.
    pub fn track(&self, peer_id: &str, target: Tracked) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = Entry {
            target,
            generation,
            bytes: RateWindow::new(),
            frames: RateWindow::new(),
            ticker: FrameTicker::new(self.shared.config.fps_window),
            probe_rtt: None,
            probe: None,
        };
        self.shared.entries.lock().insert(peer_id.to_string(), entry);
        tracing::debug!(target = "huddle::monitor", peer_id, "tracking connection");
    }

    pub fn untrack(&self, peer_id: &str) {
        if self.shared.entries.lock().remove(peer_id).is_some() {
            tracing::debug!(target = "huddle::monitor", peer_id, "stopped tracking connection");
        }
    }

    pub fn is_tracking(&self, peer_id: &str) -> bool {
        self.shared.entries.lock().contains_key(peer_id)
    }

    /// The presentation layer ticks this once per rendered frame.
    pub fn frame_ticker(&self, peer_id: &str) -> Option<FrameTicker> {
        self.shared
            .entries
            .lock()
            .get(peer_id)
            .map(|entry| entry.ticker.clone())
    }

    /// Samples one participant immediately and publishes the result.
    pub async fn sample_now(&self, peer_id: &str) -> Option<ConnectionMetrics> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        sample_peer(&self.shared, peer_id).await
    }

    /// Samples everything in the background.
    pub fn refresh_all(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move { sample_all(&shared).await });
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Cancels every sampler and probe. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.entries.lock().clear();
        tracing::debug!(target = "huddle::monitor", "connection monitor stopped");
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn sample_all(shared: &Arc<Shared>) {
    let peers: Vec<String> = shared.entries.lock().keys().cloned().collect();
    for peer_id in peers {
        sample_peer(shared, &peer_id).await;
    }
}

async fn sample_peer(shared: &Arc<Shared>, peer_id: &str) -> Option<ConnectionMetrics> {
    let (target, generation) = {
        let entries = shared.entries.lock();
        let entry = entries.get(peer_id)?;
        (entry.target.clone(), entry.generation)
    };

    let metrics = match target {
        Tracked::Local(stream) => local_metrics(&stream),
        Tracked::Remote(call) => {
            let stats = call.stats().await;
            let status = ConnectionStatus::from(call.ice_state());
            let now = Instant::now();

            let mut entries = shared.entries.lock();
            let entry = entries.get_mut(peer_id).filter(|entry| entry.generation == generation)?;
            let mut metrics = ConnectionMetrics::with_status(status);

            if let Some(stats) = &stats {
                metrics.bitrate_kbps = stats
                    .bytes_received
                    .and_then(|bytes| entry.bytes.observe(bytes, stats.sampled_at))
                    .map(bytes_per_sec_to_kbps);
                metrics.fps = stats
                    .frames_decoded
                    .and_then(|frames| entry.frames.observe(frames, stats.sampled_at));
                metrics.resolution = stats.frame_width.zip(stats.frame_height);
            }

            let rtt = stats.as_ref().and_then(|stats| stats.round_trip_time);
            match rtt {
                Some(rtt) => metrics.ping_ms = Some(rtt.as_millis() as u64),
                None => {
                    metrics.ping_ms = entry.probe_rtt.map(|rtt| rtt.as_millis() as u64);
                    if entry.probe.is_none() && !shared.config.probe_interval.is_zero() {
                        entry.probe = Some(spawn_probe(shared, peer_id, generation, Arc::clone(&call)));
                    }
                }
            }

            if metrics.fps.is_none() {
                metrics.fps = entry.ticker.fps_at(now);
            }
            metrics
        }
    };

    tracing::trace!(target = "huddle::monitor", peer_id, ?metrics, "sampled connection");
    let _ = shared.updates.send(MetricsUpdate {
        peer_id: peer_id.to_string(),
        metrics: metrics.clone(),
    });
    Some(metrics)
}

fn local_metrics(stream: &MediaStream) -> ConnectionMetrics {
    let mut metrics = ConnectionMetrics::with_status(ConnectionStatus::Local);
    if let Some(settings) = stream.video_settings() {
        metrics.resolution = settings.resolution();
        metrics.fps = settings.frame_rate;
    }
    metrics
}

/// Echo-based round-trip probe for transports that report no RTT.
fn spawn_probe(
    shared: &Arc<Shared>,
    peer_id: &str,
    generation: u64,
    call: Arc<dyn MediaCall>,
) -> JoinHandle<()> {
    let shared = Arc::downgrade(shared);
    let peer_id = peer_id.to_string();
    tokio::spawn(async move {
        let Some(interval) = shared.upgrade().map(|shared| shared.config.probe_interval) else {
            return;
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut nonce: u64 = 0;
        loop {
            ticker.tick().await;
            nonce = nonce.wrapping_add(1);
            let sent_at = Instant::now();
            let rtt = match tokio::time::timeout(interval, call.echo(nonce)).await {
                Ok(Ok(echoed)) if echoed == nonce => sent_at.elapsed(),
                Ok(Ok(_)) => continue,
                Ok(Err(err)) => {
                    tracing::trace!(target = "huddle::monitor", peer_id = %peer_id, error = %err, "echo probe failed");
                    continue;
                }
                Err(_) => continue,
            };
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut entries = shared.entries.lock();
            match entries.get_mut(&peer_id) {
                Some(entry) if entry.generation == generation => entry.probe_rtt = Some(rtt),
                _ => return,
            }
        }
    })
}
