//! Runs several sessions against one in-process network and reports what
//! each participant ends up seeing.

use crate::loopback::{LoopbackConfig, LoopbackNetwork};
use crate::media::{DeviceProfile, SyntheticDevices};
use crate::session::{SessionConfig, SessionDeps, SessionError, SessionHandle, SessionSnapshot, SessionState};
use crate::signaling::{SignalingConnector, WebSocketConnector};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub participants: usize,
    /// Pause between two participants starting.
    pub stagger: Duration,
    /// How long the full room stays up before everyone leaves.
    pub hold: Duration,
    /// Use real WebSocket signaling at the session's signaling URL instead
    /// of the in-process server.
    pub external_signaling: bool,
    pub profile: DeviceProfile,
    pub network: LoopbackConfig,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            participants: 3,
            stagger: Duration::from_millis(500),
            hold: Duration::from_secs(8),
            external_signaling: false,
            profile: DeviceProfile::default(),
            network: LoopbackConfig {
                echo_self_join: true,
                rtt_jitter: Duration::from_millis(5),
                ..LoopbackConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub snapshots: Vec<SessionSnapshot>,
    pub calls_placed: usize,
    pub answers: usize,
    pub leaked_captures: usize,
}

impl SimulationReport {
    /// Every participant sees every other participant exactly once.
    pub fn fully_meshed(&self) -> bool {
        let expected = self.snapshots.len();
        self.snapshots.iter().all(|snapshot| snapshot.participant_count == expected)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for snapshot in &self.snapshots {
            let _ = writeln!(
                out,
                "{} [{}] {} participant(s)",
                snapshot.local_id.as_deref().unwrap_or("?"),
                snapshot.state,
                snapshot.participant_count
            );
            for tile in &snapshot.tiles {
                let metrics: Vec<&str> = [&tile.ping, &tile.rate, &tile.resolution, &tile.fps]
                    .into_iter()
                    .filter_map(|field| field.as_deref())
                    .collect();
                let _ = writeln!(out, "  #{:<24} {:<8} {:<12} {}", tile.element_id, tile.label, tile.status, metrics.join(" | "));
            }
        }
        let _ = writeln!(
            out,
            "calls placed: {}, answers: {}, leaked captures: {}",
            self.calls_placed, self.answers, self.leaked_captures
        );
        out
    }
}

/// Starts `options.participants` sessions from `template`, holds the room,
/// snapshots every session and leaves. Returns early if any session fails.
pub async fn run(template: SessionConfig, options: SimulationOptions) -> Result<SimulationReport, SessionError> {
    let network = LoopbackNetwork::new(options.network.clone());
    let signaling: Arc<dyn SignalingConnector> = if options.external_signaling {
        Arc::new(WebSocketConnector)
    } else {
        network.signaling()
    };

    let mut sessions = Vec::with_capacity(options.participants);
    let mut devices = Vec::with_capacity(options.participants);
    for index in 0..options.participants {
        if index > 0 {
            tokio::time::sleep(options.stagger).await;
        }
        let camera = Arc::new(SyntheticDevices::new());
        let deps = SessionDeps {
            devices: camera.clone(),
            profile: options.profile.clone(),
            signaling: Arc::clone(&signaling),
            transport: network.broker(),
        };
        tracing::info!(target = "huddle::simulate", index, room_id = %template.room_id, "starting participant");
        sessions.push(SessionHandle::start(template.clone(), deps));
        devices.push(camera);
    }

    let outcome = hold_room(&sessions, options.hold).await;

    let mut snapshots = Vec::with_capacity(sessions.len());
    for session in &sessions {
        if let Ok(snapshot) = session.snapshot().await {
            snapshots.push(snapshot);
        }
    }
    for session in &sessions {
        session.leave_call().await;
    }
    outcome?;

    Ok(SimulationReport {
        snapshots,
        calls_placed: network.calls_placed(),
        answers: network.answers(),
        leaked_captures: devices.iter().map(|camera| camera.live_handles()).sum(),
    })
}

async fn hold_room(sessions: &[SessionHandle], hold: Duration) -> Result<(), SessionError> {
    for session in sessions {
        match session
            .wait_for_state(|state| *state == SessionState::Active || state.is_finished())
            .await
        {
            SessionState::Failed(err) => return Err(err),
            SessionState::Active => {}
            _ => return Err(SessionError::Closed),
        }
    }
    tokio::select! {
        _ = tokio::time::sleep(hold) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target = "huddle::simulate", "interrupted; leaving early");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::EndpointConfig;

    #[test_timeout::tokio_timeout_test(30, paused)]
    async fn three_participants_form_a_full_mesh() {
        let template = SessionConfig::new("sim", "http://127.0.0.1:3000", EndpointConfig::new("127.0.0.1", 9000));
        let options = SimulationOptions {
            hold: Duration::from_secs(10),
            ..SimulationOptions::default()
        };
        let report = run(template, options).await.unwrap();
        assert_eq!(report.snapshots.len(), 3);
        assert!(report.fully_meshed(), "{}", report.render());
        assert_eq!(report.leaked_captures, 0);
        assert!(report.render().contains("#video-"));
    }
}
