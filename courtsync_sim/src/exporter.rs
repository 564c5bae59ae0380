//! JSON exporter for session replays.
//!
//! Exports the coordinator's view plus per-peer sync status, frame by
//! frame, for offline inspection.

use crate::world::SimWorld;

use courtsync_core::authority::PeerRole;
use courtsync_core::{Actor, GameEvent};
use courtsync_core::events::EventKind;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    pub tick: u64,

    /// Simulation time in seconds
    pub time_sec: f64,

    /// Coordinator at this frame, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<String>,

    pub phase: String,
    pub score: [u32; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carrier: Option<u32>,

    /// Authoritative actor positions
    pub actors: Vec<ActorPosition>,

    /// Per-peer sync status
    pub peers: Vec<PeerFrame>,

    /// Events emitted by the coordinator since the previous frame
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

/// Position of an actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorPosition {
    pub id: u32,
    pub team: String,
    pub x: f64,
    pub y: f64,
    pub turbo: f64,
}

impl ActorPosition {
    pub fn new(actor: &Actor) -> Self {
        Self {
            id: actor.id.0,
            team: actor.team.name().to_string(),
            x: actor.position.x,
            y: actor.position.y,
            turbo: actor.turbo,
        }
    }
}

/// One peer's sync status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerFrame {
    pub peer_id: String,
    pub coordinator: bool,
    pub epoch: u64,
    pub quality: String,
    /// Prediction error at the last reconcile
    pub prediction_error: f64,
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: Some("warn".to_string()),
        }
    }
}

fn describe(event: &GameEvent) -> SimEvent {
    let message = match event {
        GameEvent::Score { team, points, .. } => format!("{} scores {}", team, points),
        other => other.kind().as_str().to_string(),
    };
    match event.kind() {
        EventKind::Violation | EventKind::LooseBallScramble | EventKind::CoordinatorChanged => SimEvent::warn(message),
        _ => SimEvent::info(message),
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// (coordinator, events already exported from its bus)
    #[serde(skip)]
    seen_events: Option<(String, u64)>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
            seen_events: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Captures the world as it stands. `events` are harness-side notes
    /// (faults injected, peers crashed).
    pub fn capture(&mut self, world: &SimWorld, mut events: Vec<SimEvent>) {
        let coordinators = world.coordinators();
        let reference = coordinators
            .first()
            .and_then(|id| world.peer(id))
            .or_else(|| world.peers().next());
        let Some(reference) = reference else {
            return;
        };
        let state = reference.inner().state().state();

        // Coordinator events since the previous capture
        if reference.inner().role() == PeerRole::Coordinator {
            let bus = reference.inner().events();
            let key = reference.peer_id().to_string();
            let seen = match &self.seen_events {
                Some((peer, count)) if *peer == key => *count,
                _ => bus.total(),
            };
            let fresh = bus.total().saturating_sub(seen) as usize;
            events.extend(bus.latest(fresh).map(describe));
            self.seen_events = Some((key, bus.total()));
        }

        let peers = world
            .peers()
            .map(|p| PeerFrame {
                peer_id: p.peer_id().to_string(),
                coordinator: p.inner().role() == PeerRole::Coordinator,
                epoch: p.inner().epoch(),
                quality: p.inner().quality().name().to_string(),
                prediction_error: p.inner().prediction().last_error(),
            })
            .collect();

        self.add_frame(SimFrame {
            tick: world.tick_count(),
            time_sec: world.time(),
            coordinator: coordinators.first().map(|id| id.to_string()),
            phase: state.phase.current.name().to_string(),
            score: [state.score.team_a, state.score.team_b],
            carrier: state.ball_carrier.map(|id| id.0),
            actors: state.roster.iter().map(ActorPosition::new).collect(),
            peers,
            events,
        });
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
