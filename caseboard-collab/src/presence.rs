//! Ephemeral participant presence.
//!
//! Presence rides the encrypted channel but is explicitly excluded from
//! the replica: never persisted, never merged, lost on disconnect.
//! Each participant republishes its full state on a heartbeat interval;
//! peers not heard from within the grace window (a small multiple of
//! the heartbeat) are treated as departed even without an explicit
//! goodbye. Reconnects must republish, since the relay retains nothing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How often the local state is republished.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Peers silent for longer than this are treated as departed.
pub const GRACE_WINDOW: Duration = Duration::from_secs(15);

/// Minimum interval between cursor rebroadcasts.
const CURSOR_THROTTLE: Duration = Duration::from_millis(33);

/// A cursor position in board coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// The wire-visible per-participant state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub participant_id: Uuid,
    pub name: String,
    /// RGBA cursor/selection color.
    pub color: [f32; 4],
    pub cursor: Option<Point>,
    pub selection: Vec<Uuid>,
    /// Entity currently being edited, if any.
    pub editing_target: Option<Uuid>,
}

impl PresenceState {
    pub fn new(participant_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            participant_id,
            name: name.into(),
            color: stable_color(participant_id),
            cursor: None,
            selection: Vec::new(),
            editing_target: None,
        }
    }
}

/// Stable, visually distinct color from a participant id.
pub fn stable_color(participant_id: Uuid) -> [f32; 4] {
    let hash = participant_id.as_u128();
    let r = (hash & 0xFF) as f32 / 255.0;
    let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
    let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
    [r, g, b, 1.0]
}

/// Presence messages sealed into the sync channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceUpdate {
    /// First publication after (re)connect.
    Hello(PresenceState),
    /// Periodic republication; also sent immediately on local edits.
    Heartbeat(PresenceState),
    /// Clean departure.
    Goodbye { participant_id: Uuid },
}

impl PresenceUpdate {
    pub fn participant_id(&self) -> Uuid {
        match self {
            PresenceUpdate::Hello(state) | PresenceUpdate::Heartbeat(state) => {
                state.participant_id
            }
            PresenceUpdate::Goodbye { participant_id } => *participant_id,
        }
    }
}

/// A remote participant as tracked locally.
#[derive(Debug, Clone)]
pub struct PresenceRecord {
    pub state: PresenceState,
    /// When we last heard from this participant.
    pub last_heartbeat: Instant,
}

impl PresenceRecord {
    fn new(state: PresenceState) -> Self {
        Self {
            state,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn is_stale(&self, grace: Duration) -> bool {
        self.last_heartbeat.elapsed() > grace
    }
}

/// Tracks the local participant's state and every remote participant.
pub struct PresenceRoster {
    local: PresenceState,
    remotes: HashMap<Uuid, PresenceRecord>,
    grace: Duration,
    last_cursor_broadcast: Instant,
}

impl PresenceRoster {
    pub fn new(participant_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            local: PresenceState::new(participant_id, name),
            remotes: HashMap::new(),
            grace: GRACE_WINDOW,
            last_cursor_broadcast: Instant::now() - CURSOR_THROTTLE,
        }
    }

    /// Override the grace window (tests).
    pub fn with_grace(participant_id: Uuid, name: impl Into<String>, grace: Duration) -> Self {
        let mut roster = Self::new(participant_id, name);
        roster.grace = grace;
        roster
    }

    pub fn local_state(&self) -> &PresenceState {
        &self.local
    }

    pub fn participant_id(&self) -> Uuid {
        self.local.participant_id
    }

    // ─── Incoming ─────────────────────────────────────────────────────

    /// Fold one remote update into the roster. Our own messages echoed
    /// back by the relay are ignored.
    pub fn handle_update(&mut self, update: &PresenceUpdate) {
        if update.participant_id() == self.local.participant_id {
            return;
        }
        match update {
            PresenceUpdate::Hello(state) | PresenceUpdate::Heartbeat(state) => {
                self.remotes
                    .insert(state.participant_id, PresenceRecord::new(state.clone()));
            }
            PresenceUpdate::Goodbye { participant_id } => {
                self.remotes.remove(participant_id);
            }
        }
    }

    // ─── Outgoing ─────────────────────────────────────────────────────

    pub fn hello_message(&self) -> PresenceUpdate {
        PresenceUpdate::Hello(self.local.clone())
    }

    pub fn heartbeat_message(&self) -> PresenceUpdate {
        PresenceUpdate::Heartbeat(self.local.clone())
    }

    pub fn goodbye_message(&self) -> PresenceUpdate {
        PresenceUpdate::Goodbye {
            participant_id: self.local.participant_id,
        }
    }

    /// Update the local cursor. Returns a message to broadcast unless
    /// throttled; a dropped cursor frame is superseded by the next one.
    pub fn set_cursor(&mut self, cursor: Option<Point>) -> Option<PresenceUpdate> {
        self.local.cursor = cursor;
        if self.last_cursor_broadcast.elapsed() < CURSOR_THROTTLE {
            return None;
        }
        self.last_cursor_broadcast = Instant::now();
        Some(self.heartbeat_message())
    }

    /// Update the local selection; always broadcast immediately.
    pub fn set_selection(&mut self, selection: Vec<Uuid>) -> PresenceUpdate {
        self.local.selection = selection;
        self.heartbeat_message()
    }

    /// Mark the entity the local participant is editing.
    pub fn set_editing_target(&mut self, target: Option<Uuid>) -> PresenceUpdate {
        self.local.editing_target = target;
        self.heartbeat_message()
    }

    /// Update the local identity; always broadcast immediately.
    pub fn set_identity(&mut self, name: impl Into<String>, color: Option<[f32; 4]>) -> PresenceUpdate {
        self.local.name = name.into();
        if let Some(color) = color {
            self.local.color = color;
        }
        self.heartbeat_message()
    }

    // ─── Roster reads ─────────────────────────────────────────────────

    /// Remote participants heard from within the grace window.
    /// Staleness excludes a peer even before the next prune tick.
    pub fn remote_records(&self) -> Vec<PresenceRecord> {
        self.remotes
            .values()
            .filter(|r| !r.is_stale(self.grace))
            .cloned()
            .collect()
    }

    /// Count of live remote participants.
    pub fn remote_count(&self) -> usize {
        self.remotes
            .values()
            .filter(|r| !r.is_stale(self.grace))
            .count()
    }

    pub fn remote(&self, participant_id: Uuid) -> Option<&PresenceRecord> {
        self.remotes
            .get(&participant_id)
            .filter(|r| !r.is_stale(self.grace))
    }

    /// Drop peers past the grace window; returns who was pruned.
    pub fn prune_stale(&mut self) -> Vec<Uuid> {
        let grace = self.grace;
        let stale: Vec<Uuid> = self
            .remotes
            .iter()
            .filter(|(_, record)| record.is_stale(grace))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.remotes.remove(id);
            log::debug!("Presence: pruned stale participant {id}");
        }
        stale
    }

    /// Forget all remote state (disconnect, unshare).
    pub fn clear_remotes(&mut self) {
        self.remotes.clear();
    }
}
