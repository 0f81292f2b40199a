//! Core types for the audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use questline_common::{EventId, PlayerId, TeamId};

/// An audit fact as stored. Returned by all read methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub event_id: EventId,
    pub team_id: Option<TeamId>,
    pub player_id: Option<PlayerId>,
    pub entry_type: String,
    pub data: serde_json::Value,
}

/// A fact to be appended. The caller builds this; the log assigns seq/ts.
#[derive(Debug, Clone)]
pub struct AppendEntry {
    pub event_id: EventId,
    pub team_id: Option<TeamId>,
    pub player_id: Option<PlayerId>,
    pub entry_type: String,
    pub data: serde_json::Value,
}

impl AppendEntry {
    pub fn new(event_id: EventId, entry_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_id,
            team_id: None,
            player_id: None,
            entry_type: entry_type.into(),
            data,
        }
    }

    pub fn with_team(mut self, team_id: TeamId) -> Self {
        self.team_id = Some(team_id);
        self
    }

    pub fn with_player(mut self, player_id: PlayerId) -> Self {
        self.player_id = Some(player_id);
        self
    }
}
