//! Channel names and envelope kinds — the wire contract of the hub.
//!
//! Channel names and envelope tags are bit-exact across implementations:
//! `event:{id}`, `team:{id}`, `station:{id}`, `admin:{id}`. Envelopes are
//! notifications of change, not the source of truth; a reconnecting client
//! reconciles by re-fetching state, not by replaying these.

use serde::{Deserialize, Serialize};

use crate::types::{
    ContentBlockId, EventId, PlayerId, StationId, TeamId, TeamState, VisitId,
};

// --- Channels ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Event(EventId),
    Team(TeamId),
    Station(StationId),
    Admin(EventId),
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Event(id) => write!(f, "event:{id}"),
            Channel::Team(id) => write!(f, "team:{id}"),
            Channel::Station(id) => write!(f, "station:{id}"),
            Channel::Admin(id) => write!(f, "admin:{id}"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s.split_once(':').ok_or(())?;
        let id: i64 = id.parse().map_err(|_| ())?;
        match kind {
            "event" => Ok(Channel::Event(id)),
            "team" => Ok(Channel::Team(id)),
            "station" => Ok(Channel::Station(id)),
            "admin" => Ok(Channel::Admin(id)),
            _ => Err(()),
        }
    }
}

// --- Envelopes ---

/// A typed notification of a state change, published once per effective
/// change. Serializes as `{"event": "<kind>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Envelope {
    #[serde(rename = "team:state")]
    TeamStateChanged {
        team_id: TeamId,
        state: TeamState,
        station_id: Option<StationId>,
    },

    #[serde(rename = "content:delivered")]
    ContentDelivered {
        team_id: TeamId,
        #[serde(skip_serializing_if = "Option::is_none")]
        player_id: Option<PlayerId>,
        content_block_id: ContentBlockId,
    },

    #[serde(rename = "visit:started")]
    VisitStarted {
        visit_id: VisitId,
        team_id: TeamId,
        station_id: StationId,
    },

    #[serde(rename = "visit:finished")]
    VisitFinished {
        visit_id: VisitId,
        points: f64,
        ratings: Option<i32>,
    },

    #[serde(rename = "admin:team_update")]
    AdminTeamUpdate {
        team_id: TeamId,
        #[serde(flatten)]
        team: serde_json::Value,
    },

    #[serde(rename = "admin:visit_update")]
    AdminVisitUpdate { visit_id: VisitId },

    #[serde(rename = "admin:log_entry")]
    AdminLogEntry {
        #[serde(flatten)]
        entry: serde_json::Value,
    },
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::TeamStateChanged { .. } => "team:state",
            Envelope::ContentDelivered { .. } => "content:delivered",
            Envelope::VisitStarted { .. } => "visit:started",
            Envelope::VisitFinished { .. } => "visit:finished",
            Envelope::AdminTeamUpdate { .. } => "admin:team_update",
            Envelope::AdminVisitUpdate { .. } => "admin:visit_update",
            Envelope::AdminLogEntry { .. } => "admin:log_entry",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn channel_names_are_stable() {
        assert_eq!(Channel::Event(3).to_string(), "event:3");
        assert_eq!(Channel::Team(5).to_string(), "team:5");
        assert_eq!(Channel::Station(9).to_string(), "station:9");
        assert_eq!(Channel::Admin(3).to_string(), "admin:3");
    }

    #[test]
    fn channel_roundtrip() {
        for name in ["event:1", "team:42", "station:7", "admin:1"] {
            let ch = Channel::from_str(name).unwrap();
            assert_eq!(ch.to_string(), name);
        }
        assert!(Channel::from_str("team").is_err());
        assert!(Channel::from_str("dungeon:5").is_err());
        assert!(Channel::from_str("team:abc").is_err());
    }

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::TeamStateChanged {
            team_id: 5,
            state: TeamState::Assigned,
            station_id: Some(2),
        };
        let v: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(v["event"], "team:state");
        assert_eq!(v["data"]["team_id"], 5);
        assert_eq!(v["data"]["state"], "assigned");
        assert_eq!(v["data"]["station_id"], 2);
    }

    #[test]
    fn team_delivery_omits_player_id() {
        let env = Envelope::ContentDelivered {
            team_id: 2,
            player_id: None,
            content_block_id: 10,
        };
        let v: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert!(v["data"].get("player_id").is_none());
    }
}
