use serde::{Deserialize, Serialize};

// --- Ids ---
//
// Entity ids are plain integers assigned by the state store. Connection ids
// live in the hub and are UUIDs; everything durable is an i64.

pub type EventId = i64;
pub type TeamId = i64;
pub type PlayerId = i64;
pub type StationId = i64;
pub type VisitId = i64;
pub type ContentBlockId = i64;
pub type ThreadId = i64;
pub type MessageId = i64;

// --- Enums ---

/// Where a team is in its movement lifecycle.
///
/// `current_station_id` on the team record is non-null exactly when the state
/// is `Assigned` or `InVisit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamState {
    FreeRoam,
    Assigned,
    InVisit,
    Finished,
}

impl std::fmt::Display for TeamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeamState::FreeRoam => write!(f, "free_roam"),
            TeamState::Assigned => write!(f, "assigned"),
            TeamState::InVisit => write!(f, "in_visit"),
            TeamState::Finished => write!(f, "finished"),
        }
    }
}

impl std::str::FromStr for TeamState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free_roam" => Ok(TeamState::FreeRoam),
            "assigned" => Ok(TeamState::Assigned),
            "in_visit" => Ok(TeamState::InVisit),
            "finished" => Ok(TeamState::Finished),
            _ => Err(()),
        }
    }
}

/// Lifecycle of one team's attempt at one station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitState {
    Arrived,
    Started,
    Finished,
}

impl std::fmt::Display for VisitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VisitState::Arrived => write!(f, "arrived"),
            VisitState::Started => write!(f, "started"),
            VisitState::Finished => write!(f, "finished"),
        }
    }
}

impl std::str::FromStr for VisitState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arrived" => Ok(VisitState::Arrived),
            "started" => Ok(VisitState::Started),
            "finished" => Ok(VisitState::Finished),
            _ => Err(()),
        }
    }
}

/// The two symmetric in-team player roles. Content can be addressed to one
/// half of every team via these tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerRole {
    Seeker,
    Keeper,
}

impl std::fmt::Display for PlayerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerRole::Seeker => write!(f, "seeker"),
            PlayerRole::Keeper => write!(f, "keeper"),
        }
    }
}

impl std::str::FromStr for PlayerRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seeker" => Ok(PlayerRole::Seeker),
            "keeper" => Ok(PlayerRole::Keeper),
            _ => Err(()),
        }
    }
}

/// Audience selector on content blocks and dialogue messages.
/// A closed set; resolution to concrete (team, player) pairs is a pure
/// function in the delivery engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    Team,
    Seeker,
    Keeper,
    Player,
}

impl Audience {
    /// Does a player with `role` fall inside this audience?
    /// `Player`-scoped content is matched by explicit id, not by role.
    pub fn matches_role(&self, role: PlayerRole) -> bool {
        match self {
            Audience::Team | Audience::Player => true,
            Audience::Seeker => role == PlayerRole::Seeker,
            Audience::Keeper => role == PlayerRole::Keeper,
        }
    }
}

impl std::fmt::Display for Audience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Audience::Team => write!(f, "team"),
            Audience::Seeker => write!(f, "seeker"),
            Audience::Keeper => write!(f, "keeper"),
            Audience::Player => write!(f, "player"),
        }
    }
}

impl std::str::FromStr for Audience {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "team" => Ok(Audience::Team),
            "seeker" => Ok(Audience::Seeker),
            "keeper" => Ok(Audience::Keeper),
            "player" => Ok(Audience::Player),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogueKind {
    Leaked,
    Interactive,
}

impl std::fmt::Display for DialogueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogueKind::Leaked => write!(f, "leaked"),
            DialogueKind::Interactive => write!(f, "interactive"),
        }
    }
}

impl std::str::FromStr for DialogueKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leaked" => Ok(DialogueKind::Leaked),
            "interactive" => Ok(DialogueKind::Interactive),
            _ => Err(()),
        }
    }
}

/// Access role carried by a verified session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Player,
    StationHost,
    Admin,
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRole::Player => write!(f, "player"),
            UserRole::StationHost => write!(f, "station_host"),
            UserRole::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "player" => Ok(UserRole::Player),
            "station_host" => Ok(UserRole::StationHost),
            "admin" => Ok(UserRole::Admin),
            _ => Err(()),
        }
    }
}

// --- Scope ---

/// What a verified identity is allowed to touch. Produced by the identity
/// resolver, checked by every mutating operation and by the hub on subscribe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub event_id: EventId,
    pub role: UserRole,
    pub team_id: Option<TeamId>,
    pub player_id: Option<PlayerId>,
    pub station_id: Option<StationId>,
}

impl Scope {
    pub fn player(event_id: EventId, team_id: TeamId, player_id: PlayerId) -> Self {
        Self {
            event_id,
            role: UserRole::Player,
            team_id: Some(team_id),
            player_id: Some(player_id),
            station_id: None,
        }
    }

    pub fn host(event_id: EventId, station_id: StationId) -> Self {
        Self {
            event_id,
            role: UserRole::StationHost,
            team_id: None,
            player_id: None,
            station_id: Some(station_id),
        }
    }

    pub fn admin(event_id: EventId) -> Self {
        Self {
            event_id,
            role: UserRole::Admin,
            team_id: None,
            player_id: None,
            station_id: None,
        }
    }
}
