//! Audience resolution for the delivery engine.
//!
//! A content block's audience selector plus a target scope resolve to a
//! concrete set of (team, player?) pairs by a pure function. The engine then
//! attempts one unique-constraint insert per pair; conflicts mean "already
//! delivered" and produce no second envelope, which is what makes delivery
//! safe to retry or re-trigger from a scheduler.

use serde::{Deserialize, Serialize};

use questline_common::{Audience, PlayerId, QuestlineError, TeamId};
use questline_store::{Player, Team};

/// Which slice of the event a delivery is aimed at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudienceTarget {
    /// Every team in the event.
    AllTeams,
    /// An explicit set of teams.
    Teams { team_ids: Vec<TeamId> },
    /// Exactly one player, named explicitly.
    Player { player_id: PlayerId },
}

/// Resolve a block audience over a set of teams and their players into
/// concrete delivery pairs. `players` must hold the players of the given
/// teams; team-wide audiences ignore it.
///
/// `Audience::Player` is not resolved here — it requires an explicit player
/// id from the target and is handled by the engine directly.
pub fn resolve_pairs(
    audience: Audience,
    teams: &[Team],
    players: &[Player],
) -> Result<Vec<(TeamId, Option<PlayerId>)>, QuestlineError> {
    match audience {
        Audience::Team => Ok(teams.iter().map(|t| (t.id, None)).collect()),
        Audience::Seeker | Audience::Keeper => {
            let mut pairs = Vec::new();
            for team in teams {
                for player in players.iter().filter(|p| p.team_id == Some(team.id)) {
                    if player.role.is_some_and(|r| audience.matches_role(r)) {
                        pairs.push((team.id, Some(player.id)));
                    }
                }
            }
            Ok(pairs)
        }
        Audience::Player => Err(QuestlineError::InvalidTransition(
            "player-scoped content requires an explicit player target".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use questline_common::PlayerRole;

    fn team(id: TeamId) -> Team {
        Team {
            id,
            event_id: 1,
            name: format!("team-{id}"),
            status: "active".into(),
            score_total: 0.0,
            current_state: questline_common::TeamState::FreeRoam,
            current_station_id: None,
            progress: serde_json::Value::Object(Default::default()),
            scan_token: None,
            created_at: Utc::now(),
        }
    }

    fn player(id: PlayerId, team_id: TeamId, role: PlayerRole) -> Player {
        Player {
            id,
            event_id: 1,
            external_id: format!("ext-{id}"),
            team_id: Some(team_id),
            role: Some(role),
            progress: serde_json::Value::Object(Default::default()),
            flags: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn team_audience_yields_one_pair_per_team() {
        let teams = vec![team(1), team(2)];
        let pairs = resolve_pairs(Audience::Team, &teams, &[]).unwrap();
        assert_eq!(pairs, vec![(1, None), (2, None)]);
    }

    #[test]
    fn role_audience_yields_one_pair_per_matching_player() {
        let teams = vec![team(1), team(2)];
        let players = vec![
            player(10, 1, PlayerRole::Seeker),
            player(11, 1, PlayerRole::Keeper),
            player(20, 2, PlayerRole::Seeker),
        ];

        let pairs = resolve_pairs(Audience::Seeker, &teams, &players).unwrap();
        assert_eq!(pairs, vec![(1, Some(10)), (2, Some(20))]);

        let pairs = resolve_pairs(Audience::Keeper, &teams, &players).unwrap();
        assert_eq!(pairs, vec![(1, Some(11))]);
    }

    #[test]
    fn player_audience_is_not_resolved_in_bulk() {
        assert!(resolve_pairs(Audience::Player, &[team(1)], &[]).is_err());
    }
}
