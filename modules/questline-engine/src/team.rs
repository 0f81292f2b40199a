//! Team movement state machine.
//!
//! `free_roam → assigned → in_visit → free_roam`, with `assigned → free_roam`
//! as the organizer recall path and `in_visit → finished` once the event's
//! closing condition holds. Transitions are pure: they take the current
//! record and return the new record plus the envelope to publish, leaving
//! persistence to the caller's transactional boundary.
//!
//! Invariant, re-established by every transition: `current_station_id` is
//! non-null exactly when the state is `assigned` or `in_visit`.

use questline_common::{Envelope, QuestlineError, StationId, TeamState};
use questline_store::Team;

/// Send a team toward a station. Valid from `free_roam` (first assignment)
/// or `assigned` (reassignment before the team arrives).
pub fn assign(team: &Team, station_id: StationId) -> Result<(Team, Envelope), QuestlineError> {
    match team.current_state {
        TeamState::FreeRoam | TeamState::Assigned => {}
        state => {
            return Err(QuestlineError::InvalidTransition(format!(
                "cannot assign team {} while {state}",
                team.id
            )))
        }
    }

    let updated = Team {
        current_state: TeamState::Assigned,
        current_station_id: Some(station_id),
        ..team.clone()
    };
    let envelope = state_envelope(&updated);
    Ok((updated, envelope))
}

/// Recall an assigned team back to free roam.
pub fn recall(team: &Team) -> Result<(Team, Envelope), QuestlineError> {
    if team.current_state != TeamState::Assigned {
        return Err(QuestlineError::InvalidTransition(format!(
            "cannot recall team {} while {}",
            team.id, team.current_state
        )));
    }

    let updated = Team {
        current_state: TeamState::FreeRoam,
        current_station_id: None,
        ..team.clone()
    };
    let envelope = state_envelope(&updated);
    Ok((updated, envelope))
}

/// Begin a visit. Valid only from `assigned`, and only at the assigned
/// station — a scan at any other station is a data inconsistency between
/// assignment and scan, surfaced as `StationMismatch`.
pub fn enter_visit(team: &Team, station_id: StationId) -> Result<(Team, Envelope), QuestlineError> {
    if team.current_state != TeamState::Assigned {
        return Err(QuestlineError::InvalidTransition(format!(
            "cannot enter visit for team {} while {}",
            team.id, team.current_state
        )));
    }
    match team.current_station_id {
        Some(expected) if expected == station_id => {}
        Some(expected) => {
            return Err(QuestlineError::StationMismatch { expected, actual: station_id })
        }
        None => {
            return Err(QuestlineError::InvalidTransition(format!(
                "team {} is assigned with no station",
                team.id
            )))
        }
    }

    let updated = Team { current_state: TeamState::InVisit, ..team.clone() };
    let envelope = state_envelope(&updated);
    Ok((updated, envelope))
}

/// End a visit. Returns the team to `free_roam`, or to `finished` when the
/// event's closing condition (owned by an external policy, passed in as a
/// predicate result) is met.
pub fn exit_visit(team: &Team, event_complete: bool) -> Result<(Team, Envelope), QuestlineError> {
    if team.current_state != TeamState::InVisit {
        return Err(QuestlineError::InvalidTransition(format!(
            "cannot exit visit for team {} while {}",
            team.id, team.current_state
        )));
    }

    let updated = Team {
        current_state: if event_complete { TeamState::Finished } else { TeamState::FreeRoam },
        current_station_id: None,
        ..team.clone()
    };
    let envelope = state_envelope(&updated);
    Ok((updated, envelope))
}

/// The `team:state` envelope carrying the team's full new state.
pub fn state_envelope(team: &Team) -> Envelope {
    Envelope::TeamStateChanged {
        team_id: team.id,
        state: team.current_state,
        station_id: team.current_station_id,
    }
}

/// The invariant every transition must re-establish.
pub fn station_invariant_holds(team: &Team) -> bool {
    let needs_station =
        matches!(team.current_state, TeamState::Assigned | TeamState::InVisit);
    team.current_station_id.is_some() == needs_station
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use questline_common::TeamState;

    fn team(state: TeamState, station: Option<i64>) -> Team {
        Team {
            id: 1,
            event_id: 1,
            name: "t1".into(),
            status: "active".into(),
            score_total: 0.0,
            current_state: state,
            current_station_id: station,
            progress: serde_json::Value::Object(Default::default()),
            scan_token: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn assign_from_free_roam_and_reassign() {
        let (t, env) = assign(&team(TeamState::FreeRoam, None), 7).unwrap();
        assert_eq!(t.current_state, TeamState::Assigned);
        assert_eq!(t.current_station_id, Some(7));
        assert!(station_invariant_holds(&t));
        assert!(matches!(env, Envelope::TeamStateChanged { station_id: Some(7), .. }));

        let (t2, _) = assign(&t, 9).unwrap();
        assert_eq!(t2.current_station_id, Some(9));
    }

    #[test]
    fn assign_rejected_in_visit_and_finished() {
        for state in [TeamState::InVisit, TeamState::Finished] {
            let station = if state == TeamState::InVisit { Some(3) } else { None };
            let err = assign(&team(state, station), 7).unwrap_err();
            assert!(matches!(err, QuestlineError::InvalidTransition(_)));
        }
    }

    #[test]
    fn recall_only_from_assigned() {
        let (t, _) = recall(&team(TeamState::Assigned, Some(7))).unwrap();
        assert_eq!(t.current_state, TeamState::FreeRoam);
        assert_eq!(t.current_station_id, None);
        assert!(station_invariant_holds(&t));

        assert!(recall(&team(TeamState::FreeRoam, None)).is_err());
        assert!(recall(&team(TeamState::InVisit, Some(7))).is_err());
    }

    #[test]
    fn enter_visit_requires_matching_station() {
        let assigned = team(TeamState::Assigned, Some(7));

        let (t, _) = enter_visit(&assigned, 7).unwrap();
        assert_eq!(t.current_state, TeamState::InVisit);
        assert!(station_invariant_holds(&t));

        let err = enter_visit(&assigned, 8).unwrap_err();
        assert!(matches!(err, QuestlineError::StationMismatch { expected: 7, actual: 8 }));

        assert!(enter_visit(&team(TeamState::FreeRoam, None), 7).is_err());
    }

    #[test]
    fn exit_visit_routes_on_closing_condition() {
        let in_visit = team(TeamState::InVisit, Some(7));

        let (roaming, _) = exit_visit(&in_visit, false).unwrap();
        assert_eq!(roaming.current_state, TeamState::FreeRoam);
        assert!(station_invariant_holds(&roaming));

        let (done, _) = exit_visit(&in_visit, true).unwrap();
        assert_eq!(done.current_state, TeamState::Finished);
        assert_eq!(done.current_station_id, None);
        assert!(station_invariant_holds(&done));

        assert!(exit_visit(&team(TeamState::FreeRoam, None), false).is_err());
    }
}
