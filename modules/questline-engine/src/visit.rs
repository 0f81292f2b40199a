//! Visit lifecycle: `arrived → started → finished`, one instance per
//! (team, station) attempt.
//!
//! `start` tolerates client retries on a flaky network: a second call is a
//! no-op returning the existing record. `finish` is deliberately not
//! idempotent — points must never be double-awarded — so a repeat comes back
//! as `AlreadyFinished`, distinct from a transport-retry no-op.

use chrono::{DateTime, Utc};

use questline_common::{Envelope, QuestlineError, VisitState};
use questline_store::StationVisit;

/// Outcome of a `start` call.
pub enum StartOutcome {
    /// First start: persist the record and publish the envelope.
    Started(StationVisit, Envelope),
    /// Retry of an already-started visit: nothing to persist or publish.
    AlreadyStarted(StationVisit),
}

pub fn start(visit: &StationVisit, now: DateTime<Utc>) -> Result<StartOutcome, QuestlineError> {
    match visit.state {
        VisitState::Arrived => {}
        VisitState::Started => return Ok(StartOutcome::AlreadyStarted(visit.clone())),
        VisitState::Finished => {
            return Err(QuestlineError::InvalidTransition(format!(
                "cannot start finished visit {}",
                visit.id
            )))
        }
    }

    let updated =
        StationVisit { state: VisitState::Started, started_at: Some(now), ..visit.clone() };
    let envelope = Envelope::VisitStarted {
        visit_id: updated.id,
        team_id: updated.team_id,
        station_id: updated.station_id,
    };
    Ok(StartOutcome::Started(updated, envelope))
}

pub fn finish(
    visit: &StationVisit,
    points: f64,
    host_notes: Option<String>,
    host_rating: Option<i32>,
    now: DateTime<Utc>,
) -> Result<(StationVisit, Envelope), QuestlineError> {
    match visit.state {
        VisitState::Started => {}
        VisitState::Finished => return Err(QuestlineError::AlreadyFinished),
        VisitState::Arrived => {
            return Err(QuestlineError::InvalidTransition(format!(
                "cannot finish visit {} before it starts",
                visit.id
            )))
        }
    }

    let updated = StationVisit {
        state: VisitState::Finished,
        ended_at: Some(now),
        points_awarded: points,
        host_notes,
        host_rating,
        ..visit.clone()
    };
    let envelope = Envelope::VisitFinished {
        visit_id: updated.id,
        points,
        ratings: host_rating,
    };
    Ok((updated, envelope))
}
