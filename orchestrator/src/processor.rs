//! Round Outcome Processor: the only code that mutates a [MatchSession].
//!
//! Every entry point is idempotent. Round ends are fenced by round id, and
//! finish and abort are gated by the session's `finished` flag. Each call
//! reports what it did as an [Applied] so the engine can derive side effects
//! (watchdog, ledger, notices) from one place.

use crate::session::{MatchSession, Resolution};
use skirmish_types::{Event, Phase, PlayerId, RoundId};
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// Already applied; nothing changed.
    Duplicate,
    /// Valid but not applicable in the current phase; nothing changed.
    Ignored,
    Transitioned { from: Phase, to: Phase },
    Concluded(Resolution),
    /// Addressed to another match.
    ForeignMatch,
}

impl Applied {
    pub fn changed(&self) -> bool {
        matches!(self, Applied::Transitioned { .. } | Applied::Concluded(_))
    }
}

/// `round_id` is optional on the wire. When present and already fenced, the
/// round has ended and the start is stale.
pub fn apply_round_start(
    session: &mut MatchSession,
    round_id: Option<&RoundId>,
    now: Instant,
) -> Applied {
    if round_id.is_some_and(|round_id| session.fence.contains(round_id)) {
        return Applied::Duplicate;
    }
    match session.phase {
        Phase::Between => {
            let from = session.enter(Phase::InRound, now);
            Applied::Transitioned {
                from,
                to: Phase::InRound,
            }
        }
        Phase::InRound => Applied::Duplicate,
        Phase::Finished => Applied::Ignored,
    }
}

pub fn apply_round_end(
    session: &mut MatchSession,
    round_id: &RoundId,
    winner: &PlayerId,
    now: Instant,
) -> Applied {
    if session.fence.contains(round_id) {
        return Applied::Duplicate;
    }
    if session.finished {
        return Applied::Ignored;
    }
    session.fence.insert(round_id.clone());

    // A round end seen before its start implies the start.
    let from = session.phase;
    if session.is_ally(winner) {
        session.my_wins += 1;
    } else {
        session.opp_wins += 1;
    }
    debug!(
        match_id = %session.id(),
        %round_id,
        %winner,
        my_wins = session.my_wins,
        opp_wins = session.opp_wins,
        implicit_start = from == Phase::Between,
        "round applied"
    );

    match session.decided() {
        Some(resolution) => {
            session.conclude(resolution, now);
            Applied::Concluded(resolution)
        }
        None => {
            session.enter(Phase::Between, now);
            Applied::Transitioned {
                from,
                to: Phase::Between,
            }
        }
    }
}

/// Authoritative finish. The coordinator's winner decides; the score is left as is.
pub fn apply_finish(session: &mut MatchSession, winner: &PlayerId, now: Instant) -> Applied {
    if session.finished {
        return Applied::Duplicate;
    }
    let resolution = if session.is_ally(winner) {
        Resolution::Won
    } else {
        Resolution::Lost
    };
    session.conclude(resolution, now);
    Applied::Concluded(resolution)
}

pub fn apply_abort(session: &mut MatchSession, reason: &str, now: Instant) -> Applied {
    if session.finished {
        return Applied::Duplicate;
    }
    debug!(match_id = %session.id(), reason, "match aborted");
    session.conclude(Resolution::Aborted, now);
    Applied::Concluded(Resolution::Aborted)
}

/// Route a match event to its entry point. Queue events are not session events.
pub fn apply(session: &mut MatchSession, event: &Event, now: Instant) -> Applied {
    match event.match_id() {
        Some(match_id) if match_id == session.id() => {}
        Some(_) => return Applied::ForeignMatch,
        None => return Applied::Ignored,
    }
    match event {
        Event::RoundStart { round_id, .. } => apply_round_start(session, round_id.as_ref(), now),
        Event::RoundEnd {
            round_id, winner, ..
        } => apply_round_end(session, round_id, winner, now),
        Event::Finish { winner, .. } => apply_finish(session, winner, now),
        Event::Abort { reason, .. } => apply_abort(session, reason, now),
        // The session already exists; a repeated match-found changes nothing.
        Event::MatchFound(_) => Applied::Duplicate,
        Event::QueuePosition(_) => Applied::Ignored,
    }
}
