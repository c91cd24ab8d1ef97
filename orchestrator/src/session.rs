//! Match Session: the per-match state machine.
//!
//! ```text
//!            round start               round end (undecided)
//!   Between ─────────────▶ InRound ─────────────────────────▶ Between
//!      │                      │
//!      │  round end (decided) │  round end (decided)
//!      │  finish / abort      │  finish / abort
//!      ▼                      ▼
//!   Finished ◀────────────────┘          (terminal, absorbing)
//! ```
//!
//! Only [crate::processor] mutates a session. Every accepted transition moves
//! `last_change_at` forward; once `finished` is set nothing moves again.

use serde_json::Value;
use skirmish_types::{MatchFound, MatchId, Mode, Phase, PlayerId, RoundId};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// How a finished match ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Resolution {
    Won,
    Lost,
    /// Ended by the coordinator without a winner. Not ranked.
    Aborted,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Won => "won",
            Resolution::Lost => "lost",
            Resolution::Aborted => "aborted",
        }
    }

    /// Whether the result counts towards the rank ledger.
    pub fn is_ranked(&self) -> bool {
        !matches!(self, Resolution::Aborted)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("match {match_id} does not include local player {player}")]
    NotAParticipant { match_id: MatchId, player: PlayerId },
    #[error("rounds_to_win must be positive")]
    ZeroRoundsToWin,
}

#[derive(Debug)]
pub struct MatchSession {
    id: MatchId,
    mode: Mode,
    players: Vec<PlayerId>,
    allies: HashSet<PlayerId>,
    pub(crate) my_wins: u32,
    pub(crate) opp_wins: u32,
    rounds_to_win: u32,
    pub(crate) phase: Phase,
    pub(crate) fence: HashSet<RoundId>,
    pub(crate) last_change_at: Instant,
    pub(crate) finished: bool,
    pub(crate) resolution: Option<Resolution>,
    loadout: Option<Value>,
    inventory: Option<Value>,
}

impl MatchSession {
    /// Build a session from an accepted match-found. `configured` is the
    /// rounds-to-win used when the coordinator does not override it.
    pub fn from_found(
        found: MatchFound,
        local: &PlayerId,
        configured: u32,
        now: Instant,
    ) -> Result<Self, SessionError> {
        if !found.players.contains(local) {
            return Err(SessionError::NotAParticipant {
                match_id: found.match_id,
                player: local.clone(),
            });
        }
        let rounds_to_win = found.rounds_to_win.unwrap_or(configured);
        if rounds_to_win == 0 {
            return Err(SessionError::ZeroRoundsToWin);
        }
        let allies = found.allies_of(local);
        Ok(Self {
            id: found.match_id,
            mode: found.mode,
            players: found.players,
            allies,
            my_wins: 0,
            opp_wins: 0,
            rounds_to_win,
            phase: Phase::Between,
            fence: HashSet::new(),
            last_change_at: now,
            finished: false,
            resolution: None,
            loadout: found.loadout,
            inventory: found.inventory,
        })
    }

    pub fn id(&self) -> &MatchId {
        &self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn players(&self) -> &[PlayerId] {
        &self.players
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// `(my_wins, opp_wins)`.
    pub fn score(&self) -> (u32, u32) {
        (self.my_wins, self.opp_wins)
    }

    pub fn rounds_to_win(&self) -> u32 {
        self.rounds_to_win
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    pub fn is_ally(&self, player: &PlayerId) -> bool {
        self.allies.contains(player)
    }

    pub fn has_applied(&self, round_id: &RoundId) -> bool {
        self.fence.contains(round_id)
    }

    pub fn rounds_applied(&self) -> usize {
        self.fence.len()
    }

    pub fn last_change_at(&self) -> Instant {
        self.last_change_at
    }

    pub fn since_last_change(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_change_at)
    }

    pub fn loadout(&self) -> Option<&Value> {
        self.loadout.as_ref()
    }

    pub fn inventory(&self) -> Option<&Value> {
        self.inventory.as_ref()
    }

    /// Resolution implied by the current tally, if the match is decided.
    pub fn decided(&self) -> Option<Resolution> {
        if self.my_wins >= self.rounds_to_win {
            Some(Resolution::Won)
        } else if self.opp_wins >= self.rounds_to_win {
            Some(Resolution::Lost)
        } else {
            None
        }
    }

    pub(crate) fn enter(&mut self, phase: Phase, now: Instant) -> Phase {
        let from = self.phase;
        self.phase = phase;
        self.last_change_at = now;
        from
    }

    pub(crate) fn conclude(&mut self, resolution: Resolution, now: Instant) -> Phase {
        self.finished = true;
        self.resolution = Some(resolution);
        self.enter(Phase::Finished, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn found() -> MatchFound {
        MatchFound {
            match_id: "m1".into(),
            mode: Mode::Team2,
            players: ["me", "mate", "x", "y"].map(PlayerId::new).to_vec(),
            teams: Some(vec![
                vec![PlayerId::new("me"), PlayerId::new("mate")],
                vec![PlayerId::new("x"), PlayerId::new("y")],
            ]),
            rounds_to_win: None,
            loadout: Some(serde_json::json!({"skin": "red"})),
            inventory: None,
        }
    }

    #[test]
    fn builds_from_match_found() {
        let now = Instant::now();
        let session = MatchSession::from_found(found(), &PlayerId::new("me"), 3, now).unwrap();
        assert_eq!(session.phase(), Phase::Between);
        assert_eq!(session.rounds_to_win(), 3);
        assert_eq!(session.score(), (0, 0));
        assert!(session.is_ally(&PlayerId::new("mate")));
        assert!(!session.is_ally(&PlayerId::new("x")));
        assert_eq!(session.loadout(), Some(&serde_json::json!({"skin": "red"})));
        assert!(!session.is_finished());
    }

    #[test]
    fn coordinator_rounds_to_win_overrides_configured() {
        let mut found = found();
        found.rounds_to_win = Some(1);
        let session =
            MatchSession::from_found(found, &PlayerId::new("me"), 3, Instant::now()).unwrap();
        assert_eq!(session.rounds_to_win(), 1);
    }

    #[test]
    fn rejects_match_without_local_player() {
        let err = MatchSession::from_found(found(), &PlayerId::new("stranger"), 2, Instant::now())
            .unwrap_err();
        assert!(matches!(err, SessionError::NotAParticipant { .. }));

        let err = MatchSession::from_found(found(), &PlayerId::new("me"), 0, Instant::now())
            .unwrap_err();
        assert_eq!(err, SessionError::ZeroRoundsToWin);
    }
}
