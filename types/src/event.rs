//! Inbound coordinator events.
//!
//! Both delivery channels (push stream and `notifications` poll) carry the
//! same `{type, ...}` JSON objects. [Event::decode] is the single validating
//! step between the wire and the state machine: anything that comes out of it
//! is well-typed and internally consistent.

use crate::{MatchId, Mode, PlayerId, RoundId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid {kind} event: {reason}")]
    Invalid { kind: &'static str, reason: String },
}

fn invalid(kind: &'static str, reason: impl Into<String>) -> DecodeError {
    DecodeError::Invalid {
        kind,
        reason: reason.into(),
    }
}

/// Payload of a `match.found` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchFound {
    pub match_id: MatchId,
    pub mode: Mode,
    pub players: Vec<PlayerId>,
    /// Sides for team modes. Absent means every player is on their own side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teams: Option<Vec<Vec<PlayerId>>>,
    /// Coordinator override of the mode's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounds_to_win: Option<u32>,
    /// Appearance snapshot, forwarded verbatim to the renderer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loadout: Option<serde_json::Value>,
    /// Inventory snapshot, forwarded verbatim to the renderer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<serde_json::Value>,
}

impl MatchFound {
    /// Players sharing a side with `player`, including `player` itself.
    pub fn allies_of(&self, player: &PlayerId) -> HashSet<PlayerId> {
        let team = self
            .teams
            .as_ref()
            .and_then(|teams| teams.iter().find(|team| team.contains(player)));
        match team {
            Some(team) => team.iter().cloned().collect(),
            None => HashSet::from([player.clone()]),
        }
    }

    fn validate(&self) -> Result<(), DecodeError> {
        const KIND: &str = "match.found";
        if self.match_id.is_empty() {
            return Err(invalid(KIND, "empty matchId"));
        }
        if self.players.len() < 2 {
            return Err(invalid(KIND, "fewer than two players"));
        }
        if self.players.len() > self.mode.capacity() {
            return Err(invalid(
                KIND,
                format!(
                    "{} players exceeds {} capacity of {}",
                    self.players.len(),
                    self.mode,
                    self.mode.capacity()
                ),
            ));
        }
        let mut seen = HashSet::with_capacity(self.players.len());
        for player in &self.players {
            if player.is_empty() {
                return Err(invalid(KIND, "empty player id"));
            }
            if !seen.insert(player) {
                return Err(invalid(KIND, format!("duplicate player {player}")));
            }
        }
        if let Some(teams) = &self.teams {
            let mut placed = HashSet::new();
            for member in teams.iter().flatten() {
                if !seen.contains(member) {
                    return Err(invalid(KIND, format!("team member {member} is not a player")));
                }
                if !placed.insert(member) {
                    return Err(invalid(KIND, format!("{member} appears on two teams")));
                }
            }
        }
        if self.rounds_to_win == Some(0) {
            return Err(invalid(KIND, "roundsToWin must be positive"));
        }
        Ok(())
    }
}

/// Payload of a `queue.position` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePosition {
    pub mode: Mode,
    pub position: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u32>,
}

/// Closed set of events the orchestrator reacts to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "queue.position")]
    QueuePosition(QueuePosition),
    #[serde(rename = "match.found")]
    MatchFound(MatchFound),
    /// `roundId`, when the coordinator supplies it, is the id the matching
    /// `match.round` will carry, so a start replayed after its end can be fenced.
    #[serde(rename = "match.round.start", rename_all = "camelCase")]
    RoundStart {
        match_id: MatchId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round_id: Option<RoundId>,
    },
    #[serde(rename = "match.round", rename_all = "camelCase")]
    RoundEnd {
        match_id: MatchId,
        round_id: RoundId,
        winner: PlayerId,
    },
    #[serde(rename = "match.finish", rename_all = "camelCase")]
    Finish { match_id: MatchId, winner: PlayerId },
    #[serde(rename = "match.abort", rename_all = "camelCase")]
    Abort {
        match_id: MatchId,
        #[serde(default)]
        reason: String,
    },
}

impl Event {
    /// Decode and validate one event from its JSON text.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let event: Event = serde_json::from_str(text)?;
        event.validate()?;
        Ok(event)
    }

    /// Decode and validate one event from an already-parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, DecodeError> {
        let event: Event = serde_json::from_value(value)?;
        event.validate()?;
        Ok(event)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::QueuePosition(_) => "queue.position",
            Event::MatchFound(_) => "match.found",
            Event::RoundStart { .. } => "match.round.start",
            Event::RoundEnd { .. } => "match.round",
            Event::Finish { .. } => "match.finish",
            Event::Abort { .. } => "match.abort",
        }
    }

    /// Match the event refers to, if any.
    pub fn match_id(&self) -> Option<&MatchId> {
        match self {
            Event::QueuePosition(_) => None,
            Event::MatchFound(found) => Some(&found.match_id),
            Event::RoundStart { match_id, .. }
            | Event::RoundEnd { match_id, .. }
            | Event::Finish { match_id, .. }
            | Event::Abort { match_id, .. } => Some(match_id),
        }
    }

    fn validate(&self) -> Result<(), DecodeError> {
        let kind = self.kind();
        if let Some(match_id) = self.match_id() {
            if match_id.is_empty() {
                return Err(invalid(kind, "empty matchId"));
            }
        }
        match self {
            Event::MatchFound(found) => found.validate(),
            Event::RoundEnd {
                round_id, winner, ..
            } => {
                if round_id.is_empty() {
                    return Err(invalid(kind, "empty roundId"));
                }
                if winner.is_empty() {
                    return Err(invalid(kind, "empty winner"));
                }
                Ok(())
            }
            Event::RoundStart {
                round_id: Some(round_id),
                ..
            } if round_id.is_empty() => Err(invalid(kind, "empty roundId")),
            Event::Finish { winner, .. } if winner.is_empty() => {
                Err(invalid(kind, "empty winner"))
            }
            _ => Ok(()),
        }
    }
}
