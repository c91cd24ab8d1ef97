//! Request and response bodies exchanged with the coordinator.
//!
//! Field names follow the coordinator's camelCase JSON convention.

use crate::{event::Event, MatchId, Mode, PlayerId, RoundId};
use serde::{Deserialize, Serialize};

/// Phase of a match as reported in liveness pings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Between,
    InRound,
    Finished,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Between => "between",
            Phase::InRound => "inRound",
            Phase::Finished => "finished",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub player: PlayerId,
    pub mode: Mode,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DequeueRequest {
    pub player: PlayerId,
}

/// Generic acknowledgement returned by every mutating coordinator call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// Liveness check. `since` is the number of milliseconds since the caller
/// last observed a state change for the match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    pub player: PlayerId,
    pub match_id: MatchId,
    pub phase: Phase,
    pub since: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextRequest {
    pub player: PlayerId,
    pub match_id: MatchId,
}

/// A round result observed locally, reported so the coordinator can reconcile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundReport {
    pub player: PlayerId,
    pub match_id: MatchId,
    pub round_id: RoundId,
    pub winner: PlayerId,
    pub my_wins: u32,
    pub opp_wins: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishReport {
    pub player: PlayerId,
    pub match_id: MatchId,
    pub winner: PlayerId,
}

/// Response of the `notifications` pull: any subset of pending events.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Notifications {
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

impl Notifications {
    /// Decode every pending event, keeping decode failures alongside the
    /// successes so one bad entry cannot hide the rest.
    pub fn decode(self) -> Vec<Result<Event, crate::DecodeError>> {
        self.events.into_iter().map(Event::from_value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_response_tolerates_missing_optionals() {
        let parsed: EnqueueResponse = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert!(parsed.ok);
        assert_eq!(parsed.ticket_position, None);

        let parsed: EnqueueResponse =
            serde_json::from_str(r#"{"ok":true,"ticketPosition":4}"#).unwrap();
        assert_eq!(parsed.ticket_position, Some(4));
    }

    #[test]
    fn ping_uses_camel_case_fields() {
        let ping = PingRequest {
            player: PlayerId::new("me"),
            match_id: MatchId::new("m1"),
            phase: Phase::InRound,
            since: 1_500,
        };
        let json = serde_json::to_value(&ping).unwrap();
        assert_eq!(json["matchId"], "m1");
        assert_eq!(json["phase"], "inRound");
        assert_eq!(json["since"], 1_500);
    }

    #[test]
    fn notifications_keep_bad_entries_separate() {
        let notifications: Notifications = serde_json::from_str(
            r#"{"events":[
                {"type":"match.round.start","matchId":"m1"},
                {"type":"match.round","matchId":"m1"}
            ]}"#,
        )
        .unwrap();
        let decoded = notifications.decode();
        assert_eq!(decoded.len(), 2);
        assert!(decoded[0].is_ok());
        assert!(decoded[1].is_err());
    }
}
