//! The orchestrator engine.
//!
//! One [Actor] task owns the queue, the active [MatchSession], the watchdog and
//! the rank ledger. Commands arrive through its [Mailbox]; events arrive from
//! the push feed and the notifications poll and are routed through the same
//! processor entry points. Everything the rendering engine needs to know is
//! broadcast as a [Notice].

mod actor;
mod ingress;
#[cfg(test)]
mod tests;

use crate::{
    queue::QueueTicket,
    session::{MatchSession, Resolution},
    watchdog::WatchdogConfig,
};
pub use actor::Actor;
pub use ingress::{Mailbox, Message};
use serde_json::Value;
use skirmish_types::{MatchId, Mode, Phase, PlayerId, RoundId};
use std::{collections::HashMap, time::Duration};

/// Configuration for the [Actor].
#[derive(Clone, Debug)]
pub struct Config {
    pub player: PlayerId,
    pub mailbox_size: usize,
    pub notice_buffer: usize,
    /// Upper bound on every outbound call, including opening the push feed.
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub housekeeping_interval: Duration,
    /// How long a cancelled ticket may still admit a match-found.
    pub cancel_grace: Duration,
    pub push_enabled: bool,
    /// Per-mode overrides; modes not listed use [Mode::default_rounds_to_win].
    pub rounds_to_win: HashMap<Mode, u32>,
    pub watchdog: WatchdogConfig,
}

impl Config {
    pub fn rounds_to_win(&self, mode: Mode) -> u32 {
        self.rounds_to_win
            .get(&mode)
            .copied()
            .unwrap_or_else(|| mode.default_rounds_to_win())
    }
}

/// Message from the engine to the rendering/UI layer.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    Queued {
        mode: Mode,
        position: Option<u32>,
    },
    QueuePosition {
        mode: Mode,
        position: u32,
        eta_secs: Option<u32>,
    },
    QueueFailed {
        mode: Mode,
        reason: String,
        retryable: bool,
    },
    MatchStarted {
        match_id: MatchId,
        mode: Mode,
        players: Vec<PlayerId>,
        rounds_to_win: u32,
        loadout: Option<Value>,
        inventory: Option<Value>,
    },
    RoundStarted {
        match_id: MatchId,
    },
    RoundEnded {
        match_id: MatchId,
        round_id: RoundId,
        winner: PlayerId,
        my_wins: u32,
        opp_wins: u32,
    },
    /// A locally observed round was sent to the coordinator. Provisional until
    /// the coordinator's own `RoundEnded` arrives.
    RoundReported(RoundReport),
    MatchFinished {
        match_id: MatchId,
        mode: Mode,
        resolution: Resolution,
        my_wins: u32,
        opp_wins: u32,
    },
    MatchAborted {
        match_id: MatchId,
        reason: String,
    },
}

/// A locally observed round result as forwarded to the coordinator.
///
/// The score is the coordinator's tally plus local reports it has not
/// confirmed yet; the session itself only moves on coordinator events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundReport {
    pub match_id: MatchId,
    pub round_id: RoundId,
    pub winner: PlayerId,
    pub my_wins: u32,
    pub opp_wins: u32,
    /// The provisional score reaches `rounds_to_win`, so a finish was reported too.
    pub decisive: bool,
}

/// Read-only copy of a session for status queries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionView {
    pub match_id: MatchId,
    pub mode: Mode,
    pub phase: Phase,
    pub my_wins: u32,
    pub opp_wins: u32,
    pub rounds_to_win: u32,
    pub resolution: Option<Resolution>,
}

impl From<&MatchSession> for SessionView {
    fn from(session: &MatchSession) -> Self {
        let (my_wins, opp_wins) = session.score();
        Self {
            match_id: session.id().clone(),
            mode: session.mode(),
            phase: session.phase(),
            my_wins,
            opp_wins,
            rounds_to_win: session.rounds_to_win(),
            resolution: session.resolution(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub ticket: Option<QueueTicket>,
    pub session: Option<SessionView>,
    pub last_finished: Option<SessionView>,
    /// Finished matches whose ledger write has not succeeded yet.
    pub pending_results: usize,
}
