pub mod api;
pub mod event;
pub use api::{Ack, EnqueueResponse, Notifications, Phase};
pub use event::{DecodeError, Event, MatchFound, QueuePosition};

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Participant identifier as issued by the coordinator.
    PlayerId
);
string_id!(
    /// Opaque match identifier assigned by the coordinator.
    MatchId
);
string_id!(
    /// Identifier of one round outcome. Both delivery channels share this id space.
    RoundId
);

/// Competitive mode a player can queue for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    Duel,
    Team2,
    Team3,
    #[serde(rename = "battleRoyale10")]
    BattleRoyale10,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Duel, Mode::Team2, Mode::Team3, Mode::BattleRoyale10];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Duel => "duel",
            Mode::Team2 => "team2",
            Mode::Team3 => "team3",
            Mode::BattleRoyale10 => "battleRoyale10",
        }
    }

    /// Number of participants in a full match of this mode.
    pub fn capacity(&self) -> usize {
        match self {
            Mode::Duel => 2,
            Mode::Team2 => 4,
            Mode::Team3 => 6,
            Mode::BattleRoyale10 => 10,
        }
    }

    /// Players per side (battle royale is every player for themselves).
    pub fn team_size(&self) -> usize {
        match self {
            Mode::Duel | Mode::BattleRoyale10 => 1,
            Mode::Team2 => 2,
            Mode::Team3 => 3,
        }
    }

    /// Rounds a side must take to win when the coordinator does not say otherwise.
    ///
    /// Team modes are best of three; the battle royale is decided in a single round.
    pub fn default_rounds_to_win(&self) -> u32 {
        match self {
            Mode::Duel | Mode::Team2 | Mode::Team3 => 2,
            Mode::BattleRoyale10 => 1,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown mode: {0}")]
pub struct UnknownMode(pub String);

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "duel" | "1v1" => Ok(Mode::Duel),
            "team2" | "2v2" => Ok(Mode::Team2),
            "team3" | "3v3" => Ok(Mode::Team3),
            "battleRoyale10" | "br10" => Ok(Mode::BattleRoyale10),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}
