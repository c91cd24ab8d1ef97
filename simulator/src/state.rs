use crate::Delivery;
use rand::{rngs::StdRng, Rng, SeedableRng};
use skirmish_types::{
    Ack, EnqueueResponse, Event, MatchFound, MatchId, Mode, Phase, PlayerId, QueuePosition,
    RoundId,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// How the simulator decides who takes a round resolved by a ping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RoundPolicy {
    #[default]
    PlayerWins,
    BotWins,
    /// Player takes odd rounds, bots take even rounds.
    Alternate,
    Random(u64),
}

#[derive(Clone, Debug, Default)]
pub struct SimulatorConfig {
    pub round_policy: RoundPolicy,
    /// Overrides the mode default when set.
    pub rounds_to_win: Option<u32>,
    /// Delay between enqueue and match formation. Zero forms the match inline.
    pub match_delay: Duration,
    pub broadcast_buffer: Option<usize>,
}

#[derive(Clone, Debug)]
struct SimMatch {
    id: MatchId,
    player: PlayerId,
    opponent: PlayerId,
    phase: Phase,
    round: u32,
    player_wins: u32,
    bot_wins: u32,
    rounds_to_win: u32,
    winner: Option<PlayerId>,
    seen_rounds: HashSet<RoundId>,
}

impl SimMatch {
    fn finish_event(&self) -> Option<Event> {
        self.winner.as_ref().map(|winner| Event::Finish {
            match_id: self.id.clone(),
            winner: winner.clone(),
        })
    }
}

pub struct State {
    config: SimulatorConfig,
    queued: HashMap<PlayerId, Mode>,
    matches: HashMap<MatchId, SimMatch>,
    active: HashMap<PlayerId, MatchId>,
    rng: StdRng,
}

impl State {
    pub fn new(config: SimulatorConfig) -> Self {
        let seed = match config.round_policy {
            RoundPolicy::Random(seed) => seed,
            _ => 0,
        };
        Self {
            config,
            queued: HashMap::new(),
            matches: HashMap::new(),
            active: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn in_match(&self, player: &PlayerId) -> bool {
        self.active
            .get(player)
            .and_then(|id| self.matches.get(id))
            .is_some_and(|m| m.winner.is_none())
    }

    pub fn is_queued(&self, player: &PlayerId) -> bool {
        self.queued.contains_key(player)
    }

    pub fn enqueue(&mut self, player: &PlayerId, mode: Mode) -> (EnqueueResponse, Vec<Delivery>) {
        if self.in_match(player) {
            return (
                EnqueueResponse {
                    ok: false,
                    ticket_position: None,
                    reason: Some("match in progress".to_string()),
                },
                Vec::new(),
            );
        }
        if self.queued.contains_key(player) {
            return (
                EnqueueResponse {
                    ok: false,
                    ticket_position: None,
                    reason: Some("already queued".to_string()),
                },
                Vec::new(),
            );
        }
        self.queued.insert(player.clone(), mode);
        let position = self.queued.len() as u32;
        let mut deliveries = vec![Delivery {
            player: player.clone(),
            event: Event::QueuePosition(QueuePosition {
                mode,
                position,
                eta_secs: Some(self.config.match_delay.as_secs() as u32),
            }),
        }];
        if self.config.match_delay.is_zero() {
            deliveries.extend(self.form_match(player));
        }
        (
            EnqueueResponse {
                ok: true,
                ticket_position: Some(position),
                reason: None,
            },
            deliveries,
        )
    }

    pub fn dequeue(&mut self, player: &PlayerId) -> Ack {
        self.queued.remove(player);
        Ack::ok()
    }

    /// Pair a queued player with bots. No-op if the player left the queue.
    pub fn form_match(&mut self, player: &PlayerId) -> Vec<Delivery> {
        let Some(mode) = self.queued.remove(player) else {
            return Vec::new();
        };
        let id = MatchId::new(format!("m-{}", Uuid::new_v4()));
        let mut players = vec![player.clone()];
        players.extend((1..mode.capacity()).map(|index| PlayerId::new(format!("bot-{index}"))));
        let teams = (mode.team_size() > 1).then(|| {
            players
                .chunks(mode.team_size())
                .map(|team| team.to_vec())
                .collect::<Vec<_>>()
        });
        let opponent = players[mode.team_size()].clone();
        let rounds_to_win = self
            .config
            .rounds_to_win
            .unwrap_or_else(|| mode.default_rounds_to_win());
        info!(%player, match_id = %id, %mode, "match formed");

        self.matches.insert(
            id.clone(),
            SimMatch {
                id: id.clone(),
                player: player.clone(),
                opponent,
                phase: Phase::Between,
                round: 0,
                player_wins: 0,
                bot_wins: 0,
                rounds_to_win,
                winner: None,
                seen_rounds: HashSet::new(),
            },
        );
        self.active.insert(player.clone(), id.clone());

        vec![Delivery {
            player: player.clone(),
            event: Event::MatchFound(MatchFound {
                match_id: id,
                mode,
                players,
                teams,
                rounds_to_win: Some(rounds_to_win),
                loadout: Some(serde_json::json!({ "skin": "default" })),
                inventory: Some(serde_json::json!([])),
            }),
        }]
    }

    /// Advance a match waiting between rounds. A finished match replays its result.
    pub fn next(&mut self, player: &PlayerId, match_id: &MatchId) -> (Ack, Vec<Delivery>) {
        let Some(game) = self.owned_match(player, match_id) else {
            return (Ack::rejected("unknown match"), Vec::new());
        };
        if let Some(finish) = game.finish_event() {
            return (Ack::ok(), deliver(player, finish));
        }
        // A round already running repeats its start so a lost signal is recovered.
        if game.phase == Phase::Between {
            game.phase = Phase::InRound;
            debug!(%match_id, round = game.round + 1, "round started");
        }
        let event = Event::RoundStart {
            match_id: match_id.clone(),
            round_id: Some(round_id(match_id, game.round + 1)),
        };
        (Ack::ok(), deliver(player, event))
    }

    /// Liveness check. A running round is resolved; a finished match replays its result.
    pub fn ping(
        &mut self,
        player: &PlayerId,
        match_id: &MatchId,
        phase: Phase,
    ) -> (Ack, Vec<Delivery>) {
        let policy = self.config.round_policy;
        let roll = self.rng.gen_bool(0.5);
        let Some(game) = self.owned_match(player, match_id) else {
            return (Ack::rejected("unknown match"), Vec::new());
        };
        if let Some(finish) = game.finish_event() {
            return (Ack::ok(), deliver(player, finish));
        }
        debug!(%match_id, reported = %phase, actual = %game.phase, "ping");
        if game.phase != Phase::InRound {
            return (Ack::ok(), Vec::new());
        }
        let round = game.round + 1;
        let player_takes_it = match policy {
            RoundPolicy::PlayerWins => true,
            RoundPolicy::BotWins => false,
            RoundPolicy::Alternate => round % 2 == 1,
            RoundPolicy::Random(_) => roll,
        };
        let winner = if player_takes_it {
            game.player.clone()
        } else {
            game.opponent.clone()
        };
        let round_id = round_id(match_id, round);
        (Ack::ok(), resolve(game, round_id, winner))
    }

    /// Locally observed round result reported by the player.
    pub fn report_round(
        &mut self,
        player: &PlayerId,
        match_id: &MatchId,
        round_id: RoundId,
        winner: PlayerId,
    ) -> (Ack, Vec<Delivery>) {
        let Some(game) = self.owned_match(player, match_id) else {
            return (Ack::rejected("unknown match"), Vec::new());
        };
        if game.winner.is_some() || game.seen_rounds.contains(&round_id) {
            return (Ack::ok(), Vec::new());
        }
        (Ack::ok(), resolve(game, round_id, winner))
    }

    pub fn report_finish(
        &mut self,
        player: &PlayerId,
        match_id: &MatchId,
        winner: PlayerId,
    ) -> (Ack, Vec<Delivery>) {
        let Some(game) = self.owned_match(player, match_id) else {
            return (Ack::rejected("unknown match"), Vec::new());
        };
        if game.winner.is_none() {
            game.winner = Some(winner);
            game.phase = Phase::Finished;
        }
        let deliveries = game
            .finish_event()
            .map(|finish| deliver(player, finish))
            .unwrap_or_default();
        (Ack::ok(), deliveries)
    }

    fn owned_match(&mut self, player: &PlayerId, match_id: &MatchId) -> Option<&mut SimMatch> {
        self.matches
            .get_mut(match_id)
            .filter(|game| &game.player == player)
    }
}

/// Id shared by a round's start and its result.
fn round_id(match_id: &MatchId, round: u32) -> RoundId {
    RoundId::new(format!("{match_id}-r{round}"))
}

fn deliver(player: &PlayerId, event: Event) -> Vec<Delivery> {
    vec![Delivery {
        player: player.clone(),
        event,
    }]
}

fn resolve(game: &mut SimMatch, round_id: RoundId, winner: PlayerId) -> Vec<Delivery> {
    game.round += 1;
    game.seen_rounds.insert(round_id.clone());
    if winner == game.player {
        game.player_wins += 1;
    } else {
        game.bot_wins += 1;
    }
    game.phase = Phase::Between;
    debug!(
        match_id = %game.id,
        %round_id,
        %winner,
        player_wins = game.player_wins,
        bot_wins = game.bot_wins,
        "round resolved"
    );

    let mut deliveries = deliver(
        &game.player,
        Event::RoundEnd {
            match_id: game.id.clone(),
            round_id,
            winner: winner.clone(),
        },
    );
    if game.player_wins >= game.rounds_to_win || game.bot_wins >= game.rounds_to_win {
        game.winner = Some(winner);
        game.phase = Phase::Finished;
        if let Some(finish) = game.finish_event() {
            deliveries.extend(deliver(&game.player, finish));
        }
    }
    deliveries
}
