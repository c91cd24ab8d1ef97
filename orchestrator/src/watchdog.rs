//! Watchdog: one cancellable delayed task per session.
//!
//! Arming spawns a sleeper that reports [Fired] on the engine's channel when
//! its interval elapses. Re-arming or cancelling aborts the previous sleeper,
//! and each arm bumps a generation counter so a firing that raced an abort is
//! recognisably stale. The watchdog only decides *when*; the engine decides
//! what to send and never lets it touch session state.

use crate::backoff::{jittered, Backoff};
use rand::{rngs::StdRng, SeedableRng};
use skirmish_types::{MatchId, Phase};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Tight interval while a round is running.
    pub in_round: Duration,
    /// Looser interval while waiting between rounds.
    pub between: Duration,
    /// Cap for the doubled interval after unanswered firings.
    pub max_backoff: Duration,
    /// Apply equal jitter to every delay.
    pub jitter: bool,
}

impl WatchdogConfig {
    pub fn interval(&self, phase: Phase) -> Option<Duration> {
        match phase {
            Phase::InRound => Some(self.in_round),
            Phase::Between => Some(self.between),
            Phase::Finished => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fired {
    pub match_id: MatchId,
    pub generation: u64,
}

struct Armed {
    match_id: MatchId,
    phase: Phase,
    generation: u64,
    backoff: Backoff,
    handle: JoinHandle<()>,
}

pub struct Watchdog {
    config: WatchdogConfig,
    fired: mpsc::UnboundedSender<Fired>,
    armed: Option<Armed>,
    generation: u64,
    rng: StdRng,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, fired: mpsc::UnboundedSender<Fired>) -> Self {
        Self {
            config,
            fired,
            armed: None,
            generation: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// (Re)arm for `phase` at its base interval. Arming for `Finished` cancels.
    pub fn arm(&mut self, match_id: &MatchId, phase: Phase) {
        let Some(interval) = self.config.interval(phase) else {
            self.cancel();
            return;
        };
        let backoff = Backoff::new(interval, self.config.max_backoff.max(interval));
        self.schedule(match_id.clone(), phase, backoff);
    }

    /// Re-arm after a firing that saw no progress, at double the last interval.
    pub fn back_off(&mut self) {
        let Some(armed) = self.armed.take() else {
            return;
        };
        armed.handle.abort();
        let mut backoff = armed.backoff;
        backoff.advance();
        self.schedule(armed.match_id, armed.phase, backoff);
    }

    pub fn cancel(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.handle.abort();
            trace!(match_id = %armed.match_id, generation = armed.generation, "watchdog cancelled");
        }
    }

    /// Whether `fired` belongs to the currently armed sleeper.
    pub fn is_current(&self, fired: &Fired) -> bool {
        self.armed
            .as_ref()
            .is_some_and(|armed| armed.generation == fired.generation && armed.match_id == fired.match_id)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn armed_phase(&self) -> Option<Phase> {
        self.armed.as_ref().map(|armed| armed.phase)
    }

    /// Un-jittered interval of the current sleeper.
    pub fn current_interval(&self) -> Option<Duration> {
        self.armed.as_ref().map(|armed| armed.backoff.current())
    }

    fn schedule(&mut self, match_id: MatchId, phase: Phase, backoff: Backoff) {
        if let Some(previous) = self.armed.take() {
            previous.handle.abort();
        }
        self.generation += 1;
        let generation = self.generation;
        let delay = if self.config.jitter {
            jittered(&mut self.rng, backoff.current())
        } else {
            backoff.current()
        };
        trace!(%match_id, %phase, generation, ?delay, "watchdog armed");

        let fired = self.fired.clone();
        let id = match_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired.send(Fired {
                match_id: id,
                generation,
            });
        });
        self.armed = Some(Armed {
            match_id,
            phase,
            generation,
            backoff,
            handle,
        });
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}
