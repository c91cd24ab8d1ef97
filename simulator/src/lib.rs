//! In-process coordinator used for local development and end-to-end tests.
//!
//! The simulator pairs every queued player with bots, starts rounds when asked
//! to advance, and resolves a running round when pinged. Every event it emits
//! is delivered on both the push stream and the `notifications` pull, so
//! clients always observe duplicates.

use skirmish_types::{Event, PlayerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;

mod api;
pub use api::Api;

mod state;
pub use state::{RoundPolicy, SimulatorConfig, State};

const DEFAULT_BROADCAST_BUFFER: usize = 1024;

/// Event addressed to one player.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub player: PlayerId,
    pub event: Event,
}

pub struct Simulator {
    pub config: SimulatorConfig,
    state: Mutex<State>,
    pending: Mutex<HashMap<PlayerId, Vec<Event>>>,
    updates: broadcast::Sender<Delivery>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let buffer = config
            .broadcast_buffer
            .unwrap_or(DEFAULT_BROADCAST_BUFFER)
            .max(1);
        let (updates, _) = broadcast::channel(buffer);
        Self {
            state: Mutex::new(State::new(config.clone())),
            config,
            pending: Mutex::new(HashMap::new()),
            updates,
        }
    }

    /// Lock the coordinator state. A poisoned lock is recovered because the
    /// state is only mutated through methods that leave it consistent.
    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.updates.subscribe()
    }

    /// Queue events on the pull channel and fan them out on the push channel.
    pub fn publish(&self, deliveries: Vec<Delivery>) {
        if deliveries.is_empty() {
            return;
        }
        {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for delivery in &deliveries {
                pending
                    .entry(delivery.player.clone())
                    .or_default()
                    .push(delivery.event.clone());
            }
        }
        for delivery in deliveries {
            debug!(player = %delivery.player, kind = delivery.event.kind(), "publishing event");
            // No subscribers is fine: the pull channel still holds the event.
            let _ = self.updates.send(delivery);
        }
    }

    /// Drain pending events for `player`.
    pub fn take_notifications(&self, player: &PlayerId) -> Vec<Event> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.remove(player).unwrap_or_default()
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

pub type SharedSimulator = Arc<Simulator>;
