//! Queue Manager: at most one outstanding ticket, plus the slot a cancelled
//! ticket occupies until the dequeue race settles.

use crate::transport::TransportError;
use skirmish_types::{Ack, EnqueueResponse, MatchFound, Mode, QueuePosition};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// User-visible queue failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("already queued")]
    AlreadyQueued,
    #[error("a match is already in progress")]
    MatchInProgress,
    #[error("coordinator rejected enqueue: {0}")]
    Rejected(String),
    #[error("enqueue failed: {0}")]
    Transport(String),
    #[error("orchestrator is not running")]
    Shutdown,
}

impl QueueError {
    /// Whether the same request might succeed if tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Transport(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TicketState {
    /// Enqueue sent, not yet confirmed.
    Pending,
    /// Dequeue asked for before the enqueue was confirmed. Held back until it is.
    CancelRequested,
    Queued,
    /// Dequeue sent, not yet confirmed.
    Cancelling,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueTicket {
    pub mode: Mode,
    pub queued_at: Instant,
    pub state: TicketState,
    pub position: Option<u32>,
    pub eta_secs: Option<u32>,
}

/// What an enqueue completion did to the ticket.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { mode: Mode, position: Option<u32> },
    Failed { mode: Mode, error: QueueError },
    /// A dequeue was held back for this enqueue; send it now.
    Cancel { mode: Mode },
    /// Rejected after the user already cancelled; the ticket is gone quietly.
    Withdrawn { mode: Mode },
    /// The ticket it belonged to is gone or moved on.
    Stale,
}

/// What a dequeue request needs from the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DequeueAction {
    /// No ticket, or a cancel is already under way.
    Ignored,
    /// The enqueue is still in flight; the dequeue follows its completion.
    Deferred,
    /// Send the dequeue now.
    Send,
}

#[derive(Debug, Default)]
pub struct QueueManager {
    ticket: Option<QueueTicket>,
    cancelled: Option<(QueueTicket, Instant)>,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self) -> Option<&QueueTicket> {
        self.ticket.as_ref()
    }

    pub fn is_outstanding(&self) -> bool {
        self.ticket.is_some()
    }

    /// True while a match-found could still legitimately arrive.
    pub fn is_engaged(&self) -> bool {
        self.ticket.is_some() || self.cancelled.is_some()
    }

    pub fn enqueue(
        &mut self,
        mode: Mode,
        session_active: bool,
        now: Instant,
    ) -> Result<&QueueTicket, QueueError> {
        if session_active {
            return Err(QueueError::MatchInProgress);
        }
        if self.ticket.is_some() {
            return Err(QueueError::AlreadyQueued);
        }
        // A fresh ticket supersedes the one retained after cancellation.
        self.cancelled = None;
        Ok(&*self.ticket.insert(QueueTicket {
            mode,
            queued_at: now,
            state: TicketState::Pending,
            position: None,
            eta_secs: None,
        }))
    }

    pub fn enqueue_completed(
        &mut self,
        mode: Mode,
        result: Result<EnqueueResponse, TransportError>,
    ) -> EnqueueOutcome {
        let Some(ticket) = self.ticket.as_mut() else {
            return EnqueueOutcome::Stale;
        };
        let cancel_requested = match ticket.state {
            _ if ticket.mode != mode => return EnqueueOutcome::Stale,
            TicketState::Pending => false,
            TicketState::CancelRequested => true,
            TicketState::Queued | TicketState::Cancelling => return EnqueueOutcome::Stale,
        };
        match result {
            Ok(response) if response.ok => {
                if response.ticket_position.is_some() {
                    ticket.position = response.ticket_position;
                }
                if cancel_requested {
                    ticket.state = TicketState::Cancelling;
                    info!(%mode, "queued after cancel; dequeuing");
                    return EnqueueOutcome::Cancel { mode };
                }
                ticket.state = TicketState::Queued;
                info!(%mode, position = ?ticket.position, "queued");
                EnqueueOutcome::Queued {
                    mode,
                    position: ticket.position,
                }
            }
            Ok(_) if cancel_requested => {
                self.ticket = None;
                debug!(%mode, "enqueue rejected after cancel");
                EnqueueOutcome::Withdrawn { mode }
            }
            // The coordinator may have queued us before the call failed.
            Err(err) if cancel_requested => {
                ticket.state = TicketState::Cancelling;
                warn!(%mode, error = %err, "enqueue failed after cancel; dequeuing anyway");
                EnqueueOutcome::Cancel { mode }
            }
            Ok(response) => {
                self.ticket = None;
                let reason = response
                    .reason
                    .unwrap_or_else(|| "no reason given".to_string());
                warn!(%mode, %reason, "enqueue rejected");
                EnqueueOutcome::Failed {
                    mode,
                    error: QueueError::Rejected(reason),
                }
            }
            Err(err) => {
                self.ticket = None;
                warn!(%mode, error = %err, "enqueue failed");
                EnqueueOutcome::Failed {
                    mode,
                    error: QueueError::Transport(err.to_string()),
                }
            }
        }
    }

    /// Refresh the active ticket from a position update. Returns whether it applied.
    pub fn update_position(&mut self, update: &QueuePosition) -> bool {
        match self.ticket.as_mut() {
            Some(ticket) if ticket.mode == update.mode => {
                ticket.position = Some(update.position);
                ticket.eta_secs = update.eta_secs;
                true
            }
            _ => false,
        }
    }

    /// Start cancelling the outstanding ticket. A dequeue is never sent ahead
    /// of the enqueue it cancels.
    pub fn dequeue(&mut self) -> DequeueAction {
        let Some(ticket) = self.ticket.as_mut() else {
            return DequeueAction::Ignored;
        };
        match ticket.state {
            TicketState::Pending => {
                ticket.state = TicketState::CancelRequested;
                DequeueAction::Deferred
            }
            TicketState::Queued => {
                ticket.state = TicketState::Cancelling;
                DequeueAction::Send
            }
            TicketState::CancelRequested | TicketState::Cancelling => DequeueAction::Ignored,
        }
    }

    /// Settle a dequeue. Success or failure alike, the ticket moves to the
    /// cancelled slot so a match the coordinator already committed is still entered.
    pub fn dequeue_completed(&mut self, result: Result<Ack, TransportError>, now: Instant) {
        match &result {
            Ok(ack) if ack.ok => debug!("dequeue confirmed"),
            Ok(ack) => warn!(reason = ?ack.reason, "dequeue refused"),
            Err(err) => warn!(error = %err, "dequeue failed"),
        }
        match self.ticket.take() {
            Some(ticket) if ticket.state == TicketState::Cancelling => {
                self.cancelled = Some((ticket, now));
            }
            other => self.ticket = other,
        }
    }

    /// Consume the ticket for a match-found. Returns false when nothing was
    /// outstanding, which makes the event unsolicited.
    pub fn accept_match(&mut self, found: &MatchFound) -> bool {
        let ticket = self.ticket.take();
        let cancelled = self.cancelled.take();
        match (ticket, cancelled) {
            (Some(ticket), _) => {
                if ticket.mode != found.mode {
                    warn!(queued = %ticket.mode, found = %found.mode, "match mode differs from ticket");
                }
                true
            }
            (None, Some((ticket, _))) => {
                info!(mode = %ticket.mode, match_id = %found.match_id, "entering match found after cancellation");
                true
            }
            (None, None) => false,
        }
    }

    /// Drop a cancelled ticket retained for longer than `grace`.
    pub fn expire_cancelled(&mut self, now: Instant, grace: Duration) -> bool {
        let expired = self
            .cancelled
            .as_ref()
            .is_some_and(|(_, at)| now.saturating_duration_since(*at) >= grace);
        if expired {
            self.cancelled = None;
        }
        expired
    }
}
