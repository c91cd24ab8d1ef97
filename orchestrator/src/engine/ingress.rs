use super::{Notice, RoundReport, Status};
use crate::queue::{QueueError, QueueTicket};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use skirmish_types::{Mode, PlayerId, RoundId};
use tokio::sync::broadcast;
use tracing::warn;

pub enum Message {
    Enqueue {
        mode: Mode,
        response: oneshot::Sender<Result<QueueTicket, QueueError>>,
    },
    Dequeue {
        response: oneshot::Sender<bool>,
    },
    /// A round result observed by the local game loop.
    ReportRound {
        round_id: RoundId,
        winner: PlayerId,
        response: oneshot::Sender<Option<RoundReport>>,
    },
    Status {
        response: oneshot::Sender<Status>,
    },
}

#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
    notices: broadcast::Sender<Notice>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>, notices: broadcast::Sender<Notice>) -> Self {
        Self { sender, notices }
    }

    /// Join the queue for `mode`. The returned ticket is pending until the
    /// coordinator confirms; a later rejection arrives as [Notice::QueueFailed].
    pub async fn enqueue(&mut self, mode: Mode) -> Result<QueueTicket, QueueError> {
        let (response, receiver) = oneshot::channel();
        if self
            .sender
            .send(Message::Enqueue { mode, response })
            .await
            .is_err()
        {
            warn!(%mode, "engine mailbox closed; enqueue dropped");
            return Err(QueueError::Shutdown);
        }
        receiver.await.unwrap_or(Err(QueueError::Shutdown))
    }

    /// Leave the queue. A dequeue asked for while the enqueue is still in flight
    /// is sent once that enqueue completes. Returns false when no ticket was
    /// outstanding or a cancel was already under way.
    pub async fn dequeue(&mut self) -> bool {
        let (response, receiver) = oneshot::channel();
        if self
            .sender
            .send(Message::Dequeue { response })
            .await
            .is_err()
        {
            warn!("engine mailbox closed; dequeue dropped");
            return false;
        }
        receiver.await.unwrap_or(false)
    }

    /// Forward a locally observed round result to the coordinator. The match
    /// itself only advances when the coordinator confirms. `None` when no
    /// match is active.
    pub async fn report_round(
        &mut self,
        round_id: RoundId,
        winner: PlayerId,
    ) -> Option<RoundReport> {
        let (response, receiver) = oneshot::channel();
        if self
            .sender
            .send(Message::ReportRound {
                round_id,
                winner,
                response,
            })
            .await
            .is_err()
        {
            warn!("engine mailbox closed; round report dropped");
            return None;
        }
        receiver.await.ok().flatten()
    }

    pub async fn status(&mut self) -> Option<Status> {
        let (response, receiver) = oneshot::channel();
        if self
            .sender
            .send(Message::Status { response })
            .await
            .is_err()
        {
            warn!("engine mailbox closed; status dropped");
            return None;
        }
        receiver.await.ok()
    }

    /// Subscribe to engine notices. Slow receivers lose the oldest notices.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }
}
