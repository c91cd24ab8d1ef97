//! The coordinator contract the engine is written against.
//!
//! The engine never talks HTTP or WebSocket directly: it only sees
//! [Coordinator], implemented here for [skirmish_client::Client] and in tests
//! by a recording double.

use futures::{Stream, StreamExt};
use skirmish_client::Client;
use skirmish_types::{
    Ack, EnqueueResponse, Event, MatchId, Mode, Notifications, Phase, PlayerId, RoundId,
};
use std::future::Future;
#[cfg(test)]
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;

/// Failure talking to the coordinator. Never mutates match state.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("coordinator unreachable: {0}")]
    Unavailable(String),
    #[error("coordinator returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl TransportError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, TransportError::Malformed(_))
    }
}

impl From<skirmish_client::Error> for TransportError {
    fn from(err: skirmish_client::Error) -> Self {
        use skirmish_client::Error as ClientError;
        match err {
            ClientError::DialTimeout => TransportError::Timeout,
            ClientError::Reqwest(err) if err.is_timeout() => TransportError::Timeout,
            ClientError::Reqwest(err) if err.is_decode() => {
                TransportError::Malformed(err.to_string())
            }
            ClientError::FailedWithBody { status, body } => TransportError::Status {
                status: status.as_u16(),
                body,
            },
            ClientError::InvalidData(err) => TransportError::Malformed(err.to_string()),
            ClientError::Json(err) => TransportError::Malformed(err.to_string()),
            other => TransportError::Unavailable(other.to_string()),
        }
    }
}

/// Request/response and push access to the remote coordinator.
pub trait Coordinator: Clone + Send + Sync + 'static {
    fn enqueue(
        &self,
        mode: Mode,
    ) -> impl Future<Output = Result<EnqueueResponse, TransportError>> + Send;

    fn dequeue(&self) -> impl Future<Output = Result<Ack, TransportError>> + Send;

    /// Liveness check; `since` is milliseconds since the last accepted transition.
    fn ping(
        &self,
        match_id: MatchId,
        phase: Phase,
        since: u64,
    ) -> impl Future<Output = Result<Ack, TransportError>> + Send;

    /// Ask the coordinator to advance a match waiting between rounds.
    fn next(&self, match_id: MatchId) -> impl Future<Output = Result<Ack, TransportError>> + Send;

    fn report_round(
        &self,
        match_id: MatchId,
        round_id: RoundId,
        winner: PlayerId,
        my_wins: u32,
        opp_wins: u32,
    ) -> impl Future<Output = Result<Ack, TransportError>> + Send;

    fn report_finish(
        &self,
        match_id: MatchId,
        winner: PlayerId,
    ) -> impl Future<Output = Result<Ack, TransportError>> + Send;

    /// Poll fallback for events the push channel may have missed.
    fn notifications(&self) -> impl Future<Output = Result<Notifications, TransportError>> + Send;

    /// Open the push channel.
    fn subscribe(
        &self,
    ) -> impl Future<
        Output = Result<
            impl Stream<Item = Result<Event, TransportError>> + Send + Unpin + 'static,
            TransportError,
        >,
    > + Send;
}

impl Coordinator for Client {
    async fn enqueue(&self, mode: Mode) -> Result<EnqueueResponse, TransportError> {
        Ok(Client::enqueue(self, mode).await?)
    }

    async fn dequeue(&self) -> Result<Ack, TransportError> {
        Ok(Client::dequeue(self).await?)
    }

    async fn ping(&self, match_id: MatchId, phase: Phase, since: u64) -> Result<Ack, TransportError> {
        Ok(Client::ping(self, &match_id, phase, since).await?)
    }

    async fn next(&self, match_id: MatchId) -> Result<Ack, TransportError> {
        Ok(Client::next(self, &match_id).await?)
    }

    async fn report_round(
        &self,
        match_id: MatchId,
        round_id: RoundId,
        winner: PlayerId,
        my_wins: u32,
        opp_wins: u32,
    ) -> Result<Ack, TransportError> {
        Ok(Client::report_round(self, &match_id, &round_id, &winner, my_wins, opp_wins).await?)
    }

    async fn report_finish(&self, match_id: MatchId, winner: PlayerId) -> Result<Ack, TransportError> {
        Ok(Client::report_finish(self, &match_id, &winner).await?)
    }

    async fn notifications(&self) -> Result<Notifications, TransportError> {
        Ok(Client::notifications(self).await?)
    }

    async fn subscribe(
        &self,
    ) -> Result<impl Stream<Item = Result<Event, TransportError>> + Send + Unpin + 'static, TransportError>
    {
        let stream = self.connect_events().await?;
        Ok(stream.map(|item| item.map_err(TransportError::from)))
    }
}

/// A call observed by [Mock].
#[cfg(test)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Enqueue(Mode),
    Dequeue,
    Ping {
        match_id: MatchId,
        phase: Phase,
        since: u64,
    },
    Next(MatchId),
    ReportRound {
        match_id: MatchId,
        round_id: RoundId,
        winner: PlayerId,
        my_wins: u32,
        opp_wins: u32,
    },
    ReportFinish {
        match_id: MatchId,
        winner: PlayerId,
    },
    Notifications,
    Subscribe,
}

#[cfg(test)]
type Pusher = futures::channel::mpsc::UnboundedSender<Result<Event, TransportError>>;

/// Recording coordinator double. Events are injected with [Mock::push] (to
/// every open feed) or [Mock::queue_notification] (drained by the next poll).
#[cfg(test)]
#[derive(Clone)]
pub struct Mock {
    pub calls: Arc<Mutex<Vec<Call>>>,
    pub enqueue_response: Arc<Mutex<Result<EnqueueResponse, TransportError>>>,
    pub enqueue_delay: Arc<Mutex<Duration>>,
    pub dequeue_delay: Arc<Mutex<Duration>>,
    pub notifications_delay: Arc<Mutex<Duration>>,
    pub notifications: Arc<Mutex<Vec<serde_json::Value>>>,
    pub pushers: Arc<Mutex<Vec<Pusher>>>,
}

#[cfg(test)]
impl Mock {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            enqueue_response: Arc::new(Mutex::new(Ok(EnqueueResponse {
                ok: true,
                ticket_position: Some(1),
                reason: None,
            }))),
            enqueue_delay: Arc::new(Mutex::new(Duration::ZERO)),
            dequeue_delay: Arc::new(Mutex::new(Duration::ZERO)),
            notifications_delay: Arc::new(Mutex::new(Duration::ZERO)),
            notifications: Arc::new(Mutex::new(Vec::new())),
            pushers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, filter: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|call| filter(call)).count()
    }

    pub fn set_enqueue_response(&self, response: Result<EnqueueResponse, TransportError>) {
        *self.enqueue_response.lock().unwrap() = response;
    }

    pub fn set_enqueue_delay(&self, delay: Duration) {
        *self.enqueue_delay.lock().unwrap() = delay;
    }

    pub fn set_dequeue_delay(&self, delay: Duration) {
        *self.dequeue_delay.lock().unwrap() = delay;
    }

    pub fn set_notifications_delay(&self, delay: Duration) {
        *self.notifications_delay.lock().unwrap() = delay;
    }

    /// Deliver `event` on every open push feed.
    pub fn push(&self, event: Event) {
        self.push_result(Ok(event));
    }

    pub fn push_result(&self, item: Result<Event, TransportError>) {
        let mut pushers = self.pushers.lock().unwrap();
        pushers.retain(|pusher| pusher.unbounded_send(item.clone()).is_ok());
    }

    /// End every open push feed.
    pub fn disconnect(&self) {
        self.pushers.lock().unwrap().clear();
    }

    pub fn queue_notification(&self, event: &Event) {
        self.queue_raw_notification(serde_json::to_value(event).unwrap());
    }

    pub fn queue_raw_notification(&self, value: serde_json::Value) {
        self.notifications.lock().unwrap().push(value);
    }
}

#[cfg(test)]
impl Coordinator for Mock {
    async fn enqueue(&self, mode: Mode) -> Result<EnqueueResponse, TransportError> {
        self.record(Call::Enqueue(mode));
        let delay = *self.enqueue_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.enqueue_response.lock().unwrap().clone()
    }

    async fn dequeue(&self) -> Result<Ack, TransportError> {
        self.record(Call::Dequeue);
        let delay = *self.dequeue_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        Ok(Ack::ok())
    }

    async fn ping(&self, match_id: MatchId, phase: Phase, since: u64) -> Result<Ack, TransportError> {
        self.record(Call::Ping {
            match_id,
            phase,
            since,
        });
        Ok(Ack::ok())
    }

    async fn next(&self, match_id: MatchId) -> Result<Ack, TransportError> {
        self.record(Call::Next(match_id));
        Ok(Ack::ok())
    }

    async fn report_round(
        &self,
        match_id: MatchId,
        round_id: RoundId,
        winner: PlayerId,
        my_wins: u32,
        opp_wins: u32,
    ) -> Result<Ack, TransportError> {
        self.record(Call::ReportRound {
            match_id,
            round_id,
            winner,
            my_wins,
            opp_wins,
        });
        Ok(Ack::ok())
    }

    async fn report_finish(&self, match_id: MatchId, winner: PlayerId) -> Result<Ack, TransportError> {
        self.record(Call::ReportFinish { match_id, winner });
        Ok(Ack::ok())
    }

    async fn notifications(&self) -> Result<Notifications, TransportError> {
        self.record(Call::Notifications);
        let delay = *self.notifications_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        let events = std::mem::take(&mut *self.notifications.lock().unwrap());
        Ok(Notifications { events })
    }

    async fn subscribe(
        &self,
    ) -> Result<impl Stream<Item = Result<Event, TransportError>> + Send + Unpin + 'static, TransportError>
    {
        self.record(Call::Subscribe);
        let (pusher, stream) = futures::channel::mpsc::unbounded();
        self.pushers.lock().unwrap().push(pusher);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skirmish_types::DecodeError;

    #[test]
    fn client_errors_map_to_transport_errors() {
        let err: TransportError = skirmish_client::Error::DialTimeout.into();
        assert_eq!(err, TransportError::Timeout);

        let err: TransportError = skirmish_client::Error::InvalidData(DecodeError::Invalid {
            kind: "match.round",
            reason: "empty roundId".to_string(),
        })
        .into();
        assert!(err.is_malformed());

        let err: TransportError = skirmish_client::Error::ConnectionClosed.into();
        assert!(matches!(err, TransportError::Unavailable(_)));
    }
}
