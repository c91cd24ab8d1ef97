use super::{
    ingress::{Mailbox, Message},
    Config, Notice, RoundReport, SessionView, Status,
};
use crate::{
    backoff::{jittered, Backoff},
    ledger::{LedgerReader, RankLedger},
    metrics::Metrics,
    processor::{self, Applied},
    queue::{DequeueAction, EnqueueOutcome, QueueManager},
    session::{MatchSession, Resolution},
    transport::{Coordinator, TransportError},
    watchdog::{Fired, Watchdog},
};
use futures::{channel::mpsc, StreamExt};
use prometheus_client::registry::Registry;
use rand::{rngs::StdRng, SeedableRng};
use skirmish_types::{
    Ack, EnqueueResponse, Event, MatchFound, MatchId, Mode, Notifications, Phase, PlayerId,
    RoundId,
};
use std::{collections::VecDeque, future::Future, time::Duration};
use tokio::{
    sync::{
        broadcast,
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    },
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

const FEED_RECONNECT_INITIAL: Duration = Duration::from_millis(200);
const FEED_RECONNECT_MAX: Duration = Duration::from_secs(10);

/// Finished matches remembered so their late events are not reported as violations.
const RECENT_MATCHES: usize = 16;

/// Results of outbound work, delivered back onto the engine task.
enum Completion {
    Enqueued {
        mode: Mode,
        result: Result<EnqueueResponse, TransportError>,
    },
    Dequeued(Result<Ack, TransportError>),
    Polled(Result<Notifications, TransportError>),
    Acked {
        call: &'static str,
        match_id: MatchId,
        result: Result<Ack, TransportError>,
    },
    Pushed(Event),
}

/// Rounds this player reported for the current match that the coordinator
/// may not have confirmed yet.
struct LocalReports {
    match_id: MatchId,
    rounds: Vec<(RoundId, PlayerId)>,
    finish_reported: bool,
}

struct PendingResult {
    match_id: MatchId,
    mode: Mode,
    won: bool,
}

pub struct Actor<C: Coordinator> {
    config: Config,
    coordinator: C,
    ledger: RankLedger,
    metrics: Metrics,

    mailbox: mpsc::Receiver<Message>,
    notices: broadcast::Sender<Notice>,
    completions: UnboundedReceiver<Completion>,
    completer: UnboundedSender<Completion>,
    fired: UnboundedReceiver<Fired>,

    queue: QueueManager,
    session: Option<MatchSession>,
    watchdog: Watchdog,
    polling: bool,
    pending_results: VecDeque<PendingResult>,
    recent: VecDeque<MatchId>,
    last_finished: Option<SessionView>,
    local_reports: Option<LocalReports>,
}

impl<C: Coordinator> Actor<C> {
    pub fn new(
        config: Config,
        coordinator: C,
        ledger: RankLedger,
        registry: &mut Registry,
    ) -> (Self, Mailbox) {
        let (sender, mailbox) = mpsc::channel(config.mailbox_size);
        let (notices, _) = broadcast::channel(config.notice_buffer.max(1));
        let (completer, completions) = unbounded_channel();
        let (fired_sender, fired) = unbounded_channel();
        let watchdog = Watchdog::new(config.watchdog, fired_sender);
        let metrics = Metrics::register(registry);

        (
            Self {
                config,
                coordinator,
                ledger,
                metrics,
                mailbox,
                notices: notices.clone(),
                completions,
                completer,
                fired,
                queue: QueueManager::new(),
                session: None,
                watchdog,
                polling: false,
                pending_results: VecDeque::new(),
                recent: VecDeque::with_capacity(RECENT_MATCHES),
                last_finished: None,
                local_reports: None,
            },
            Mailbox::new(sender, notices),
        )
    }

    /// Read access to the ledger that outlives the move into [Actor::start].
    pub fn ledger_reader(&self) -> LedgerReader {
        self.ledger.reader()
    }

    /// Run until every [Mailbox] has been dropped.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let feed = self.config.push_enabled.then(|| self.spawn_feed());

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut housekeeping = tokio::time::interval(self.config.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(player = %self.config.player, push = self.config.push_enabled, "engine started");
        loop {
            tokio::select! {
                message = self.mailbox.next() => {
                    let Some(message) = message else {
                        debug!("mailbox closed; shutting down");
                        break;
                    };
                    self.handle_message(message);
                }
                Some(completion) = self.completions.recv() => {
                    self.handle_completion(completion);
                }
                Some(fired) = self.fired.recv() => {
                    self.handle_fired(fired);
                }
                _ = poll.tick() => {
                    self.maybe_poll();
                }
                _ = housekeeping.tick() => {
                    self.housekeeping();
                }
            }
        }

        self.watchdog.cancel();
        if let Some(feed) = feed {
            feed.abort();
        }
        info!("engine stopped");
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Enqueue { mode, response } => {
                let result = self
                    .queue
                    .enqueue(mode, self.session.is_some(), Instant::now())
                    .cloned();
                match &result {
                    Ok(_) => {
                        debug!(%mode, "enqueue requested");
                        let coordinator = self.coordinator.clone();
                        self.spawn_call(
                            async move { coordinator.enqueue(mode).await },
                            move |result| Completion::Enqueued { mode, result },
                        );
                    }
                    Err(err) => debug!(%mode, error = %err, "enqueue refused locally"),
                }
                let _ = response.send(result);
            }
            Message::Dequeue { response } => {
                let action = self.queue.dequeue();
                match action {
                    DequeueAction::Send => {
                        debug!("dequeue requested");
                        self.send_dequeue();
                    }
                    DequeueAction::Deferred => debug!("dequeue held until enqueue completes"),
                    DequeueAction::Ignored => {}
                }
                let _ = response.send(action != DequeueAction::Ignored);
            }
            Message::ReportRound {
                round_id,
                winner,
                response,
            } => {
                let report = self.report_round(round_id, winner);
                let _ = response.send(report);
            }
            Message::Status { response } => {
                let _ = response.send(self.status());
            }
        }
    }

    fn status(&self) -> Status {
        Status {
            ticket: self.queue.ticket().cloned(),
            session: self.session.as_ref().map(SessionView::from),
            last_finished: self.last_finished.clone(),
            pending_results: self.pending_results.len(),
        }
    }

    fn send_dequeue(&self) {
        let coordinator = self.coordinator.clone();
        self.spawn_call(
            async move { coordinator.dequeue().await },
            Completion::Dequeued,
        );
    }

    /// Forward a locally observed round. The session only moves on coordinator
    /// events, so this leaves the fence, the score and the ledger alone.
    fn report_round(&mut self, round_id: RoundId, winner: PlayerId) -> Option<RoundReport> {
        let session = self.session.as_ref()?;
        let match_id = session.id().clone();
        if self
            .local_reports
            .as_ref()
            .is_some_and(|local| local.match_id != match_id)
        {
            self.local_reports = None;
        }
        let local = self.local_reports.get_or_insert_with(|| LocalReports {
            match_id: match_id.clone(),
            rounds: Vec::new(),
            finish_reported: false,
        });

        let known = session.has_applied(&round_id)
            || local.rounds.iter().any(|(round, _)| *round == round_id);
        if !known {
            local.rounds.push((round_id.clone(), winner.clone()));
        }
        let (mut my_wins, mut opp_wins) = session.score();
        for (round, round_winner) in &local.rounds {
            if session.has_applied(round) {
                continue;
            }
            if session.is_ally(round_winner) {
                my_wins += 1;
            } else {
                opp_wins += 1;
            }
        }
        let target = session.rounds_to_win();
        let decisive = my_wins >= target || opp_wins >= target;
        let send_finish = !known && decisive && !local.finish_reported;
        if send_finish {
            local.finish_reported = true;
        }
        let report = RoundReport {
            match_id: match_id.clone(),
            round_id: round_id.clone(),
            winner: winner.clone(),
            my_wins,
            opp_wins,
            decisive,
        };
        if known {
            debug!(%match_id, %round_id, "round already reported");
            return Some(report);
        }

        info!(%match_id, %round_id, %winner, my_wins, opp_wins, "reporting round");
        let coordinator = self.coordinator.clone();
        let id = match_id.clone();
        let round_winner = winner.clone();
        self.spawn_call(
            async move {
                coordinator
                    .report_round(id, round_id, round_winner, my_wins, opp_wins)
                    .await
            },
            {
                let match_id = match_id.clone();
                move |result| Completion::Acked {
                    call: "report_round",
                    match_id,
                    result,
                }
            },
        );
        if send_finish {
            let coordinator = self.coordinator.clone();
            let id = match_id.clone();
            self.spawn_call(
                async move { coordinator.report_finish(id, winner).await },
                move |result| Completion::Acked {
                    call: "report_finish",
                    match_id,
                    result,
                },
            );
        }
        self.notify(Notice::RoundReported(report.clone()));
        Some(report)
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Enqueued { mode, result } => {
                if result.is_err() {
                    self.metrics.transport_failures.inc();
                }
                match self.queue.enqueue_completed(mode, result) {
                    EnqueueOutcome::Queued { mode, position } => {
                        self.notify(Notice::Queued { mode, position });
                    }
                    EnqueueOutcome::Failed { mode, error } => {
                        self.notify(Notice::QueueFailed {
                            mode,
                            retryable: error.is_retryable(),
                            reason: error.to_string(),
                        });
                    }
                    EnqueueOutcome::Cancel { mode } => {
                        debug!(%mode, "sending held-back dequeue");
                        self.send_dequeue();
                    }
                    EnqueueOutcome::Withdrawn { mode } => {
                        debug!(%mode, "cancelled enqueue was rejected");
                    }
                    EnqueueOutcome::Stale => debug!(%mode, "ignoring stale enqueue completion"),
                }
            }
            Completion::Dequeued(result) => {
                if result.is_err() {
                    self.metrics.transport_failures.inc();
                }
                self.queue.dequeue_completed(result, Instant::now());
            }
            Completion::Polled(result) => {
                self.polling = false;
                match result {
                    Ok(notifications) => {
                        for decoded in notifications.decode() {
                            match decoded {
                                Ok(event) => self.handle_event(event, "poll"),
                                Err(err) => {
                                    self.metrics.events_discarded.inc();
                                    warn!(error = %err, "discarding malformed notification");
                                }
                            }
                        }
                    }
                    Err(err) => {
                        self.metrics.transport_failures.inc();
                        warn!(error = %err, "notifications poll failed");
                    }
                }
            }
            Completion::Acked {
                call,
                match_id,
                result,
            } => match result {
                Ok(ack) if ack.ok => trace!(call, %match_id, "acknowledged"),
                Ok(ack) => debug!(call, %match_id, reason = ?ack.reason, "refused by coordinator"),
                Err(err) => {
                    self.metrics.transport_failures.inc();
                    warn!(call, %match_id, error = %err, "call failed");
                }
            },
            Completion::Pushed(event) => self.handle_event(event, "push"),
        }
    }

    fn handle_event(&mut self, event: Event, source: &'static str) {
        trace!(kind = event.kind(), source, "event received");
        match event {
            Event::QueuePosition(update) => {
                if self.queue.update_position(&update) {
                    self.metrics.events_applied.inc();
                    self.notify(Notice::QueuePosition {
                        mode: update.mode,
                        position: update.position,
                        eta_secs: update.eta_secs,
                    });
                } else {
                    debug!(mode = %update.mode, source, "ignoring position for no active ticket");
                }
            }
            Event::MatchFound(found) => self.handle_match_found(found, source),
            event => {
                if self.session.is_some() {
                    self.apply_to_session(&event, source);
                } else {
                    self.discard_orphan(&event, source);
                }
            }
        }
    }

    fn handle_match_found(&mut self, found: MatchFound, source: &'static str) {
        if let Some(session) = &self.session {
            if session.id() == &found.match_id {
                self.metrics.events_duplicate.inc();
                debug!(match_id = %found.match_id, source, "duplicate match found");
            } else {
                self.metrics.events_discarded.inc();
                warn!(active = %session.id(), match_id = %found.match_id, source, "match found while another match is active");
            }
            return;
        }
        if self.recent.contains(&found.match_id) {
            self.metrics.events_duplicate.inc();
            debug!(match_id = %found.match_id, source, "match found for finished match");
            return;
        }
        if !found.players.contains(&self.config.player) {
            self.metrics.events_discarded.inc();
            warn!(match_id = %found.match_id, source, "match found without local player");
            return;
        }
        if !self.queue.accept_match(&found) {
            self.metrics.events_discarded.inc();
            warn!(match_id = %found.match_id, source, "discarding unsolicited match found");
            return;
        }

        let now = Instant::now();
        let rounds_to_win = self.config.rounds_to_win(found.mode);
        let session = match MatchSession::from_found(found, &self.config.player, rounds_to_win, now)
        {
            Ok(session) => session,
            Err(err) => {
                self.metrics.events_discarded.inc();
                warn!(error = %err, source, "discarding match found");
                return;
            }
        };
        self.metrics.events_applied.inc();
        info!(
            match_id = %session.id(),
            mode = %session.mode(),
            players = session.players().len(),
            rounds_to_win = session.rounds_to_win(),
            source,
            "match started"
        );
        self.watchdog.arm(session.id(), session.phase());
        self.notify(Notice::MatchStarted {
            match_id: session.id().clone(),
            mode: session.mode(),
            players: session.players().to_vec(),
            rounds_to_win: session.rounds_to_win(),
            loadout: session.loadout().cloned(),
            inventory: session.inventory().cloned(),
        });
        self.session = Some(session);
    }

    /// Route a match event through the processor and derive every side effect
    /// from what it reports.
    fn apply_to_session(&mut self, event: &Event, source: &'static str) -> Applied {
        let Some(session) = self.session.as_mut() else {
            self.discard_orphan(event, source);
            return Applied::Ignored;
        };
        let applied = processor::apply(session, event, Instant::now());
        let match_id = session.id().clone();
        let phase = session.phase();
        let (my_wins, opp_wins) = session.score();

        match applied {
            Applied::Duplicate => {
                self.metrics.events_duplicate.inc();
                debug!(%match_id, kind = event.kind(), source, "duplicate event");
            }
            Applied::Ignored => {
                debug!(%match_id, kind = event.kind(), %phase, source, "event not applicable");
            }
            Applied::ForeignMatch => self.discard_orphan(event, source),
            Applied::Transitioned { from, to } => {
                self.metrics.events_applied.inc();
                debug!(%match_id, kind = event.kind(), %from, %to, source, "transition");
                self.watchdog.arm(&match_id, to);
                self.notify_round(event, my_wins, opp_wins);
            }
            Applied::Concluded(resolution) => {
                self.metrics.events_applied.inc();
                self.notify_round(event, my_wins, opp_wins);
                self.conclude(resolution, event);
            }
        }
        applied
    }

    fn notify_round(&mut self, event: &Event, my_wins: u32, opp_wins: u32) {
        match event {
            Event::RoundStart { match_id, .. } => self.notify(Notice::RoundStarted {
                match_id: match_id.clone(),
            }),
            Event::RoundEnd {
                match_id,
                round_id,
                winner,
            } => self.notify(Notice::RoundEnded {
                match_id: match_id.clone(),
                round_id: round_id.clone(),
                winner: winner.clone(),
                my_wins,
                opp_wins,
            }),
            _ => {}
        }
    }

    /// Tear down a finished session: watchdog first, then the ledger.
    fn conclude(&mut self, resolution: Resolution, event: &Event) {
        self.watchdog.cancel();
        let Some(session) = self.session.take() else {
            return;
        };
        let match_id = session.id().clone();
        let mode = session.mode();
        let (my_wins, opp_wins) = session.score();
        info!(%match_id, %mode, %resolution, my_wins, opp_wins, "match finished");

        match resolution {
            Resolution::Won => self.metrics.matches_won.inc(),
            Resolution::Lost => self.metrics.matches_lost.inc(),
            Resolution::Aborted => self.metrics.matches_aborted.inc(),
        };
        if resolution.is_ranked() {
            self.pending_results.push_back(PendingResult {
                match_id: match_id.clone(),
                mode,
                won: resolution == Resolution::Won,
            });
            self.flush_results();
        }

        match event {
            Event::Abort { reason, .. } => self.notify(Notice::MatchAborted {
                match_id: match_id.clone(),
                reason: reason.clone(),
            }),
            _ => self.notify(Notice::MatchFinished {
                match_id: match_id.clone(),
                mode,
                resolution,
                my_wins,
                opp_wins,
            }),
        }

        if self.recent.len() == RECENT_MATCHES {
            self.recent.pop_front();
        }
        self.recent.push_back(match_id);
        self.last_finished = Some(SessionView::from(&session));
    }

    /// Write retained results in order, stopping at the first failure.
    fn flush_results(&mut self) {
        while let Some(pending) = self.pending_results.front() {
            match self.ledger.record_result(pending.mode, pending.won) {
                Ok(record) => {
                    info!(
                        match_id = %pending.match_id,
                        mode = %pending.mode,
                        wins = record.wins,
                        losses = record.losses,
                        "rank updated"
                    );
                    self.pending_results.pop_front();
                }
                Err(err) => {
                    warn!(
                        match_id = %pending.match_id,
                        mode = %pending.mode,
                        error = %err,
                        "rank ledger write failed; will retry"
                    );
                    return;
                }
            }
        }
    }

    fn discard_orphan(&mut self, event: &Event, source: &'static str) {
        match event.match_id() {
            Some(match_id) if self.recent.contains(match_id) => {
                self.metrics.events_duplicate.inc();
                debug!(%match_id, kind = event.kind(), source, "late event for finished match");
            }
            match_id => {
                self.metrics.events_discarded.inc();
                warn!(match_id = ?match_id, kind = event.kind(), source, "discarding event for unknown match");
            }
        }
    }

    fn handle_fired(&mut self, fired: Fired) {
        if !self.watchdog.is_current(&fired) {
            trace!(match_id = %fired.match_id, generation = fired.generation, "stale watchdog firing");
            return;
        }
        let Some(session) = self.session.as_ref() else {
            self.watchdog.cancel();
            return;
        };
        let match_id = session.id().clone();
        match session.phase() {
            Phase::InRound => {
                let since = session.since_last_change(Instant::now()).as_millis() as u64;
                self.metrics.watchdog_pings.inc();
                debug!(%match_id, since, "round stalled; pinging");
                let coordinator = self.coordinator.clone();
                let id = match_id.clone();
                self.spawn_call(
                    async move { coordinator.ping(id, Phase::InRound, since).await },
                    move |result| Completion::Acked {
                        call: "ping",
                        match_id,
                        result,
                    },
                );
            }
            Phase::Between => {
                self.metrics.watchdog_nudges.inc();
                debug!(%match_id, "waiting between rounds; requesting next");
                let coordinator = self.coordinator.clone();
                let id = match_id.clone();
                self.spawn_call(
                    async move { coordinator.next(id).await },
                    move |result| Completion::Acked {
                        call: "next",
                        match_id,
                        result,
                    },
                );
            }
            Phase::Finished => {
                self.watchdog.cancel();
                return;
            }
        }
        // Nothing moved since the last arm.
        self.watchdog.back_off();
    }

    fn maybe_poll(&mut self) {
        if self.polling || !(self.queue.is_engaged() || self.session.is_some()) {
            return;
        }
        self.polling = true;
        let coordinator = self.coordinator.clone();
        self.spawn_call(
            async move { coordinator.notifications().await },
            Completion::Polled,
        );
    }

    fn housekeeping(&mut self) {
        if self.queue.expire_cancelled(Instant::now(), self.config.cancel_grace) {
            debug!("dropped cancelled ticket");
        }
        if !self.pending_results.is_empty() {
            self.metrics.ledger_retries.inc();
            self.flush_results();
        }
    }

    fn notify(&self, notice: Notice) {
        // No receivers is fine.
        let _ = self.notices.send(notice);
    }

    /// Run `call` off the engine task with the request timeout and deliver
    /// its result as a completion.
    fn spawn_call<T, F>(
        &self,
        call: F,
        complete: impl FnOnce(Result<T, TransportError>) -> Completion + Send + 'static,
    ) where
        T: Send + 'static,
        F: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let completer = self.completer.clone();
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            let _ = completer.send(complete(result));
        });
    }

    /// Keep the push feed open, reconnecting with jittered backoff.
    fn spawn_feed(&self) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        let completer = self.completer.clone();
        let metrics = self.metrics.clone();
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            let mut backoff = Backoff::new(FEED_RECONNECT_INITIAL, FEED_RECONNECT_MAX);
            loop {
                metrics.feed_reconnects.inc();
                let connected = match tokio::time::timeout(timeout, coordinator.subscribe()).await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout),
                };
                match connected {
                    Ok(mut stream) => {
                        info!("push feed connected");
                        metrics.feed_connected.set(1);
                        backoff.reset();
                        while let Some(item) = stream.next().await {
                            match item {
                                Ok(event) => {
                                    if completer.send(Completion::Pushed(event)).is_err() {
                                        return;
                                    }
                                }
                                Err(err) if err.is_malformed() => {
                                    metrics.events_discarded.inc();
                                    warn!(error = %err, "discarding malformed push event");
                                }
                                Err(err) => {
                                    warn!(error = %err, "push feed failed");
                                    break;
                                }
                            }
                        }
                        metrics.feed_connected.set(0);
                        warn!("push feed ended");
                    }
                    Err(err) => {
                        metrics.transport_failures.inc();
                        warn!(error = %err, "failed to open push feed");
                    }
                }
                let delay = jittered(&mut rng, backoff.advance());
                tokio::time::sleep(delay).await;
            }
        })
    }
}
