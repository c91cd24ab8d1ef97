use super::*;
use crate::{
    ledger::{LedgerReader, RankLedger, RankRecord},
    metrics,
    queue::{QueueError, TicketState},
    transport::{Call, Mock, TransportError},
};
use prometheus_client::registry::Registry;
use skirmish_types::{EnqueueResponse, Event, MatchFound};
use tokio::sync::broadcast;

fn me() -> PlayerId {
    PlayerId::new("me")
}

fn bot() -> PlayerId {
    PlayerId::new("bot")
}

fn config() -> Config {
    Config {
        player: me(),
        mailbox_size: 16,
        notice_buffer: 64,
        request_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_secs(2),
        housekeeping_interval: Duration::from_secs(5),
        cancel_grace: Duration::from_secs(30),
        push_enabled: true,
        rounds_to_win: HashMap::new(),
        watchdog: WatchdogConfig {
            in_round: Duration::from_secs(8),
            between: Duration::from_secs(15),
            max_backoff: Duration::from_secs(60),
            jitter: false,
        },
    }
}

fn duel_found(match_id: &str) -> Event {
    Event::MatchFound(MatchFound {
        match_id: match_id.into(),
        mode: Mode::Duel,
        players: vec![me(), bot()],
        teams: None,
        rounds_to_win: None,
        loadout: Some(serde_json::json!({"hat": "none"})),
        inventory: None,
    })
}

fn round_start(match_id: &str) -> Event {
    Event::RoundStart {
        match_id: match_id.into(),
        round_id: None,
    }
}

fn round_end(match_id: &str, round_id: &str, winner: PlayerId) -> Event {
    Event::RoundEnd {
        match_id: match_id.into(),
        round_id: round_id.into(),
        winner,
    }
}

fn finish(match_id: &str, winner: PlayerId) -> Event {
    Event::Finish {
        match_id: match_id.into(),
        winner,
    }
}

/// Let every ready task run without moving timers that matter.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

struct Harness {
    mailbox: Mailbox,
    notices: broadcast::Receiver<Notice>,
    mock: Mock,
    ledger: LedgerReader,
    registry: Registry,
}

impl Harness {
    async fn start(config: Config) -> Self {
        Self::start_with_ledger(config, RankLedger::in_memory()).await
    }

    async fn start_with_ledger(config: Config, ledger: RankLedger) -> Self {
        let mock = Mock::new();
        let mut registry = Registry::default();
        let (actor, mailbox) = Actor::new(config, mock.clone(), ledger, &mut registry);
        let ledger = actor.ledger_reader();
        let notices = mailbox.notices();
        actor.start();
        settle().await;
        Self {
            mailbox,
            notices,
            mock,
            ledger,
            registry,
        }
    }

    async fn status(&mut self) -> Status {
        self.mailbox.status().await.expect("engine stopped")
    }

    async fn session(&mut self) -> Option<SessionView> {
        self.status().await.session
    }

    /// Queue for a duel and receive `m1` on the push feed.
    async fn enter_duel(&mut self) {
        self.mailbox.enqueue(Mode::Duel).await.unwrap();
        settle().await;
        self.mock.push(duel_found("m1"));
        settle().await;
        assert!(self.session().await.is_some(), "match was not entered");
    }

    async fn push(&mut self, event: Event) {
        self.mock.push(event);
        settle().await;
    }

    fn drain(&mut self) -> Vec<Notice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }
}

fn finished_count(notices: &[Notice]) -> usize {
    notices
        .iter()
        .filter(|notice| matches!(notice, Notice::MatchFinished { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn duel_runs_to_completion_and_ranks_once() {
    let mut h = Harness::start(config()).await;

    let ticket = h.mailbox.enqueue(Mode::Duel).await.unwrap();
    assert_eq!(ticket.state, TicketState::Pending);
    settle().await;
    assert_eq!(h.status().await.ticket.unwrap().state, TicketState::Queued);

    h.push(duel_found("m1")).await;
    let session = h.session().await.unwrap();
    assert_eq!(session.phase, Phase::Between);
    assert_eq!((session.my_wins, session.opp_wins), (0, 0));
    assert_eq!(session.rounds_to_win, 2);
    assert!(h.status().await.ticket.is_none());

    h.push(round_start("m1")).await;
    assert_eq!(h.session().await.unwrap().phase, Phase::InRound);

    h.push(round_end("m1", "r1", me())).await;
    let session = h.session().await.unwrap();
    assert_eq!(session.phase, Phase::Between);
    assert_eq!((session.my_wins, session.opp_wins), (1, 0));

    h.push(round_end("m1", "r1", me())).await;
    let session = h.session().await.unwrap();
    assert_eq!(session.phase, Phase::Between);
    assert_eq!((session.my_wins, session.opp_wins), (1, 0));

    h.push(round_end("m1", "r2", me())).await;
    let status = h.status().await;
    assert!(status.session.is_none());
    let last = status.last_finished.unwrap();
    assert_eq!(last.phase, Phase::Finished);
    assert_eq!((last.my_wins, last.opp_wins), (2, 0));
    assert_eq!(last.resolution, Some(Resolution::Won));
    assert_eq!(h.ledger.record(Mode::Duel), RankRecord { wins: 1, losses: 0 });

    let notices = h.drain();
    assert_eq!(
        notices[0],
        Notice::Queued {
            mode: Mode::Duel,
            position: Some(1)
        }
    );
    assert!(matches!(
        &notices[1],
        Notice::MatchStarted { match_id, loadout: Some(_), .. } if match_id.as_str() == "m1"
    ));
    assert!(notices.contains(&Notice::RoundStarted {
        match_id: "m1".into()
    }));
    let round_ends = notices
        .iter()
        .filter(|notice| matches!(notice, Notice::RoundEnded { .. }))
        .count();
    assert_eq!(round_ends, 2);
    assert_eq!(finished_count(&notices), 1);
    assert_eq!(
        notices.last(),
        Some(&Notice::MatchFinished {
            match_id: "m1".into(),
            mode: Mode::Duel,
            resolution: Resolution::Won,
            my_wins: 2,
            opp_wins: 0,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn finish_on_both_channels_ranks_once() {
    let mut h = Harness::start(config()).await;
    h.enter_duel().await;

    // The poll channel delivers it first, the push feed replays it twice.
    h.mock.queue_notification(&finish("m1", bot()));
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert!(h.mock.count(|call| *call == Call::Notifications) >= 1);
    assert!(h.session().await.is_none());

    h.push(finish("m1", bot())).await;
    h.push(finish("m1", bot())).await;
    h.push(round_end("m1", "r9", me())).await;

    assert_eq!(h.ledger.record(Mode::Duel), RankRecord { wins: 0, losses: 1 });
    assert_eq!(finished_count(&h.drain()), 1);
    let rendered = metrics::render(&h.registry);
    assert!(rendered.contains("orchestrator_matches_lost_total 1"));
    assert!(rendered.contains("orchestrator_events_duplicate_total 3"));
}

#[tokio::test(start_paused = true)]
async fn no_pings_after_finish() {
    let mut h = Harness::start(config()).await;
    h.enter_duel().await;
    h.push(round_start("m1")).await;
    h.push(finish("m1", me())).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.mock.count(|call| matches!(call, Call::Ping { .. })), 0);
    assert_eq!(h.mock.count(|call| matches!(call, Call::Next(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn watchdog_nudges_then_pings_with_backoff() {
    let mut h = Harness::start(config()).await;
    h.enter_duel().await;

    tokio::time::sleep(Duration::from_millis(15_100)).await;
    assert_eq!(h.mock.count(|call| *call == Call::Next("m1".into())), 1);
    assert_eq!(h.mock.count(|call| matches!(call, Call::Ping { .. })), 0);

    h.push(round_start("m1")).await;
    tokio::time::sleep(Duration::from_millis(8_100)).await;
    let pings: Vec<u64> = h
        .mock
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Ping {
                match_id,
                phase: Phase::InRound,
                since,
            } if match_id.as_str() == "m1" => Some(since),
            _ => None,
        })
        .collect();
    assert_eq!(pings.len(), 1);
    assert!((8_000..8_100).contains(&pings[0]), "since was {}", pings[0]);

    // Still no progress: the next ping waits twice as long.
    tokio::time::sleep(Duration::from_millis(15_000)).await;
    assert_eq!(h.mock.count(|call| matches!(call, Call::Ping { .. })), 1);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let since = h
        .mock
        .calls()
        .into_iter()
        .rev()
        .find_map(|call| match call {
            Call::Ping { since, .. } => Some(since),
            _ => None,
        })
        .unwrap();
    assert_eq!(h.mock.count(|call| matches!(call, Call::Ping { .. })), 2);
    assert!((24_000..24_200).contains(&since), "since was {since}");

    // The watchdog never changed the session.
    assert_eq!(h.session().await.unwrap().phase, Phase::InRound);
}

#[tokio::test(start_paused = true)]
async fn match_found_during_dequeue_is_entered() {
    let mut h = Harness::start(config()).await;
    h.mailbox.enqueue(Mode::Duel).await.unwrap();
    settle().await;

    h.mock.set_dequeue_delay(Duration::from_millis(500));
    assert!(h.mailbox.dequeue().await);
    assert_eq!(
        h.status().await.ticket.unwrap().state,
        TicketState::Cancelling
    );
    h.push(duel_found("m1")).await;
    let status = h.status().await;
    assert!(status.session.is_some());
    assert!(status.ticket.is_none());

    // The late confirmation does not resurrect the ticket.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let status = h.status().await;
    assert!(status.session.is_some());
    assert!(status.ticket.is_none());
    assert_eq!(h.mock.count(|call| *call == Call::Dequeue), 1);
}

#[tokio::test(start_paused = true)]
async fn match_found_after_dequeue_is_entered_within_grace() {
    let mut h = Harness::start(config()).await;
    assert!(!h.mailbox.dequeue().await);

    h.mailbox.enqueue(Mode::Duel).await.unwrap();
    settle().await;
    assert!(h.mailbox.dequeue().await);
    settle().await;
    assert!(h.status().await.ticket.is_none());

    h.push(duel_found("m1")).await;
    assert_eq!(h.session().await.unwrap().match_id.as_str(), "m1");
}

#[tokio::test(start_paused = true)]
async fn dequeue_waits_for_enqueue_to_complete() {
    let mut h = Harness::start(config()).await;
    h.mock.set_enqueue_delay(Duration::from_millis(500));
    h.mailbox.enqueue(Mode::Duel).await.unwrap();
    assert!(h.mailbox.dequeue().await);
    assert!(!h.mailbox.dequeue().await);
    settle().await;
    assert_eq!(
        h.status().await.ticket.unwrap().state,
        TicketState::CancelRequested
    );
    assert_eq!(h.mock.count(|call| *call == Call::Dequeue), 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let calls = h.mock.calls();
    let enqueued = calls.iter().position(|call| *call == Call::Enqueue(Mode::Duel));
    let dequeued = calls.iter().position(|call| *call == Call::Dequeue);
    assert!(enqueued.unwrap() < dequeued.unwrap());
    assert_eq!(h.mock.count(|call| *call == Call::Dequeue), 1);
    assert!(h.status().await.ticket.is_none());
    assert!(!h
        .drain()
        .iter()
        .any(|notice| matches!(notice, Notice::Queued { .. })));

    // A match committed before the dequeue landed is still entered.
    h.push(duel_found("m1")).await;
    assert!(h.session().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn cancelled_enqueue_that_is_rejected_sends_no_dequeue() {
    let mut h = Harness::start(config()).await;
    h.mock.set_enqueue_delay(Duration::from_millis(500));
    h.mock.set_enqueue_response(Ok(EnqueueResponse {
        ok: false,
        ticket_position: None,
        reason: Some("full".to_string()),
    }));
    h.mailbox.enqueue(Mode::Duel).await.unwrap();
    assert!(h.mailbox.dequeue().await);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.mock.count(|call| *call == Call::Dequeue), 0);
    assert!(h.status().await.ticket.is_none());
    assert!(h.drain().is_empty());
    h.push(duel_found("m1")).await;
    assert!(h.session().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn cancelled_ticket_expires() {
    let mut h = Harness::start(config()).await;
    h.mailbox.enqueue(Mode::Duel).await.unwrap();
    settle().await;
    assert!(h.mailbox.dequeue().await);
    settle().await;

    tokio::time::sleep(Duration::from_secs(36)).await;
    h.push(duel_found("m1")).await;
    assert!(h.session().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn unsolicited_match_found_is_discarded() {
    let mut h = Harness::start(config()).await;
    h.push(duel_found("m1")).await;
    assert!(h.session().await.is_none());

    // A match that leaves the local player out does not consume the ticket.
    h.mailbox.enqueue(Mode::Duel).await.unwrap();
    settle().await;
    h.push(Event::MatchFound(MatchFound {
        match_id: "m2".into(),
        mode: Mode::Duel,
        players: vec![PlayerId::new("a"), PlayerId::new("b")],
        teams: None,
        rounds_to_win: None,
        loadout: None,
        inventory: None,
    }))
    .await;
    let status = h.status().await;
    assert!(status.session.is_none());
    assert!(status.ticket.is_some());
    assert!(metrics::render(&h.registry).contains("orchestrator_events_discarded_total 2"));
}

#[tokio::test(start_paused = true)]
async fn refuses_second_enqueue_locally() {
    let mut h = Harness::start(config()).await;
    h.mailbox.enqueue(Mode::Duel).await.unwrap();
    assert_eq!(
        h.mailbox.enqueue(Mode::Team2).await,
        Err(QueueError::AlreadyQueued)
    );
    settle().await;
    h.push(duel_found("m1")).await;
    assert_eq!(
        h.mailbox.enqueue(Mode::Duel).await,
        Err(QueueError::MatchInProgress)
    );
    assert_eq!(
        h.mock.count(|call| matches!(call, Call::Enqueue(_))),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn failed_enqueue_is_surfaced_and_clears_ticket() {
    let mut h = Harness::start(config()).await;
    h.mock.set_enqueue_response(Ok(EnqueueResponse {
        ok: false,
        ticket_position: None,
        reason: Some("region closed".to_string()),
    }));
    h.mailbox.enqueue(Mode::Duel).await.unwrap();
    settle().await;
    assert!(h.status().await.ticket.is_none());
    assert_eq!(
        h.drain(),
        vec![Notice::QueueFailed {
            mode: Mode::Duel,
            reason: "coordinator rejected enqueue: region closed".to_string(),
            retryable: false,
        }]
    );

    h.mock
        .set_enqueue_response(Err(TransportError::Unavailable("refused".to_string())));
    h.mailbox.enqueue(Mode::Team3).await.unwrap();
    settle().await;
    assert!(h.status().await.ticket.is_none());
    assert!(matches!(
        h.drain().as_slice(),
        [Notice::QueueFailed {
            mode: Mode::Team3,
            retryable: true,
            ..
        }]
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_ledger_write_is_retried() {
    let mut ledger = RankLedger::in_memory();
    ledger.fail_next_writes(1);
    let mut h = Harness::start_with_ledger(config(), ledger).await;
    h.enter_duel().await;

    h.push(finish("m1", me())).await;
    assert_eq!(h.ledger.record(Mode::Duel), RankRecord::default());
    assert_eq!(h.status().await.pending_results, 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.ledger.record(Mode::Duel), RankRecord { wins: 1, losses: 0 });
    assert_eq!(h.status().await.pending_results, 0);

    // The coordinator repeating itself changes nothing.
    h.push(finish("m1", me())).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.ledger.record(Mode::Duel).wins, 1);
}

#[tokio::test(start_paused = true)]
async fn local_round_reports_are_forwarded() {
    let mut h = Harness::start(config()).await;
    assert_eq!(h.mailbox.report_round("r1".into(), me()).await, None);
    h.enter_duel().await;
    h.drain();

    let report = h.mailbox.report_round("r1".into(), me()).await.unwrap();
    assert_eq!(
        report,
        RoundReport {
            match_id: "m1".into(),
            round_id: "r1".into(),
            winner: me(),
            my_wins: 1,
            opp_wins: 0,
            decisive: false,
        }
    );
    assert_eq!(h.drain(), vec![Notice::RoundReported(report.clone())]);
    // Only the coordinator moves the session.
    let session = h.session().await.unwrap();
    assert_eq!((session.my_wins, session.opp_wins), (0, 0));

    // Reporting the same round again sends nothing new.
    assert_eq!(h.mailbox.report_round("r1".into(), me()).await, Some(report));
    h.push(round_end("m1", "r1", me())).await;
    let session = h.session().await.unwrap();
    assert_eq!((session.my_wins, session.opp_wins), (1, 0));

    let report = h.mailbox.report_round("r2".into(), me()).await.unwrap();
    assert_eq!((report.my_wins, report.opp_wins), (2, 0));
    assert!(report.decisive);
    settle().await;
    assert!(h.session().await.is_some());
    assert_eq!(h.ledger.record(Mode::Duel), RankRecord::default());

    h.push(round_end("m1", "r2", me())).await;
    h.push(finish("m1", me())).await;
    assert!(h.session().await.is_none());

    let calls = h.mock.calls();
    assert!(calls.contains(&Call::ReportRound {
        match_id: "m1".into(),
        round_id: "r1".into(),
        winner: me(),
        my_wins: 1,
        opp_wins: 0,
    }));
    assert!(calls.contains(&Call::ReportRound {
        match_id: "m1".into(),
        round_id: "r2".into(),
        winner: me(),
        my_wins: 2,
        opp_wins: 0,
    }));
    assert_eq!(
        h.mock.count(|call| matches!(call, Call::ReportRound { .. })),
        2
    );
    assert_eq!(
        h.mock
            .count(|call| matches!(call, Call::ReportFinish { winner, .. } if *winner == me())),
        1
    );
    assert_eq!(h.ledger.record(Mode::Duel), RankRecord { wins: 1, losses: 0 });
}

#[tokio::test(start_paused = true)]
async fn coordinator_overrides_local_round_reports() {
    let mut h = Harness::start(config()).await;
    h.enter_duel().await;

    // Both rounds claimed locally, enough to take the match.
    h.mailbox.report_round("r1".into(), me()).await.unwrap();
    let report = h.mailbox.report_round("r2".into(), me()).await.unwrap();
    assert!(report.decisive);
    settle().await;
    assert_eq!(
        h.mock.count(|call| matches!(call, Call::ReportFinish { .. })),
        1
    );
    h.drain();

    // The coordinator saw it the other way.
    h.push(round_end("m1", "r1", bot())).await;
    let session = h.session().await.unwrap();
    assert_eq!((session.my_wins, session.opp_wins), (0, 1));
    let report = h.mailbox.report_round("r2".into(), me()).await.unwrap();
    assert_eq!((report.my_wins, report.opp_wins), (1, 1));
    assert!(!report.decisive);

    h.push(round_end("m1", "r2", bot())).await;
    h.push(finish("m1", bot())).await;
    let finished: Vec<_> = h
        .drain()
        .into_iter()
        .filter_map(|notice| match notice {
            Notice::MatchFinished {
                resolution,
                my_wins,
                opp_wins,
                ..
            } => Some((resolution, my_wins, opp_wins)),
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec![(Resolution::Lost, 0, 2)]);
    assert_eq!(h.ledger.record(Mode::Duel), RankRecord { wins: 0, losses: 1 });
    assert_eq!(h.mailbox.report_round("r3".into(), me()).await, None);
}

#[tokio::test(start_paused = true)]
async fn poll_channel_alone_drives_the_match() {
    let mut config = config();
    config.push_enabled = false;
    let mut h = Harness::start(config).await;
    assert_eq!(h.mock.count(|call| *call == Call::Subscribe), 0);

    h.mailbox.enqueue(Mode::Duel).await.unwrap();
    h.mock.queue_notification(&duel_found("m1"));
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert!(h.session().await.is_some());

    // A malformed entry does not hide the valid one after it.
    h.mock
        .queue_raw_notification(serde_json::json!({"type": "match.round", "matchId": "m1"}));
    h.mock.queue_notification(&round_end("m1", "r1", bot()));
    tokio::time::sleep(Duration::from_secs(2)).await;
    let session = h.session().await.unwrap();
    assert_eq!((session.my_wins, session.opp_wins), (0, 1));
}

#[tokio::test(start_paused = true)]
async fn push_feed_reconnects() {
    let mut h = Harness::start(config()).await;
    assert_eq!(h.mock.count(|call| *call == Call::Subscribe), 1);

    h.mock.disconnect();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.mock.count(|call| *call == Call::Subscribe), 2);

    h.enter_duel().await;
}

#[tokio::test(start_paused = true)]
async fn hung_poll_times_out_and_resumes() {
    let mut h = Harness::start(config()).await;
    h.mock.set_notifications_delay(Duration::from_secs(3_600));
    h.mailbox.enqueue(Mode::Duel).await.unwrap();

    tokio::time::sleep(Duration::from_millis(4_500)).await;
    assert!(h.mock.count(|call| *call == Call::Notifications) >= 2);
    assert!(metrics::render(&h.registry).contains("orchestrator_transport_failures_total 1"));
}

#[tokio::test(start_paused = true)]
async fn abort_is_surfaced_but_not_ranked() {
    let mut h = Harness::start(config()).await;
    h.enter_duel().await;
    h.drain();

    h.push(Event::Abort {
        match_id: "m1".into(),
        reason: "server restart".to_string(),
    })
    .await;
    assert_eq!(
        h.drain(),
        vec![Notice::MatchAborted {
            match_id: "m1".into(),
            reason: "server restart".to_string(),
        }]
    );
    assert_eq!(h.ledger.record(Mode::Duel), RankRecord::default());
    assert_eq!(
        h.status().await.last_finished.unwrap().resolution,
        Some(Resolution::Aborted)
    );

    // A new match can be queued for straight away.
    assert!(h.mailbox.enqueue(Mode::Duel).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn foreign_events_leave_session_alone() {
    let mut h = Harness::start(config()).await;
    h.enter_duel().await;
    h.push(round_end("other", "r1", bot())).await;
    h.push(finish("other", bot())).await;

    let session = h.session().await.unwrap();
    assert_eq!(session.match_id.as_str(), "m1");
    assert_eq!((session.my_wins, session.opp_wins), (0, 0));
    assert_eq!(session.phase, Phase::Between);
}
