use prometheus_client::registry::Registry;
use skirmish_client::{Client, RetryPolicy};
use skirmish_orchestrator::{
    engine::{Actor, Config, Mailbox, Notice},
    ledger::{LedgerReader, RankLedger},
    metrics,
    session::Resolution,
    watchdog::WatchdogConfig,
};
use skirmish_simulator::{Api, RoundPolicy, Simulator, SimulatorConfig};
use skirmish_types::{Mode, PlayerId};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::broadcast;

async fn serve_simulator(round_policy: RoundPolicy) -> String {
    let simulator = Arc::new(Simulator::new(SimulatorConfig {
        round_policy,
        ..SimulatorConfig::default()
    }));
    let router = Api::new(simulator).router();
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("http://{addr}")
}

fn config(player: &PlayerId, push_enabled: bool) -> Config {
    Config {
        player: player.clone(),
        mailbox_size: 16,
        notice_buffer: 256,
        request_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(50),
        housekeeping_interval: Duration::from_millis(100),
        cancel_grace: Duration::from_secs(5),
        push_enabled,
        rounds_to_win: HashMap::new(),
        watchdog: WatchdogConfig {
            in_round: Duration::from_millis(50),
            between: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
            jitter: false,
        },
    }
}

struct Running {
    mailbox: Mailbox,
    notices: broadcast::Receiver<Notice>,
    ledger: LedgerReader,
    registry: Registry,
}

async fn start(url: &str, player: &str, push_enabled: bool) -> Running {
    let player = PlayerId::new(player);
    let client = Client::with_timeout(url, player.clone(), Duration::from_secs(2))
        .unwrap()
        .with_retry_policy(RetryPolicy::default());
    let mut registry = Registry::default();
    let (actor, mailbox) = Actor::new(
        config(&player, push_enabled),
        client,
        RankLedger::in_memory(),
        &mut registry,
    );
    let ledger = actor.ledger_reader();
    let notices = mailbox.notices();
    actor.start();
    Running {
        mailbox,
        notices,
        ledger,
        registry,
    }
}

/// Collect notices until the match ends.
async fn play_out(notices: &mut broadcast::Receiver<Notice>) -> Vec<Notice> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match notices.recv().await {
                Ok(notice) => {
                    let done = matches!(
                        notice,
                        Notice::MatchFinished { .. } | Notice::MatchAborted { .. }
                    );
                    seen.push(notice);
                    if done {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("engine stopped"),
            }
        }
    })
    .await
    .expect("match did not finish in time");
    seen
}

#[tokio::test]
async fn duel_against_simulator_is_ranked_once() {
    let url = serve_simulator(RoundPolicy::PlayerWins).await;
    let mut running = start(&url, "alice", true).await;

    running.mailbox.enqueue(Mode::Duel).await.unwrap();
    let seen = play_out(&mut running.notices).await;

    assert!(seen
        .iter()
        .any(|notice| matches!(notice, Notice::MatchStarted { mode: Mode::Duel, .. })));
    let rounds = seen
        .iter()
        .filter(|notice| matches!(notice, Notice::RoundEnded { .. }))
        .count();
    assert_eq!(rounds, 2);
    match seen.last() {
        Some(Notice::MatchFinished {
            resolution,
            my_wins,
            opp_wins,
            ..
        }) => {
            assert_eq!(*resolution, Resolution::Won);
            assert_eq!((*my_wins, *opp_wins), (2, 0));
        }
        other => panic!("unexpected final notice: {other:?}"),
    }

    // Late copies of the finish keep arriving on the other channel.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let record = running.ledger.record(Mode::Duel);
    assert_eq!((record.wins, record.losses), (1, 0));

    let status = running.mailbox.status().await.unwrap();
    assert!(status.session.is_none());
    assert!(status.ticket.is_none());
    assert_eq!(status.pending_results, 0);
    let rendered = metrics::render(&running.registry);
    assert!(rendered.contains("orchestrator_matches_won_total 1"), "{rendered}");
}

#[tokio::test]
async fn pull_channel_alone_finishes_a_lost_match() {
    let url = serve_simulator(RoundPolicy::BotWins).await;
    let mut running = start(&url, "bob", false).await;

    running.mailbox.enqueue(Mode::Duel).await.unwrap();
    let seen = play_out(&mut running.notices).await;

    match seen.last() {
        Some(Notice::MatchFinished { resolution, .. }) => {
            assert_eq!(*resolution, Resolution::Lost)
        }
        other => panic!("unexpected final notice: {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    let record = running.ledger.record(Mode::Duel);
    assert_eq!((record.wins, record.losses), (0, 1));
}

#[tokio::test]
async fn second_match_can_be_queued_after_the_first() {
    let url = serve_simulator(RoundPolicy::Alternate).await;
    let mut running = start(&url, "carol", true).await;

    for _ in 0..2 {
        running.mailbox.enqueue(Mode::Duel).await.unwrap();
        play_out(&mut running.notices).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    let record = running.ledger.record(Mode::Duel);
    assert_eq!(record.wins + record.losses, 2);
}
