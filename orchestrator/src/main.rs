use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Response, StatusCode},
    routing::get,
    Router,
};
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use prometheus_client::registry::Registry;
use skirmish_client::{Client, RetryPolicy};
use skirmish_orchestrator::{
    backoff::Backoff,
    engine::{Actor, Mailbox, Notice},
    ledger::{LedgerReader, RankLedger},
    metrics, Config, ValidatedConfig,
};
use skirmish_types::Mode;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless skirmish match orchestrator")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Override `player_id` from the configuration file.
    #[arg(long)]
    player: Option<String>,

    /// Join the queue for this mode on startup.
    #[arg(long)]
    mode: Option<Mode>,

    /// Matches to play before exiting (requires --mode).
    #[arg(long, default_value_t = 1)]
    matches: u32,

    /// Validate configuration and exit without contacting the coordinator.
    #[arg(long)]
    dry_run: bool,
}

fn load_config(args: &Args) -> Result<(ValidatedConfig, String)> {
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read config {}", args.config.display()))?;
    let mut config: Config = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", args.config.display()))?;
    if let Some(player) = &args.player {
        config.player_id = player.clone();
    }
    let rendered = format!("{:?}", config.redacted_debug());
    let config = config.validate().context("invalid configuration")?;
    Ok((config, rendered))
}

fn init_tracing(level: Level) -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name = std::env::var("OTEL_SERVICE_NAME")
            .unwrap_or_else(|_| "skirmish-orchestrator".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("skirmish-orchestrator");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::from_level(level)))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }

    Ok(())
}

struct MetricsState {
    registry: Arc<Registry>,
    auth_token: Option<String>,
}

fn metrics_auth_token() -> Option<String> {
    let token = std::env::var("METRICS_AUTH_TOKEN").ok()?;
    let trimmed = token.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn authorize_metrics(headers: &HeaderMap, token: Option<&str>) -> Result<(), StatusCode> {
    if let Some(token) = token {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        let header_token = headers
            .get("x-metrics-token")
            .and_then(|value| value.to_str().ok());

        if bearer != Some(token) && header_token != Some(token) {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    Ok(())
}

async fn metrics_handler(
    State(state): State<Arc<MetricsState>>,
    headers: HeaderMap,
) -> Result<Response<Body>, StatusCode> {
    authorize_metrics(&headers, state.auth_token.as_deref())?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(metrics::render(&state.registry)))
        .map_err(|err| {
            error!("metrics response build failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

fn spawn_metrics_server(registry: Arc<Registry>, addr: SocketAddr) {
    let state = Arc::new(MetricsState {
        registry,
        auth_token: metrics_auth_token(),
    });
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("metrics server bind failed on {addr}: {err}");
                return;
            }
        };
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(state);
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            error!("metrics server failed on {addr}: {err}");
        }
    });
}

fn print_dry_run_report(config: &ValidatedConfig) {
    println!("dry-run report");
    println!("  player: {}", config.player);
    println!("  coordinator: {}", config.coordinator_url);
    match &config.ledger_path {
        Some(path) => println!("  ledger: {}", path.display()),
        None => println!("  ledger: in-memory"),
    }
    match config.metrics_port {
        Some(port) => println!("  metrics_port: {port}"),
        None => println!("  metrics_port: disabled"),
    }
    println!(
        "  transport: request_timeout={:?} retry_attempts={} push={} poll_interval={:?}",
        config.request_timeout, config.retry_attempts, config.push_enabled, config.poll_interval
    );
    println!(
        "  watchdog: in_round={:?} between={:?} max_backoff={:?} jitter={}",
        config.watchdog.in_round,
        config.watchdog.between,
        config.watchdog.max_backoff,
        config.watchdog.jitter
    );
    println!(
        "  queue: cancel_grace={:?} housekeeping={:?}",
        config.cancel_grace, config.housekeeping_interval
    );
    for mode in Mode::ALL {
        println!(
            "  rounds_to_win[{mode}]: {}",
            config.rounds_to_win.get(&mode).copied().unwrap_or_default()
        );
    }
}

/// Log a notice. Returns true once a match has ended either way.
fn log_notice(notice: &Notice, ledger: &LedgerReader) -> bool {
    match notice {
        Notice::Queued { mode, position } => {
            info!(%mode, ?position, "queued");
        }
        Notice::QueuePosition {
            mode,
            position,
            eta_secs,
        } => {
            info!(%mode, position, ?eta_secs, "queue position");
        }
        Notice::QueueFailed {
            mode,
            reason,
            retryable,
        } => {
            warn!(%mode, %reason, retryable, "enqueue failed");
        }
        Notice::MatchStarted {
            match_id,
            mode,
            players,
            rounds_to_win,
            ..
        } => {
            info!(%match_id, %mode, players = players.len(), rounds_to_win, "match started");
        }
        Notice::RoundStarted { match_id } => {
            info!(%match_id, "round started");
        }
        Notice::RoundEnded {
            match_id,
            round_id,
            winner,
            my_wins,
            opp_wins,
        } => {
            info!(%match_id, %round_id, %winner, my_wins, opp_wins, "round ended");
        }
        Notice::RoundReported(report) => {
            debug!(
                match_id = %report.match_id,
                round_id = %report.round_id,
                winner = %report.winner,
                my_wins = report.my_wins,
                opp_wins = report.opp_wins,
                decisive = report.decisive,
                "round reported"
            );
        }
        Notice::MatchFinished {
            match_id,
            mode,
            resolution,
            my_wins,
            opp_wins,
        } => {
            let record = ledger.record(*mode);
            info!(
                %match_id,
                %mode,
                %resolution,
                my_wins,
                opp_wins,
                wins = record.wins,
                losses = record.losses,
                "match finished"
            );
            return true;
        }
        Notice::MatchAborted { match_id, reason } => {
            warn!(%match_id, %reason, "match aborted");
            return true;
        }
    }
    false
}

const REQUEUE_INITIAL: Duration = Duration::from_secs(1);
const REQUEUE_MAX: Duration = Duration::from_secs(30);

/// Delay before enqueueing again after a failure, or `None` when the
/// coordinator turned the request down outright.
fn requeue_delay(retryable: bool, backoff: &mut Backoff) -> Option<Duration> {
    retryable.then(|| backoff.advance())
}

async fn enqueue(mailbox: &mut Mailbox, mode: Mode) {
    match mailbox.enqueue(mode).await {
        Ok(ticket) => info!(%mode, position = ?ticket.position, "enqueue requested"),
        Err(err) => warn!(%mode, %err, "enqueue refused"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (config, rendered) = load_config(&args)?;

    if args.dry_run {
        print_dry_run_report(&config);
        return Ok(());
    }

    init_tracing(config.log_level)?;
    info!(config = %rendered, "loaded configuration");

    let ledger = match &config.ledger_path {
        Some(path) => RankLedger::open(path)
            .with_context(|| format!("failed to open ledger {}", path.display()))?,
        None => {
            warn!("no ledger_path configured; rank results will not survive restart");
            RankLedger::in_memory()
        }
    };
    let client = Client::with_timeout(
        config.coordinator_url.as_str(),
        config.player.clone(),
        config.request_timeout,
    )
    .context("failed to build coordinator client")?
    .with_retry_policy(RetryPolicy {
        max_attempts: config.retry_attempts,
        ..RetryPolicy::default()
    })
    .with_dial_timeout(config.request_timeout);

    let mut registry = Registry::default();
    let (actor, mut mailbox) = Actor::new(config.engine_config(), client, ledger, &mut registry);
    if let Some(port) = config.metrics_port {
        spawn_metrics_server(Arc::new(registry), SocketAddr::from(([0, 0, 0, 0], port)));
    }
    let ledger = actor.ledger_reader();
    let mut notices = mailbox.notices();
    let engine = actor.start();
    info!(player = %config.player, coordinator = %config.coordinator_url, "orchestrator started");

    let mut remaining = args.matches;
    if let Some(mode) = args.mode {
        enqueue(&mut mailbox, mode).await;
    }
    let mut requeue = Backoff::new(REQUEUE_INITIAL, REQUEUE_MAX);
    let requeue_timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(requeue_timer);
    let mut requeue_armed = false;

    loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Ok(notice) => {
                    let ended = log_notice(&notice, &ledger);
                    let Some(mode) = args.mode else {
                        continue;
                    };
                    match &notice {
                        Notice::QueueFailed { retryable, .. } => {
                            let Some(delay) = requeue_delay(*retryable, &mut requeue) else {
                                break;
                            };
                            info!(%mode, ?delay, "enqueueing again");
                            requeue_timer
                                .as_mut()
                                .reset(tokio::time::Instant::now() + delay);
                            requeue_armed = true;
                            continue;
                        }
                        Notice::Queued { .. } => requeue.reset(),
                        _ => {}
                    }
                    if ended {
                        remaining = remaining.saturating_sub(1);
                        if remaining == 0 {
                            break;
                        }
                        enqueue(&mut mailbox, mode).await;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "notice receiver lagged"),
                Err(RecvError::Closed) => break,
            },
            () = &mut requeue_timer, if requeue_armed => {
                requeue_armed = false;
                if let Some(mode) = args.mode {
                    enqueue(&mut mailbox, mode).await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                if mailbox.dequeue().await {
                    info!("left queue");
                }
                break;
            }
        }
    }

    drop(mailbox);
    if let Err(err) = engine.await {
        error!(?err, "engine task failed");
    }
    Ok(())
}
