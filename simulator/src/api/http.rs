use axum::{
    extract::{Path, State as AxumState},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use skirmish_types::{
    api::{DequeueRequest, EnqueueRequest, FinishReport, NextRequest, PingRequest, RoundReport},
    Notifications, PlayerId,
};
use std::sync::Arc;
use tracing::debug;

use crate::Simulator;

/// Simple health response for basic liveness checks
#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

pub(super) async fn enqueue(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Json(request): Json<EnqueueRequest>,
) -> Response {
    let (response, deliveries) = simulator.state().enqueue(&request.player, request.mode);
    simulator.publish(deliveries);

    let delay = simulator.config.match_delay;
    if response.ok && !delay.is_zero() {
        let simulator = simulator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let deliveries = simulator.state().form_match(&request.player);
            simulator.publish(deliveries);
        });
    }
    Json(response).into_response()
}

pub(super) async fn dequeue(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Json(request): Json<DequeueRequest>,
) -> Response {
    let ack = simulator.state().dequeue(&request.player);
    Json(ack).into_response()
}

pub(super) async fn ping(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Json(request): Json<PingRequest>,
) -> Response {
    debug!(match_id = %request.match_id, since = request.since, "ping received");
    let (ack, deliveries) =
        simulator
            .state()
            .ping(&request.player, &request.match_id, request.phase);
    simulator.publish(deliveries);
    Json(ack).into_response()
}

pub(super) async fn next(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Json(request): Json<NextRequest>,
) -> Response {
    let (ack, deliveries) = simulator.state().next(&request.player, &request.match_id);
    simulator.publish(deliveries);
    Json(ack).into_response()
}

pub(super) async fn report_round(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Json(request): Json<RoundReport>,
) -> Response {
    let (ack, deliveries) = simulator.state().report_round(
        &request.player,
        &request.match_id,
        request.round_id,
        request.winner,
    );
    simulator.publish(deliveries);
    Json(ack).into_response()
}

pub(super) async fn report_finish(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Json(request): Json<FinishReport>,
) -> Response {
    let (ack, deliveries) =
        simulator
            .state()
            .report_finish(&request.player, &request.match_id, request.winner);
    simulator.publish(deliveries);
    Json(ack).into_response()
}

pub(super) async fn notifications(
    AxumState(simulator): AxumState<Arc<Simulator>>,
    Path(player): Path<String>,
) -> Response {
    let events = simulator
        .take_notifications(&PlayerId::new(player))
        .into_iter()
        .filter_map(|event| serde_json::to_value(event).ok())
        .collect();
    Json(Notifications { events }).into_response()
}
