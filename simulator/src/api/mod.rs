use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::Simulator;

mod http;
mod ws;

pub struct Api {
    simulator: Arc<Simulator>,
}

impl Api {
    pub fn new(simulator: Arc<Simulator>) -> Self {
        Self { simulator }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(http::healthz))
            .route("/queue/enqueue", post(http::enqueue))
            .route("/queue/dequeue", post(http::dequeue))
            .route("/match/ping", post(http::ping))
            .route("/match/next", post(http::next))
            .route("/match/round", post(http::report_round))
            .route("/match/finish", post(http::report_finish))
            .route("/notifications/:player", get(http::notifications))
            .route("/events/:player", get(ws::events_ws))
            .layer(TraceLayer::new_for_http())
            .with_state(self.simulator.clone())
    }
}
