use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Engine counters. Clones share the same underlying values.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub events_applied: Counter,
    pub events_duplicate: Counter,
    pub events_discarded: Counter,
    pub watchdog_pings: Counter,
    pub watchdog_nudges: Counter,
    pub transport_failures: Counter,
    pub feed_reconnects: Counter,
    pub feed_connected: Gauge,
    pub ledger_retries: Counter,
    pub matches_won: Counter,
    pub matches_lost: Counter,
    pub matches_aborted: Counter,
}

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        let registry = registry.sub_registry_with_prefix("orchestrator");
        registry.register(
            "events_applied",
            "Number of events that moved queue or match state",
            metrics.events_applied.clone(),
        );
        registry.register(
            "events_duplicate",
            "Number of events absorbed as already applied",
            metrics.events_duplicate.clone(),
        );
        registry.register(
            "events_discarded",
            "Number of events dropped as malformed, foreign or unsolicited",
            metrics.events_discarded.clone(),
        );
        registry.register(
            "watchdog_pings",
            "Number of liveness pings sent for a running round",
            metrics.watchdog_pings.clone(),
        );
        registry.register(
            "watchdog_nudges",
            "Number of next requests sent for a match waiting between rounds",
            metrics.watchdog_nudges.clone(),
        );
        registry.register(
            "transport_failures",
            "Number of coordinator calls that failed or timed out",
            metrics.transport_failures.clone(),
        );
        registry.register(
            "feed_reconnects",
            "Number of attempts to (re)open the push event stream",
            metrics.feed_reconnects.clone(),
        );
        registry.register(
            "feed_connected",
            "Whether the push event stream is connected (1=connected, 0=disconnected)",
            metrics.feed_connected.clone(),
        );
        registry.register(
            "ledger_retries",
            "Number of retried rank ledger writes",
            metrics.ledger_retries.clone(),
        );
        registry.register(
            "matches_won",
            "Number of matches finished with a win",
            metrics.matches_won.clone(),
        );
        registry.register(
            "matches_lost",
            "Number of matches finished with a loss",
            metrics.matches_lost.clone(),
        );
        registry.register(
            "matches_aborted",
            "Number of matches aborted by the coordinator",
            metrics.matches_aborted.clone(),
        );
        metrics
    }
}

/// Render `registry` in the Prometheus text format.
pub fn render(registry: &Registry) -> String {
    let mut buffer = String::new();
    if encode(&mut buffer, registry).is_err() {
        buffer.clear();
    }
    buffer
}
