use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use skirmish_simulator::{Api, RoundPolicy, Simulator, SimulatorConfig};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    Player,
    Bot,
    Alternate,
    Random,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Local skirmish coordinator")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Who takes a round resolved by a ping.
    #[arg(long, value_enum, default_value_t = PolicyArg::Random)]
    policy: PolicyArg,

    /// Seed for the random round policy.
    #[arg(long, default_value_t = 7)]
    seed: u64,

    #[arg(long)]
    rounds_to_win: Option<u32>,

    /// Milliseconds between enqueue and match formation.
    #[arg(long, default_value_t = 0)]
    match_delay_ms: u64,
}

fn build_config(args: &Args) -> Result<SimulatorConfig> {
    if args.rounds_to_win == Some(0) {
        anyhow::bail!("rounds_to_win must be positive");
    }
    let round_policy = match args.policy {
        PolicyArg::Player => RoundPolicy::PlayerWins,
        PolicyArg::Bot => RoundPolicy::BotWins,
        PolicyArg::Alternate => RoundPolicy::Alternate,
        PolicyArg::Random => RoundPolicy::Random(args.seed),
    };
    Ok(SimulatorConfig {
        round_policy,
        rounds_to_win: args.rounds_to_win,
        match_delay: Duration::from_millis(args.match_delay_ms),
        broadcast_buffer: None,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;
    let simulator = Arc::new(Simulator::new(config));
    let api = Api::new(simulator);

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "simulator listening");
    axum::serve(listener, api.router())
        .await
        .context("simulator server failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policy_and_seed() {
        let args = Args::parse_from(["simulator", "--policy", "random", "--seed", "9"]);
        let config = build_config(&args).expect("config should parse");
        assert_eq!(config.round_policy, RoundPolicy::Random(9));
        assert!(config.match_delay.is_zero());
    }

    #[test]
    fn rejects_zero_rounds_to_win() {
        let args = Args::parse_from(["simulator", "--rounds-to-win", "0"]);
        let err = build_config(&args).unwrap_err();
        assert!(err.to_string().contains("rounds_to_win"), "unexpected error: {err}");
    }
}
