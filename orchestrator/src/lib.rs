use serde::{Deserialize, Serialize};
use skirmish_types::{Mode, PlayerId};
use std::{collections::HashMap, fmt, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::Level;
use url::Url;

pub mod backoff;
pub mod defaults;
pub mod engine;
pub mod ledger;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod session;
pub mod transport;
pub mod watchdog;

use watchdog::WatchdogConfig;

/// Configuration for the `skirmish` binary, as read from YAML.
#[derive(Deserialize, Serialize)]
pub struct Config {
    pub player_id: String,
    pub coordinator_url: String,
    /// SQLite file for the rank ledger. Results only live in memory when unset.
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_mailbox_size")]
    pub mailbox_size: usize,
    #[serde(default = "default_notice_buffer")]
    pub notice_buffer: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    #[serde(default = "default_push_enabled")]
    pub push_enabled: bool,

    #[serde(default = "default_in_round_watchdog_ms")]
    pub in_round_watchdog_ms: u64,
    #[serde(default = "default_between_watchdog_ms")]
    pub between_watchdog_ms: u64,
    #[serde(default = "default_watchdog_max_backoff_ms")]
    pub watchdog_max_backoff_ms: u64,
    #[serde(default = "default_watchdog_jitter")]
    pub watchdog_jitter: bool,

    /// Per-mode overrides of the rounds a side needs to take the match.
    #[serde(default)]
    pub rounds_to_win: HashMap<Mode, u32>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("player_id must not be empty")]
    InvalidPlayer,
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u64 },
    #[error("{field} must be a valid URL: {value}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("{field} URL scheme must be http or https: {value}")]
    InvalidUrlScheme { field: &'static str, value: String },
    #[error(
        "watchdog_max_backoff_ms must be >= both watchdog intervals (max_backoff={max_backoff_ms}, interval={interval_ms})"
    )]
    BackoffBelowInterval { max_backoff_ms: u64, interval_ms: u64 },
    #[error("rounds_to_win for {mode} must be > 0")]
    InvalidRoundsToWin { mode: Mode },
}

#[derive(Debug)]
pub struct ValidatedConfig {
    pub player: PlayerId,
    pub coordinator_url: Url,
    pub ledger_path: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub log_level: Level,

    pub mailbox_size: usize,
    pub notice_buffer: usize,
    pub request_timeout: Duration,
    pub retry_attempts: usize,
    pub poll_interval: Duration,
    pub housekeeping_interval: Duration,
    pub cancel_grace: Duration,
    pub push_enabled: bool,
    pub watchdog: WatchdogConfig,
    /// Every mode, with overrides applied over [Mode::default_rounds_to_win].
    pub rounds_to_win: HashMap<Mode, u32>,
}

impl ValidatedConfig {
    pub fn engine_config(&self) -> engine::Config {
        engine::Config {
            player: self.player.clone(),
            mailbox_size: self.mailbox_size,
            notice_buffer: self.notice_buffer,
            request_timeout: self.request_timeout,
            poll_interval: self.poll_interval,
            housekeeping_interval: self.housekeeping_interval,
            cancel_grace: self.cancel_grace,
            push_enabled: self.push_enabled,
            rounds_to_win: self.rounds_to_win.clone(),
            watchdog: self.watchdog,
        }
    }
}

struct RedactedConfig<'a>(&'a Config);

impl fmt::Debug for RedactedConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cfg = self.0;
        f.debug_struct("Config")
            .field("player_id", &cfg.player_id)
            .field("coordinator_url", &redact_url(&cfg.coordinator_url))
            .field("ledger_path", &cfg.ledger_path)
            .field("metrics_port", &cfg.metrics_port)
            .field("log_level", &cfg.log_level)
            .field("mailbox_size", &cfg.mailbox_size)
            .field("notice_buffer", &cfg.notice_buffer)
            .field("request_timeout_ms", &cfg.request_timeout_ms)
            .field("retry_attempts", &cfg.retry_attempts)
            .field("poll_interval_ms", &cfg.poll_interval_ms)
            .field("housekeeping_interval_ms", &cfg.housekeeping_interval_ms)
            .field("cancel_grace_ms", &cfg.cancel_grace_ms)
            .field("push_enabled", &cfg.push_enabled)
            .field("in_round_watchdog_ms", &cfg.in_round_watchdog_ms)
            .field("between_watchdog_ms", &cfg.between_watchdog_ms)
            .field("watchdog_max_backoff_ms", &cfg.watchdog_max_backoff_ms)
            .field("watchdog_jitter", &cfg.watchdog_jitter)
            .field("rounds_to_win", &cfg.rounds_to_win)
            .finish()
    }
}

/// Hide credentials embedded in a URL.
fn redact_url(value: &str) -> String {
    match Url::parse(value) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("<redacted>"));
            url.to_string()
        }
        Ok(url) => url.to_string(),
        Err(_) => value.to_string(),
    }
}

fn default_log_level() -> String {
    defaults::DEFAULT_LOG_LEVEL.to_string()
}

fn default_mailbox_size() -> usize {
    defaults::DEFAULT_MAILBOX_SIZE
}

fn default_notice_buffer() -> usize {
    defaults::DEFAULT_NOTICE_BUFFER
}

fn default_request_timeout_ms() -> u64 {
    defaults::DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_retry_attempts() -> usize {
    defaults::DEFAULT_RETRY_ATTEMPTS
}

fn default_poll_interval_ms() -> u64 {
    defaults::DEFAULT_POLL_INTERVAL_MS
}

fn default_housekeeping_interval_ms() -> u64 {
    defaults::DEFAULT_HOUSEKEEPING_INTERVAL_MS
}

fn default_cancel_grace_ms() -> u64 {
    defaults::DEFAULT_CANCEL_GRACE_MS
}

fn default_push_enabled() -> bool {
    defaults::DEFAULT_PUSH_ENABLED
}

fn default_in_round_watchdog_ms() -> u64 {
    defaults::DEFAULT_IN_ROUND_WATCHDOG_MS
}

fn default_between_watchdog_ms() -> u64 {
    defaults::DEFAULT_BETWEEN_WATCHDOG_MS
}

fn default_watchdog_max_backoff_ms() -> u64 {
    defaults::DEFAULT_WATCHDOG_MAX_BACKOFF_MS
}

fn default_watchdog_jitter() -> bool {
    defaults::DEFAULT_WATCHDOG_JITTER
}

fn ensure_nonzero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value: 0 });
    }
    Ok(())
}

fn nonzero_ms(field: &'static str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(Duration::from_millis(value))
}

fn validate_http_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|_| ConfigError::InvalidUrl {
        field,
        value: redact_url(value),
    })?;
    match url.scheme() {
        "http" | "https" => {}
        _ => {
            return Err(ConfigError::InvalidUrlScheme {
                field,
                value: redact_url(value),
            })
        }
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            field,
            value: redact_url(value),
        });
    }
    Ok(url)
}

impl Config {
    pub fn redacted_debug(&self) -> impl fmt::Debug + '_ {
        RedactedConfig(self)
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let player = PlayerId::new(self.player_id.trim());
        if player.is_empty() {
            return Err(ConfigError::InvalidPlayer);
        }
        let coordinator_url = validate_http_url("coordinator_url", &self.coordinator_url)?;

        ensure_nonzero("mailbox_size", self.mailbox_size)?;
        ensure_nonzero("notice_buffer", self.notice_buffer)?;
        ensure_nonzero("retry_attempts", self.retry_attempts)?;
        let request_timeout = nonzero_ms("request_timeout_ms", self.request_timeout_ms)?;
        let poll_interval = nonzero_ms("poll_interval_ms", self.poll_interval_ms)?;
        let housekeeping_interval =
            nonzero_ms("housekeeping_interval_ms", self.housekeeping_interval_ms)?;
        let cancel_grace = nonzero_ms("cancel_grace_ms", self.cancel_grace_ms)?;
        let in_round = nonzero_ms("in_round_watchdog_ms", self.in_round_watchdog_ms)?;
        let between = nonzero_ms("between_watchdog_ms", self.between_watchdog_ms)?;
        let max_backoff = nonzero_ms("watchdog_max_backoff_ms", self.watchdog_max_backoff_ms)?;
        let longest = self.in_round_watchdog_ms.max(self.between_watchdog_ms);
        if self.watchdog_max_backoff_ms < longest {
            return Err(ConfigError::BackoffBelowInterval {
                max_backoff_ms: self.watchdog_max_backoff_ms,
                interval_ms: longest,
            });
        }

        let mut rounds_to_win = HashMap::with_capacity(Mode::ALL.len());
        for mode in Mode::ALL {
            let rounds = self
                .rounds_to_win
                .get(&mode)
                .copied()
                .unwrap_or_else(|| mode.default_rounds_to_win());
            if rounds == 0 {
                return Err(ConfigError::InvalidRoundsToWin { mode });
            }
            rounds_to_win.insert(mode, rounds);
        }

        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;

        Ok(ValidatedConfig {
            player,
            coordinator_url,
            ledger_path: self.ledger_path,
            metrics_port: self.metrics_port,
            log_level,
            mailbox_size: self.mailbox_size,
            notice_buffer: self.notice_buffer,
            request_timeout,
            retry_attempts: self.retry_attempts,
            poll_interval,
            housekeeping_interval,
            cancel_grace,
            push_enabled: self.push_enabled,
            watchdog: WatchdogConfig {
                in_round,
                between,
                max_backoff,
                jitter: self.watchdog_jitter,
            },
            rounds_to_win,
        })
    }
}
