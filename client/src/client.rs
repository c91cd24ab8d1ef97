use crate::{events::Stream, Error, Result};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use skirmish_types::{
    api::{DequeueRequest, EnqueueRequest, FinishReport, NextRequest, PingRequest, RoundReport},
    Ack, EnqueueResponse, MatchId, Mode, Notifications, Phase, PlayerId, RoundId,
};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry behaviour for HTTP calls.
///
/// Every coordinator call except `enqueue` is safe to repeat, so those are
/// retried on transport errors and retryable statuses. `enqueue` is only
/// retried when `retry_non_idempotent` is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub retry_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            retry_non_idempotent: false,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Coordinator client bound to one local player.
#[derive(Clone)]
pub struct Client {
    pub(crate) base_url: Url,
    ws_url: Url,
    http: reqwest::Client,
    player: PlayerId,
    retry_policy: RetryPolicy,
    dial_timeout: Duration,
}

impl Client {
    pub fn new(base_url: &str, player: PlayerId) -> Result<Self> {
        Self::with_timeout(base_url, player, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, player: PlayerId, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let ws_scheme = match base_url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => return Err(Error::InvalidScheme(other.to_string())),
        };
        let mut ws_url = base_url.clone();
        ws_url
            .set_scheme(ws_scheme)
            .map_err(|_| Error::InvalidScheme(ws_scheme.to_string()))?;

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            ws_url,
            http,
            player,
            retry_policy: RetryPolicy::default(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        })
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn player(&self) -> &PlayerId {
        &self.player
    }

    pub async fn enqueue(&self, mode: Mode) -> Result<EnqueueResponse> {
        let url = self.base_url.join("queue/enqueue")?;
        let body = EnqueueRequest {
            player: self.player.clone(),
            mode,
        };
        let response = self.post_json_with_retry(url, &body, false).await?;
        Ok(response.json().await?)
    }

    pub async fn dequeue(&self) -> Result<Ack> {
        let url = self.base_url.join("queue/dequeue")?;
        let body = DequeueRequest {
            player: self.player.clone(),
        };
        self.post_ack(url, &body).await
    }

    pub async fn ping(&self, match_id: &MatchId, phase: Phase, since: u64) -> Result<Ack> {
        let url = self.base_url.join("match/ping")?;
        let body = PingRequest {
            player: self.player.clone(),
            match_id: match_id.clone(),
            phase,
            since,
        };
        self.post_ack(url, &body).await
    }

    pub async fn next(&self, match_id: &MatchId) -> Result<Ack> {
        let url = self.base_url.join("match/next")?;
        let body = NextRequest {
            player: self.player.clone(),
            match_id: match_id.clone(),
        };
        self.post_ack(url, &body).await
    }

    pub async fn report_round(
        &self,
        match_id: &MatchId,
        round_id: &RoundId,
        winner: &PlayerId,
        my_wins: u32,
        opp_wins: u32,
    ) -> Result<Ack> {
        let url = self.base_url.join("match/round")?;
        let body = RoundReport {
            player: self.player.clone(),
            match_id: match_id.clone(),
            round_id: round_id.clone(),
            winner: winner.clone(),
            my_wins,
            opp_wins,
        };
        self.post_ack(url, &body).await
    }

    pub async fn report_finish(&self, match_id: &MatchId, winner: &PlayerId) -> Result<Ack> {
        let url = self.base_url.join("match/finish")?;
        let body = FinishReport {
            player: self.player.clone(),
            match_id: match_id.clone(),
            winner: winner.clone(),
        };
        self.post_ack(url, &body).await
    }

    /// Pull pending events for the local player.
    pub async fn notifications(&self) -> Result<Notifications> {
        let url = self
            .base_url
            .join(&format!("notifications/{}", self.player))?;
        let response = self.get_with_retry(url).await?;
        Ok(response.json().await?)
    }

    /// Open the push channel for the local player.
    pub async fn connect_events(&self) -> Result<Stream> {
        let url = self.ws_url.join(&format!("events/{}", self.player))?;
        let (ws, _) = tokio::time::timeout(
            self.dial_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| Error::DialTimeout)??;
        debug!(%url, "connected to event stream");
        Ok(Stream::new(ws))
    }

    async fn post_ack<T: Serialize>(&self, url: Url, body: &T) -> Result<Ack> {
        let response = self.post_json_with_retry(url, body, true).await?;
        Ok(response.json().await?)
    }

    pub(crate) async fn get_with_retry(&self, url: Url) -> Result<reqwest::Response> {
        self.send_with_retry(Method::GET, url, None, true).await
    }

    pub(crate) async fn post_json_with_retry<T: Serialize>(
        &self,
        url: Url,
        body: &T,
        idempotent: bool,
    ) -> Result<reqwest::Response> {
        let body = serde_json::to_vec(body)?;
        self.send_with_retry(Method::POST, url, Some(body), idempotent)
            .await
    }

    async fn send_with_retry(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
        idempotent: bool,
    ) -> Result<reqwest::Response> {
        let policy = self.retry_policy;
        let attempts = if idempotent || policy.retry_non_idempotent {
            policy.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.http.request(method.clone(), url.clone());
            if let Some(body) = &body {
                request = request
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone());
            }
            let last_attempt = attempt >= attempts;
            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if !is_retryable_status(status) || last_attempt {
                        let text = response.text().await.unwrap_or_default();
                        return Err(Error::FailedWithBody {
                            status,
                            body: format!("{method} {url}: {text}"),
                        });
                    }
                    warn!(%method, %url, %status, attempt, "retryable status from coordinator");
                }
                Err(err) => {
                    if last_attempt {
                        return Err(err.into());
                    }
                    warn!(%method, %url, attempt, error = %err, "request failed; retrying");
                }
            }
            tokio::time::sleep(policy.backoff(attempt - 1)).await;
        }
    }
}
