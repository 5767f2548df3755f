//! Read-only client for the source platform's HTTP API
//!
//! Board data operations are read-only; only webhook subscriptions (the
//! delivery infrastructure itself) can be created or deleted, and those
//! calls are confined to the admin CLI.
//!
//! The platform allows roughly 300 requests per 10 seconds per token; a
//! token bucket enforces that budget across concurrent workers.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::SourceSettings;
use crate::models::SourceCard;

const RATE_LIMIT_REQUESTS: f64 = 300.0;
const RATE_LIMIT_WINDOW_S: f64 = 10.0;
const FETCH_ATTEMPTS: u32 = 3;
const FETCH_RETRY_BASE_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum SourceError {
    /// The platform has no card with this id; terminal for the event.
    #[error("card {0} not found on the source platform")]
    CardAbsent(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("source API error {0}: {1}")]
    Api(u16, String),

    #[error("parse error: {0}")]
    Parse(String),
}

/// Seam the dispatcher fetches cards through.
#[async_trait]
pub trait CardSource: Send + Sync {
    async fn fetch_card(&self, card_id: &str) -> Result<SourceCard, SourceError>;
}

/// Token bucket: `capacity` requests per `window`, refilled continuously.
struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, window_s: f64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_per_sec: capacity / window_s,
        }
    }

    /// Take one token, sleeping until one is available.
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = Instant::now();
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - state.tokens) / self.refill_per_sec,
                    ))
                }
            };
            match wait {
                None => return,
                Some(d) => {
                    tracing::debug!("Rate limiting source fetch: waiting {:?}", d);
                    tokio::time::sleep(d).await;
                }
            }
        }
    }
}

/// Metadata about a registered webhook subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "idModel", default)]
    pub id_model: Option<String>,
    #[serde(rename = "callbackURL", default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

/// HTTP client for the source platform.
pub struct BoardClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_token: String,
    bucket: TokenBucket,
}

impl BoardClient {
    pub fn new(settings: &SourceSettings) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.fetch_timeout_s))
            .build()
            .map_err(|e| SourceError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: settings.api_base.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            api_token: settings.api_token.clone(),
            bucket: TokenBucket::new(RATE_LIMIT_REQUESTS, RATE_LIMIT_WINDOW_S),
        })
    }

    fn auth_params(&self) -> [(&'static str, &str); 2] {
        [("key", self.api_key.as_str()), ("token", self.api_token.as_str())]
    }

    /// Register a webhook subscription for a board.
    pub async fn register_webhook(
        &self,
        model_id: &str,
        callback_url: &str,
        description: Option<&str>,
    ) -> Result<WebhookSubscription, SourceError> {
        self.bucket.acquire().await;
        let url = format!("{}/webhooks", self.base_url);
        let response = self
            .http
            .post(&url)
            .query(&self.auth_params())
            .form(&[
                ("idModel", model_id),
                ("callbackURL", callback_url),
                ("description", description.unwrap_or("cardsink webhook")),
                ("active", "true"),
            ])
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;
        Self::parse_json(response).await
    }

    /// List webhook subscriptions for the current token.
    pub async fn list_webhooks(&self) -> Result<Vec<WebhookSubscription>, SourceError> {
        self.bucket.acquire().await;
        let url = format!("{}/tokens/{}/webhooks", self.base_url, self.api_token);
        let response = self
            .http
            .get(&url)
            .query(&self.auth_params())
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;
        Self::parse_json(response).await
    }

    /// Delete a webhook subscription by id.
    pub async fn delete_webhook(&self, webhook_id: &str) -> Result<(), SourceError> {
        self.bucket.acquire().await;
        let url = format!("{}/webhooks/{}", self.base_url, webhook_id);
        let response = self
            .http
            .delete(&url)
            .query(&self.auth_params())
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Api(status.as_u16(), body));
        }
        tracing::info!(webhook_id = %webhook_id, "Deleted webhook subscription");
        Ok(())
    }

    async fn parse_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, SourceError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Api(status.as_u16(), body));
        }
        response
            .json()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))
    }
}

#[async_trait]
impl CardSource for BoardClient {
    /// Fetch the full card: all fields plus attachments and recent comment
    /// actions. Network-level failures and 5xx are retried a bounded number
    /// of times with jittered backoff; 404 is terminal.
    async fn fetch_card(&self, card_id: &str) -> Result<SourceCard, SourceError> {
        let url = format!("{}/cards/{}", self.base_url, card_id);
        let mut last_error = SourceError::Network("no attempt made".to_string());

        for attempt in 0..FETCH_ATTEMPTS {
            if attempt > 0 {
                let backoff = FETCH_RETRY_BASE_MS * (1u64 << attempt)
                    + rand::thread_rng().gen_range(0..FETCH_RETRY_BASE_MS);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            self.bucket.acquire().await;

            let result = self
                .http
                .get(&url)
                .query(&self.auth_params())
                .query(&[
                    ("fields", "all"),
                    ("attachments", "true"),
                    ("actions", "commentCard"),
                ])
                .send()
                .await;

            let response = match result {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(
                        card_id = %card_id,
                        attempt,
                        error = %e,
                        "Card fetch failed at network level"
                    );
                    last_error = SourceError::Network(e.to_string());
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 404 {
                return Err(SourceError::CardAbsent(card_id.to_string()));
            }
            if status.is_server_error() || status.as_u16() == 429 {
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(card_id = %card_id, attempt, status = status.as_u16(), "Card fetch rejected, retrying");
                last_error = SourceError::Api(status.as_u16(), body);
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SourceError::Api(status.as_u16(), body));
            }

            let card: SourceCard = response
                .json()
                .await
                .map_err(|e| SourceError::Parse(e.to_string()))?;
            tracing::debug!(card_id = %card_id, "Fetched card from source platform");
            return Ok(card);
        }

        Err(last_error)
    }
}
