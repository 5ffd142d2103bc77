use crate::config;
use crate::template::MessagePayload;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Most recipients the provider accepts in one multicast call.
pub const MAX_RECIPIENTS_PER_CALL: usize = 500;

const MULTICAST_PATH: &str = "v2/bot/message/multicast";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unreachable: {0}")]
    Transport(String),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("{0} recipients exceed the per-call limit of {max}", max = MAX_RECIPIENTS_PER_CALL)]
    TooManyRecipients(usize),
}

/// Remote multicast delivery. A call either fully succeeds or is treated as
/// fully failed; there is no per-recipient outcome.
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    async fn send(&self, recipients: &[String], payload: &MessagePayload)
        -> Result<(), ProviderError>;
}

#[derive(Clone)]
pub struct MulticastClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for MulticastClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticastClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl MulticastClient {
    pub fn new(token: String, base_url: Url, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("segment-broadcast/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(cfg: &config::Provider) -> anyhow::Result<Self> {
        let base_url = Url::parse(&cfg.endpoint)?;
        Self::new(
            cfg.channel_token.clone(),
            base_url,
            Duration::from_secs(cfg.timeout_secs),
        )
    }

    pub fn build_request(
        &self,
        recipients: &[String],
        payload: &MessagePayload,
        retry_key: Uuid,
    ) -> Result<reqwest::Request, ProviderError> {
        let endpoint = self
            .base_url
            .join(MULTICAST_PATH)
            .map_err(|e| ProviderError::Transport(format!("invalid endpoint: {e}")))?;
        self.http
            .post(endpoint)
            .bearer_auth(&self.token)
            .header("X-Line-Retry-Key", retry_key.to_string())
            .json(&multicast_body(recipients, payload))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))
    }
}

pub fn multicast_body(recipients: &[String], payload: &MessagePayload) -> Value {
    json!({
        "to": recipients,
        "messages": payload.messages,
    })
}

/// Map an HTTP status and body onto the all-or-nothing send outcome.
pub fn interpret_response(status: StatusCode, body: &str) -> Result<(), ProviderError> {
    if !status.is_success() {
        return Err(ProviderError::Status {
            status: status.as_u16(),
            body: body.to_string(),
        });
    }
    if body.trim().is_empty() {
        return Ok(());
    }
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(_)) => Ok(()),
        Ok(other) => Err(ProviderError::Malformed(format!("expected object, got {other}"))),
        Err(e) => Err(ProviderError::Malformed(e.to_string())),
    }
}

#[async_trait]
impl DeliveryProvider for MulticastClient {
    async fn send(
        &self,
        recipients: &[String],
        payload: &MessagePayload,
    ) -> Result<(), ProviderError> {
        if recipients.len() > MAX_RECIPIENTS_PER_CALL {
            return Err(ProviderError::TooManyRecipients(recipients.len()));
        }
        let retry_key = Uuid::new_v4();
        let request = self.build_request(recipients, payload, retry_key)?;
        debug!(url = %request.url(), recipients = recipients.len(), %retry_key, "sending multicast");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        interpret_response(status, &body)
    }
}
