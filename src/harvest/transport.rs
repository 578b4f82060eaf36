use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use tracing::{debug, warn};

use super::payload::{HarvestResult, SubmitMethod, SubmitRequest};
use crate::config::AgentConfig;
use crate::error::AgentError;

/// Delivers built requests. Failures come back as `HarvestResult` values.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn submit(&self, request: SubmitRequest) -> HarvestResult;
}

pub struct HttpTransport {
    client: Client,
    too_many_requests_delay: Duration,
}

impl HttpTransport {
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            too_many_requests_delay: Duration::from_secs(config.too_many_requests_delay_secs),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn submit(&self, request: SubmitRequest) -> HarvestResult {
        let method = request.method;
        let response = self
            .client
            .post(&request.url)
            .query(&request.query)
            .header(CONTENT_TYPE, "application/json")
            .body(request.body)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                debug!("harvest '{}' -> {}", request.endpoint, status);
                if method == SubmitMethod::Beacon {
                    return HarvestResult::delivered(status);
                }
                let mut result = HarvestResult::from_status(status, self.too_many_requests_delay);
                if result.retry {
                    let header = resp.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok());
                    if let Some(delay) = header.and_then(|v| parse_retry_after(v, Utc::now())) {
                        result.delay = Some(delay);
                    }
                }
                result
            }
            Err(e) => {
                warn!("harvest '{}' failed: {}", request.endpoint, e);
                match method {
                    SubmitMethod::Beacon => HarvestResult { sent: true, ..HarvestResult::not_sent() },
                    SubmitMethod::Xhr => HarvestResult::network_failure(),
                }
            }
        }
    }
}

/// `Retry-After` as delay-seconds or an HTTP-date. A date already passed
/// means retry now.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some((at.with_timezone(&Utc) - now).to_std().unwrap_or(Duration::ZERO))
}
