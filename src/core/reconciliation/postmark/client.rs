use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::America::New_York;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::types::{
    DateRange, InboundDetails, InboundMessage, InboundSearchPage, MessageEvent, OutboundDetails,
    OutboundMessage, OutboundSearchPage,
};
use crate::core::config::PostmarkConfig;

const TOKEN_HEADER: &str = "X-Postmark-Server-Token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Postmark rejects `count + offset` above this.
const MAX_SEARCH_OFFSET: u64 = 10_000;
const QUERY_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Search date filters carry no offset; Postmark reads them as US Eastern time.
fn search_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&New_York).format(QUERY_TIME_FORMAT).to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryApiError {
    #[error("Postmark server token is not configured")]
    MissingCredentials,
    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{path} returned {status}: {body}")]
    Status {
        status: StatusCode,
        path: String,
        body: String,
    },
    #[error("could not decode response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DeliveryApiError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            Self::MissingCredentials | Self::Decode { .. } => false,
        }
    }
}

/// Read side of the delivery provider, as seen by reconciliation.
#[async_trait]
pub trait DeliveryApi: Send + Sync {
    fn has_credentials(&self) -> bool {
        true
    }

    /// Every outbound message in the range, all pages concatenated.
    async fn get_all_outbound_messages(&self, range: &DateRange) -> Result<Vec<OutboundMessage>>;

    /// Every inbound message in the range, with headers populated.
    async fn get_all_inbound_messages(&self, range: &DateRange) -> Result<Vec<InboundMessage>>;

    /// Delivery events for one outbound message, in provider order.
    async fn get_message_events(&self, message_id: &str) -> Result<Vec<MessageEvent>>;

    async fn health_check(&self) -> Result<bool>;
}

pub struct PostmarkClient {
    client: Client,
    base_url: String,
    server_token: Option<String>,
    max_retries: u32,
    retry_base: Duration,
    page_size: u32,
}

impl PostmarkClient {
    pub fn new(config: &PostmarkConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("mailrecon/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            server_token: config
                .server_token
                .clone()
                .filter(|t| !t.trim().is_empty()),
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
            page_size: config.page_size.clamp(1, 500),
        })
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<T, DeliveryApiError> {
        let token = self
            .server_token
            .as_deref()
            .ok_or(DeliveryApiError::MissingCredentials)?;
        let url = format!("{}{}", self.base_url, path);

        let res = self
            .client
            .get(&url)
            .header(TOKEN_HEADER, token)
            .header("Accept", "application/json")
            .query(query)
            .send()
            .await
            .map_err(|source| DeliveryApiError::Transport {
                path: path.to_string(),
                source,
            })?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|source| DeliveryApiError::Transport {
                path: path.to_string(),
                source,
            })?;
        if !status.is_success() {
            return Err(DeliveryApiError::Status {
                status,
                path: path.to_string(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|source| DeliveryApiError::Decode {
            path: path.to_string(),
            source,
        })
    }

    /// GET with bounded retry on rate limiting, server errors and transport failures.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<T, DeliveryApiError> {
        let mut attempt = 0;
        loop {
            match self.get_once(path, query).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.retry_base.saturating_mul(2u32.saturating_pow(attempt));
                    warn!(
                        "Postmark request {} failed (attempt {}/{}), retrying in {:?}: {}",
                        path,
                        attempt + 1,
                        self.max_retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn range_query(&self, range: &DateRange, offset: u64) -> Vec<(&'static str, String)> {
        vec![
            ("count", self.page_size.to_string()),
            ("offset", offset.to_string()),
            ("fromdate", search_time(range.from)),
            ("todate", search_time(range.to)),
        ]
    }

    async fn paginate<P, T>(
        &self,
        path: &str,
        range: &DateRange,
        split: impl Fn(P) -> (u64, Vec<T>),
    ) -> Result<Vec<T>>
    where
        P: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut offset = 0u64;
        loop {
            let page: P = self.get_json(path, &self.range_query(range, offset)).await?;
            let (total, batch) = split(page);
            let fetched = batch.len() as u64;
            items.extend(batch);
            offset += fetched;
            debug!("{}: fetched {} of {}", path, items.len(), total);

            if fetched == 0 || offset >= total {
                break;
            }
            if offset + u64::from(self.page_size) > MAX_SEARCH_OFFSET {
                warn!(
                    "{}: stopping at {} of {} results (search offset limit)",
                    path, offset, total
                );
                break;
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl DeliveryApi for PostmarkClient {
    fn has_credentials(&self) -> bool {
        self.server_token.is_some()
    }

    async fn get_all_outbound_messages(&self, range: &DateRange) -> Result<Vec<OutboundMessage>> {
        self.paginate("/messages/outbound", range, |page: OutboundSearchPage| {
            (page.total_count, page.messages)
        })
        .await
    }

    async fn get_all_inbound_messages(&self, range: &DateRange) -> Result<Vec<InboundMessage>> {
        let mut messages = self
            .paginate("/messages/inbound", range, |page: InboundSearchPage| {
                (page.total_count, page.inbound_messages)
            })
            .await?;

        // Search results omit headers; In-Reply-To only comes with the details call.
        for message in messages.iter_mut().filter(|m| m.headers.is_empty()) {
            let path = format!("/messages/inbound/{}/details", message.message_id);
            match self.get_json::<InboundDetails>(&path, &[]).await {
                Ok(details) => message.headers = details.headers,
                Err(e) => warn!(
                    "No headers for inbound message {}: {}",
                    message.message_id, e
                ),
            }
        }
        Ok(messages)
    }

    async fn get_message_events(&self, message_id: &str) -> Result<Vec<MessageEvent>> {
        let path = format!("/messages/outbound/{}/details", message_id);
        let details: OutboundDetails = self.get_json(&path, &[]).await?;
        let total = details.message_events.len();
        let events: Vec<MessageEvent> = details
            .message_events
            .into_iter()
            .filter_map(|raw| raw.normalize())
            .collect();
        if events.len() < total {
            warn!(
                "Dropped {} event(s) with unreadable timestamps for message {}",
                total - events.len(),
                message_id
            );
        }
        Ok(events)
    }

    async fn health_check(&self) -> Result<bool> {
        match self.get_json::<serde_json::Value>("/server", &[]).await {
            Ok(_) => Ok(true),
            Err(DeliveryApiError::Status { status, .. }) if status.is_client_error() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
