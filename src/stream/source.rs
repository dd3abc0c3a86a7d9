//! HTTP event source for `GET /sse/connect`.
//!
//! Shares the [`ApiClient`]'s HTTP client so the stream request carries the
//! same session cookies as every request/response call. No custom headers
//! carry credentials here.

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::Client;

use super::parser::{classify, SseParser};
use super::{EventSource, EventStream};
use crate::error::ApiError;
use crate::transport::ApiClient;

/// Event source backed by a streaming HTTP response.
#[derive(Debug, Clone)]
pub struct HttpEventSource {
    http: Client,
    url: String,
}

impl HttpEventSource {
    /// Creates a source that connects through `client`'s session.
    #[must_use]
    pub fn new(client: &ApiClient) -> Self {
        Self {
            http: client.http().clone(),
            url: format!("{}/sse/connect", client.server_url()),
        }
    }

    /// Stream endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn connect(&self, scope: &str) -> Result<EventStream, ApiError> {
        log::debug!("[Stream] Opening {} (scope={})", self.url, scope);

        let response = self
            .http
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| ApiError::StreamTransportError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::StreamTransportError(format!(
                "stream endpoint returned {status}"
            )));
        }

        let mut parser = SseParser::new();
        let events = response
            .bytes_stream()
            .map(move |chunk| {
                let items: Vec<Result<_, ApiError>> = match chunk {
                    Ok(bytes) => parser.feed(&bytes).into_iter().map(|f| Ok(classify(f))).collect(),
                    Err(e) => vec![Err(ApiError::StreamTransportError(e.to_string()))],
                };
                stream::iter(items)
            })
            .flatten();

        Ok(Box::pin(events))
    }
}
