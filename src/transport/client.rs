//! API client for the notification backend.
//!
//! This module provides the [`ApiClient`] struct which handles all
//! request/response communication with the backend. The session travels in
//! the client's cookie jar, so no call ever takes or attaches a raw token;
//! the event stream shares the same jar through [`ApiClient::http`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;

use super::renewal::RenewalCoordinator;
use super::types::{Identity, LoginRequest, RegisterRequest};
use super::NotificationApi;
use crate::config::Config;
use crate::constants;
use crate::error::ApiError;

/// API client for the notification backend.
///
/// Cheap to clone; clones share the HTTP connection pool, the cookie jar and
/// the renewal coordinator.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    server_url: String,
    request_timeout: Duration,
    renewal: Arc<RenewalCoordinator>,
}

impl ApiClient {
    /// Creates a new API client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .cookie_store(true)
            .connect_timeout(constants::STREAM_CONNECT_TIMEOUT)
            .build()?;

        Ok(Self::with_client(
            http,
            config.base_url().to_string(),
            config.request_timeout(),
        ))
    }

    /// Creates an API client with a pre-configured HTTP client.
    ///
    /// Useful for testing or when custom client configuration is needed. The
    /// client should have a cookie store enabled, otherwise the session is
    /// lost between calls.
    pub fn with_client(http: Client, server_url: String, request_timeout: Duration) -> Self {
        Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
            request_timeout,
            renewal: Arc::new(RenewalCoordinator::default()),
        }
    }

    /// Returns the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Underlying HTTP client, shared with the event stream.
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Credential renewal coordinator used by this client.
    pub fn renewal(&self) -> &Arc<RenewalCoordinator> {
        &self.renewal
    }

    /// Logs in and returns the identity if the response carries one.
    ///
    /// Exempt from renewal. A successful login resets the renewal counter.
    pub async fn login(&self, email: &str, password: &str) -> Result<Option<Identity>, ApiError> {
        let body = serde_json::to_value(LoginRequest { email, password })
            .map_err(|e| ApiError::MalformedPayload(e.to_string()))?;
        let response = self
            .send_raw(Method::POST, "/users/login", Some(&body))
            .await?;
        self.renewal.reset();
        log::info!("[Transport] Logged in");
        Ok(Identity::from_payload(&response).ok())
    }

    /// Registers a new account; the backend may log it in directly.
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<Option<Identity>, ApiError> {
        let body = serde_json::to_value(RegisterRequest {
            name,
            email,
            password,
        })
        .map_err(|e| ApiError::MalformedPayload(e.to_string()))?;
        let response = self
            .send_raw(Method::POST, "/users/register", Some(&body))
            .await?;
        self.renewal.reset();
        log::info!("[Transport] Registered account");
        Ok(Identity::from_payload(&response).ok())
    }

    /// Ends the session on the server. Exempt from renewal.
    pub async fn logout(&self) -> Result<(), ApiError> {
        self.send_raw(Method::POST, "/users/logout", None).await?;
        log::info!("[Transport] Logged out");
        Ok(())
    }

    /// Renews the session credentials.
    ///
    /// This is the renewal operation itself and is never intercepted.
    pub async fn refresh_credentials(&self) -> Result<(), ApiError> {
        self.send_raw(Method::POST, "/users/refresh", None)
            .await
            .map(|_| ())
    }

    /// Fetches the current user's profile.
    pub async fn profile(&self) -> Result<Identity, ApiError> {
        let response = self.send(Method::GET, "/users/profile", None).await?;
        Identity::from_payload(&response)
    }

    /// Asks the backend to push a test notification over the stream.
    pub async fn trigger_test_notification(&self) -> Result<Value, ApiError> {
        self.send(Method::POST, "/sse/test", Some(serde_json::json!({})))
            .await
    }

    /// Sends an authenticated call through the renewal protocol.
    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, ApiError> {
        let method = &method;
        let body = body.as_ref();
        self.renewal
            .call(
                move || self.send_raw(method.clone(), path, body),
                move || self.refresh_credentials(),
            )
            .await
    }

    /// Sends a single call with no renewal handling.
    ///
    /// A 401 maps to [`ApiError::AuthorizationExpired`]; a call that never
    /// produced a response (including timeouts) maps to
    /// [`ApiError::NetworkUnreachable`].
    async fn send_raw(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.server_url, path);
        log::trace!("[Transport] {} {}", method, url);

        let mut request = self
            .http
            .request(method.clone(), &url)
            .timeout(self.request_timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            log::debug!("[Transport] {} {} failed: {}", method, path, e);
            ApiError::from(e)
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            log::debug!("[Transport] {} {} returned 401", method, path);
            return Err(ApiError::AuthorizationExpired);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("[Transport] {} {} returned {}", method, path, status);
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        Ok(parse_body(&text))
    }
}

/// Parses a success body. Empty bodies become `null`, non-JSON bodies a string.
fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[async_trait]
impl NotificationApi for ApiClient {
    async fn fetch_page(&self, page: u32, limit: u32) -> Result<Value, ApiError> {
        let path = format!("/notification?page={page}&limit={limit}");
        self.send(Method::GET, &path, None).await
    }

    async fn fetch_unread_count(&self) -> Result<Value, ApiError> {
        self.send(Method::GET, "/notification/unread/count", None)
            .await
    }

    async fn mark_read(&self, id: &str) -> Result<(), ApiError> {
        let path = format!("/notification/{}/read", urlencoding::encode(id));
        self.send(Method::PATCH, &path, None).await.map(|_| ())
    }

    async fn mark_all_read(&self) -> Result<(), ApiError> {
        self.send(Method::PATCH, "/notification/read-all", None)
            .await
            .map(|_| ())
    }

    async fn delete(&self, id: &str) -> Result<(), ApiError> {
        let path = format!("/notification/{}", urlencoding::encode(id));
        self.send(Method::DELETE, &path, None).await.map(|_| ())
    }
}
