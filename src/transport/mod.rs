//! Request/response transport to the notification backend.
//!
//! - [`client`] - HTTP client ([`ApiClient`]) with cookie-carried sessions
//! - [`renewal`] - single-flight credential renewal on 401
//! - [`types`] - request bodies and the [`Identity`] principal
//!
//! The reconciler talks to the backend only through [`NotificationApi`], so
//! it can be driven by [`ApiClient`] in production and by in-process doubles
//! in tests.

pub mod client;
pub mod renewal;
pub mod types;

use async_trait::async_trait;

use crate::error::ApiError;

pub use client::ApiClient;
pub use renewal::{RenewalCoordinator, RenewalExhaustedEvent, RenewalState};
pub use types::Identity;

/// Notification operations consumed by the reconciler.
///
/// Listing and count responses are returned as raw JSON; their shape differs
/// between backend versions and is normalized by the caller. Implementations
/// handle credential renewal internally, so callers only ever see the final
/// outcome of a call.
#[async_trait]
pub trait NotificationApi: Send + Sync {
    /// `GET /notification?page=&limit=`
    async fn fetch_page(&self, page: u32, limit: u32) -> Result<serde_json::Value, ApiError>;

    /// `GET /notification/unread/count`
    async fn fetch_unread_count(&self) -> Result<serde_json::Value, ApiError>;

    /// `PATCH /notification/{id}/read`
    async fn mark_read(&self, id: &str) -> Result<(), ApiError>;

    /// `PATCH /notification/read-all`
    async fn mark_all_read(&self) -> Result<(), ApiError>;

    /// `DELETE /notification/{id}`
    async fn delete(&self, id: &str) -> Result<(), ApiError>;
}
