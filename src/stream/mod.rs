//! Long-lived event stream from the backend.
//!
//! # Architecture
//!
//! ```text
//!   StreamClient ──start(scope)──► supervisor task
//!        │                              │
//!        │ set_handlers()               │ EventSource::connect()
//!        ▼                              ▼
//!   StreamHandlers ◄──dispatch──── EventStream (parsed SSE frames)
//!                                       │
//!                                error / end of stream
//!                                       │
//!                           Reconnecting(delay) ──► Connecting
//! ```
//!
//! - [`client`] - supervised connection with backoff ([`StreamClient`])
//! - [`source`] - HTTP implementation of [`EventSource`]
//! - [`parser`] - `text/event-stream` decoding
//! - [`backoff`] - reconnection delay policy

pub mod backoff;
pub mod client;
pub mod parser;
pub mod source;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value;

use crate::error::ApiError;

pub use backoff::BackoffPolicy;
pub use client::{StreamClient, StreamHandlers};
pub use source::HttpEventSource;

/// Connection lifecycle of the stream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never started.
    #[default]
    Idle,
    /// Opening the stream.
    Connecting,
    /// Stream is open and delivering events.
    Open,
    /// Waiting before the next connection attempt.
    Reconnecting {
        /// Consecutive failed attempts, starting at 1.
        attempt: u32,
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// Explicitly stopped.
    Closed,
}

impl ConnectionState {
    /// Returns `true` while the stream is open.
    #[must_use]
    pub fn is_open(self) -> bool {
        self == Self::Open
    }

    /// Returns `true` when a connection is being established or is open.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

/// A typed event received from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Server greeting after subscribe. Informational only.
    Connected(Value),
    /// A notification push; the only event the reconciler merges.
    Notification(Value),
    /// A broadcast to all subscribers.
    Broadcast(Value),
    /// Anything else.
    Message(Value),
}

impl StreamEvent {
    /// Type tag as it appears on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::Notification(_) => "notification",
            Self::Broadcast(_) => "broadcast",
            Self::Message(_) => "message",
        }
    }

    /// Event payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        match self {
            Self::Connected(v) | Self::Notification(v) | Self::Broadcast(v) | Self::Message(v) => v,
        }
    }
}

/// Stream of parsed events for one connection.
///
/// An `Err` item or the end of the stream means the connection is gone.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ApiError>> + Send>>;

/// Opens event-stream connections.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Opens a new connection for `scope` (the identity id).
    async fn connect(&self, scope: &str) -> Result<EventStream, ApiError>;
}
