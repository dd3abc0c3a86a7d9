//! notification-sync - client-side real-time notification synchronization.
//!
//! This crate keeps a local notification inbox consistent with a remote
//! backend across three racing inputs: on-demand refreshes over
//! request/response calls, pushes over a long-lived event stream, and
//! transparent repair of expired sessions.
//!
//! # Architecture
//!
//! ```text
//!   SessionBoundary ──identity (watch)──► Reconciler ──refresh──► ApiClient
//!                                            ▲    │                  │
//!                                     pushes │    │ start/stop       │ 401
//!                                            │    ▼                  ▼
//!                                         StreamClient      RenewalCoordinator
//! ```
//!
//! - **Transport** - REST client with cookie sessions and single-flight
//!   credential renewal
//! - **Stream** - supervised `text/event-stream` connection with backoff
//! - **Inbox** - canonical state, payload normalization and merging
//! - **Session** - publishes who is signed in
//!
//! # Modules
//!
//! - [`transport`] - backend API client and renewal coordinator
//! - [`stream`] - event stream client
//! - [`inbox`] - notification state reconciler
//! - [`session`] - identity publisher
//! - [`config`] - configuration loading/saving

pub mod config;
pub mod constants;
pub mod error;
pub mod inbox;
pub mod session;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use error::ApiError;
pub use inbox::{InboxSnapshot, NotificationRecord, Priority, Reconciler, RefreshOutcome};
pub use session::SessionBoundary;
pub use stream::{BackoffPolicy, ConnectionState, HttpEventSource, StreamClient, StreamEvent};
pub use transport::{ApiClient, Identity, NotificationApi};
