//! Error taxonomy for the sync engine.
//!
//! Every failure the core can observe maps onto one [`ApiError`] variant. The
//! variant decides the recovery path: network failures and stream drops are
//! retried locally, authorization failures go through credential renewal,
//! and everything else is logged and surfaced as a plain `Err`.

/// Errors produced by the transport, stream and normalization layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// No response at all: connect failure, reset, or request timeout.
    ///
    /// Never triggers credential renewal or logout.
    NetworkUnreachable(String),
    /// The server answered 401 for an authenticated call.
    AuthorizationExpired,
    /// Credential renewal failed, or the attempt bound was exceeded.
    ///
    /// Propagated to the identity layer, which decides whether to end the
    /// session.
    RenewalExhausted,
    /// The event stream failed or ended; the stream client reconnects.
    StreamTransportError(String),
    /// A payload could not be understood.
    MalformedPayload(String),
    /// Any other non-success response.
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
}

impl ApiError {
    /// Returns `true` for the 401 case that the renewal protocol intercepts.
    #[must_use]
    pub fn is_authorization_expired(&self) -> bool {
        matches!(self, Self::AuthorizationExpired)
    }

    /// Returns `true` for failures that are recovered locally by retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnreachable(_) | Self::StreamTransportError(_)
        )
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NetworkUnreachable(msg) => write!(f, "Network unreachable: {msg}"),
            Self::AuthorizationExpired => write!(f, "Authorization expired"),
            Self::RenewalExhausted => write!(f, "Credential renewal exhausted"),
            Self::StreamTransportError(msg) => write!(f, "Stream transport error: {msg}"),
            Self::MalformedPayload(msg) => write!(f, "Malformed payload: {msg}"),
            Self::Status { status, body } if body.is_empty() => {
                write!(f, "Server returned {status}")
            }
            Self::Status { status, body } => write!(f, "Server returned {status}: {body}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        // A status on the error means the server answered; everything else
        // (connect, timeout, body read) is a transport-level failure.
        match err.status() {
            Some(status) if status == reqwest::StatusCode::UNAUTHORIZED => {
                Self::AuthorizationExpired
            }
            Some(status) => Self::Status {
                status: status.as_u16(),
                body: String::new(),
            },
            None if err.is_decode() => Self::MalformedPayload(err.to_string()),
            None => Self::NetworkUnreachable(err.to_string()),
        }
    }
}
