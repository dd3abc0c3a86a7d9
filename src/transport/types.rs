//! Request and response types for the notification backend.
//!
//! This module defines the data structures used for serialization and
//! deserialization when communicating with the backend. Notification
//! listings are deliberately left as raw JSON here; their shape varies
//! between server versions and is normalized by [`crate::inbox::normalize`].

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Authenticated principal as reported by the backend.
///
/// Opaque to the sync engine apart from `id`, which scopes the event stream
/// and distinguishes one login from the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable principal identifier.
    pub id: String,
    /// Display name, if the backend provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Email address, if the backend provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Identity {
    /// Creates an identity with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            email: None,
        }
    }

    /// Extracts an identity from a profile or login response.
    ///
    /// Accepts a bare user object or one wrapped in `user` or `data`, and
    /// either `id` or `_id` as the identifier.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, ApiError> {
        let user = ["user", "data"]
            .iter()
            .find_map(|key| payload.get(key).filter(|v| v.is_object()))
            .map_or(payload, |inner| inner.get("user").unwrap_or(inner));

        let id = match user.get("id").or_else(|| user.get("_id")) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                return Err(ApiError::MalformedPayload(
                    "profile has no user id".to_string(),
                ))
            }
        };

        let text = |key: &str| {
            user.get(key)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        };

        Ok(Self {
            id,
            name: text("name"),
            email: text("email"),
        })
    }
}

/// Body of `POST /users/login`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    /// Account email.
    pub email: &'a str,
    /// Account password.
    pub password: &'a str,
}

/// Body of `POST /users/register`.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest<'a> {
    /// Display name.
    pub name: &'a str,
    /// Account email.
    pub email: &'a str,
    /// Account password.
    pub password: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_from_bare_profile() {
        let identity =
            Identity::from_payload(&json!({"id": "u1", "name": "Ada", "email": "ada@example.com"}))
                .unwrap();
        assert_eq!(identity.id, "u1");
        assert_eq!(identity.name.as_deref(), Some("Ada"));
        assert_eq!(identity.email.as_deref(), Some("ada@example.com"));
    }

    #[test]
    fn test_identity_from_wrapped_profile() {
        let identity = Identity::from_payload(&json!({"user": {"_id": "abc"}})).unwrap();
        assert_eq!(identity.id, "abc");

        let identity = Identity::from_payload(&json!({"data": {"user": {"id": 7}}})).unwrap();
        assert_eq!(identity.id, "7");
    }

    #[test]
    fn test_identity_without_id_is_malformed() {
        let err = Identity::from_payload(&json!({"message": "ok"})).unwrap_err();
        assert!(matches!(err, ApiError::MalformedPayload(_)));
    }

    #[test]
    fn test_login_request_serializes() {
        let body = serde_json::to_value(LoginRequest {
            email: "a@b.c",
            password: "pw",
        })
        .unwrap();
        assert_eq!(body, json!({"email": "a@b.c", "password": "pw"}));
    }
}
