use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Structured error returned by the backend for a failed call.
///
/// When the response body does not follow the structured contract, a
/// generic instance is synthesized from the bare HTTP status instead.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub status: u16,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub path: String,
    pub details: Option<Value>,
}

/// Wire shape of the backend's structured error body.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    details: Option<Value>,
}

impl ApiError {
    /// Parse a non-2xx response body, falling back to a synthesized error
    /// when the body is not structured JSON.
    pub fn from_response(status: u16, body: &[u8], path: &str, correlation_id: &str) -> Self {
        match serde_json::from_slice::<ErrorBody>(body) {
            Ok(parsed) => Self {
                code: parsed.code,
                message: parsed.message,
                status: parsed.status_code.unwrap_or(status),
                correlation_id: parsed
                    .correlation_id
                    .unwrap_or_else(|| correlation_id.to_string()),
                timestamp: parsed.timestamp.unwrap_or_else(Utc::now),
                path: parsed.path.unwrap_or_else(|| path.to_string()),
                details: parsed.details,
            },
            Err(_) => Self::from_status(status, path, correlation_id),
        }
    }

    /// Synthesize an error from a bare HTTP status.
    pub fn from_status(status: u16, path: &str, correlation_id: &str) -> Self {
        let message = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("request failed")
            .to_string();
        Self {
            code: format!("HTTP_{status}"),
            message,
            status,
            correlation_id: correlation_id.to_string(),
            timestamp: Utc::now(),
            path: path.to_string(),
            details: None,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) on {}: {}",
            self.code, self.status, self.path, self.message
        )
    }
}

/// Failure taxonomy for the request layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Structured, server-originated failure.
    #[error("{0}")]
    Api(ApiError),

    /// Transport-level failure: DNS, refused connection, closed socket.
    #[error("network error [{correlation_id}]: {message}")]
    Network {
        message: String,
        correlation_id: String,
    },

    /// The request was aborted after exceeding its deadline.
    #[error("request timed out after {timeout_ms}ms [{correlation_id}]")]
    Timeout {
        timeout_ms: u64,
        correlation_id: String,
    },

    /// The CSRF token endpoint itself failed; no domain request was made.
    #[error("csrf token acquisition failed: {0}")]
    CsrfAcquisition(String),

    /// Invalid configuration or request construction.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Whether a 403 response is a CSRF rejection worth one token refresh.
///
/// The dedicated codes are the current backend contract. The FORBIDDEN +
/// substring match is a fallback for an older contract; retire it once the
/// backend confirms those responses are gone.
pub fn is_csrf_rejection(err: &ApiError) -> bool {
    match err.code.as_str() {
        "CSRF_TOKEN_MISSING" | "CSRF_TOKEN_INVALID" => true,
        "FORBIDDEN" => {
            let message = err.message.to_ascii_lowercase();
            message.contains("csrf") || message.contains("token")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn forbidden(code: &str, message: &str) -> ApiError {
        ApiError {
            code: code.to_string(),
            message: message.to_string(),
            status: 403,
            correlation_id: "cid-1".to_string(),
            timestamp: Utc::now(),
            path: "/orders".to_string(),
            details: None,
        }
    }

    #[test]
    fn dedicated_csrf_codes_are_recognized() {
        assert!(is_csrf_rejection(&forbidden("CSRF_TOKEN_MISSING", "missing")));
        assert!(is_csrf_rejection(&forbidden("CSRF_TOKEN_INVALID", "invalid")));
    }

    #[test]
    fn forbidden_fallback_matches_on_message_substring() {
        assert!(is_csrf_rejection(&forbidden("FORBIDDEN", "CSRF check failed")));
        assert!(is_csrf_rejection(&forbidden("FORBIDDEN", "stale Token")));
        assert!(!is_csrf_rejection(&forbidden("FORBIDDEN", "not allowed")));
    }

    #[test]
    fn unrelated_codes_are_not_csrf() {
        assert!(!is_csrf_rejection(&forbidden("USER_NOT_FOUND", "csrf")));
    }

    #[test]
    fn structured_body_round_trips() {
        let body = json!({
            "code": "USER_NOT_FOUND",
            "message": "user does not exist",
            "status_code": 404,
            "correlation_id": "cid-x",
            "timestamp": "2025-01-01T00:00:00Z",
            "path": "/users/42",
            "details": {"user_id": 42}
        });
        let err = ApiError::from_response(404, body.to_string().as_bytes(), "/users/42", "cid-local");
        assert_eq!(err.code, "USER_NOT_FOUND");
        assert_eq!(err.status, 404);
        assert_eq!(err.correlation_id, "cid-x");
        assert_eq!(err.path, "/users/42");
        assert_eq!(err.details.unwrap()["user_id"], 42);
    }

    #[test]
    fn unstructured_body_synthesizes_from_status() {
        let err = ApiError::from_response(502, b"<html>bad gateway</html>", "/cart", "cid-2");
        assert_eq!(err.code, "HTTP_502");
        assert_eq!(err.status, 502);
        assert_eq!(err.correlation_id, "cid-2");
        assert_eq!(err.path, "/cart");
    }

    #[test]
    fn missing_optional_fields_fall_back_to_attempt_values() {
        let body = json!({"code": "FORBIDDEN", "message": "no"});
        let err = ApiError::from_response(403, body.to_string().as_bytes(), "/x", "cid-3");
        assert_eq!(err.status, 403);
        assert_eq!(err.correlation_id, "cid-3");
        assert_eq!(err.path, "/x");
    }
}
