use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OdooErrorBody {
    pub name: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default)]
    pub context: Value,
    pub debug: Option<String>,
}

impl OdooErrorBody {
    /// Odoo raises this when a cached session uid is no longer valid.
    pub fn is_session_expired(&self) -> bool {
        self.name
            .as_deref()
            .is_some_and(|n| n.contains("SessionExpiredException"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OdooError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("Odoo API error (status {status}): {message}")]
    Api {
        status: u16,
        message: String,
        body: Option<OdooErrorBody>,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl OdooError {
    /// Transient in the sense that a cycle should abort and the breaker
    /// should count it, but it is not a programming error in this client.
    /// A 5xx (or request-timeout 408) HTTP status on the JSON-RPC call
    /// itself is an Odoo-side outage, not an application-level rejection,
    /// so it counts the same as a network-level transport failure.
    pub fn is_transport_like(&self) -> bool {
        match self {
            OdooError::Transport(_) | OdooError::RateLimited => true,
            OdooError::Api { status, .. } => *status == 408 || (500..600).contains(status),
            OdooError::Auth(_) | OdooError::InvalidResponse(_) => false,
        }
    }
}

pub type OdooResult<T> = Result<T, OdooError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_odoo_error_display_api_contains_status() {
        let err = OdooError::Api {
            status: 500,
            message: "Internal Server Error".to_string(),
            body: Some(OdooErrorBody {
                name: Some("ServerError".to_string()),
                message: Some("Something went wrong".to_string()),
                arguments: vec![],
                context: serde_json::Value::Null,
                debug: None,
            }),
        };
        let display = err.to_string();
        assert!(display.contains("500"));
        assert!(display.contains("Internal Server Error"));
    }

    #[test]
    fn test_odoo_error_display_auth() {
        let err = OdooError::Auth("invalid credentials".to_string());
        assert!(err.to_string().contains("invalid credentials"));
    }

    #[test]
    fn test_odoo_error_rate_limited_is_transport_like() {
        assert!(OdooError::RateLimited.is_transport_like());
    }

    #[test]
    fn test_odoo_error_api_404_is_not_transport_like() {
        let err = OdooError::Api {
            status: 404,
            message: "not found".to_string(),
            body: None,
        };
        assert!(!err.is_transport_like());
    }

    #[test]
    fn test_odoo_error_api_5xx_is_transport_like() {
        let err = OdooError::Api {
            status: 503,
            message: "Service Unavailable".to_string(),
            body: None,
        };
        assert!(err.is_transport_like());
    }

    #[test]
    fn test_odoo_error_api_408_is_transport_like() {
        let err = OdooError::Api {
            status: 408,
            message: "Request Timeout".to_string(),
            body: None,
        };
        assert!(err.is_transport_like());
    }

    #[test]
    fn test_odoo_error_display_invalid_response() {
        let err = OdooError::InvalidResponse("missing field".to_string());
        assert!(err.to_string().contains("missing field"));
    }

    #[test]
    fn test_odoo_error_body_session_expired() {
        let body = OdooErrorBody {
            name: Some("odoo.http.SessionExpiredException".to_string()),
            message: None,
            arguments: vec![],
            context: Value::Null,
            debug: None,
        };
        assert!(body.is_session_expired());
    }

    #[test]
    fn test_odoo_error_body_deserialize() {
        let json = r#"{
            "name": "odoo.exceptions.AccessDenied",
            "message": "Access Denied",
            "arguments": ["arg1", 123],
            "debug": "traceback here"
        }"#;
        let body: OdooErrorBody = serde_json::from_str(json).unwrap();
        assert_eq!(body.name, Some("odoo.exceptions.AccessDenied".to_string()));
        assert_eq!(body.message, Some("Access Denied".to_string()));
        assert_eq!(body.arguments.len(), 2);
        assert_eq!(body.debug, Some("traceback here".to_string()));
    }

    #[test]
    fn test_odoo_error_body_deserialize_minimal() {
        let json = r#"{}"#;
        let body: OdooErrorBody = serde_json::from_str(json).unwrap();
        assert!(body.name.is_none());
        assert!(body.message.is_none());
        assert!(body.arguments.is_empty());
    }
}
