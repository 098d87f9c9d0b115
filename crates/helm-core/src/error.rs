use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Provider/model-facing error taxonomy. Serialized into assistant messages
/// and bus events as `{name, data}` so front-ends can render each kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "name", content = "data")]
pub enum ProviderError {
    /// User or system cancellation. Recoverable: a partially streamed
    /// response is still worth keeping.
    #[serde(rename = "MessageAbortedError")]
    #[error("aborted: {message}")]
    Aborted { message: String },

    /// Missing or invalid credentials for a provider.
    #[serde(rename = "ProviderAuthError")]
    #[error("authentication failed for {provider_id}: {message}")]
    Auth {
        #[serde(rename = "providerID")]
        provider_id: String,
        message: String,
    },

    /// The model hit its output-length limit and truncated the response.
    #[serde(rename = "MessageOutputLengthError")]
    #[error("model output exceeded the length limit")]
    OutputLength {},

    /// Network/HTTP failure from the provider API.
    #[serde(rename = "APIError")]
    #[error("api error: {message}")]
    Api {
        message: String,
        #[serde(rename = "statusCode", skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(rename = "isRetryable")]
        is_retryable: bool,
        #[serde(rename = "responseHeaders", skip_serializing_if = "Option::is_none")]
        response_headers: Option<BTreeMap<String, String>>,
        #[serde(rename = "responseBody", skip_serializing_if = "Option::is_none")]
        response_body: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<BTreeMap<String, String>>,
    },

    /// Fallback wrapping any other failure with its string form preserved.
    #[serde(rename = "UnknownError")]
    #[error("{message}")]
    Unknown { message: String },
}

impl ProviderError {
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted { message: message.into() }
    }

    pub fn auth(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            provider_id: provider_id.into(),
            message: message.into(),
        }
    }

    /// Wrap an arbitrary error, preserving its display form.
    pub fn unknown(err: impl std::fmt::Display) -> Self {
        Self::Unknown { message: err.to_string() }
    }

    /// Classify an HTTP status into the matching variant.
    pub fn from_status(provider_id: &str, status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::auth(provider_id, body),
            429 | 529 => Self::Api {
                message: body,
                status_code: Some(status),
                is_retryable: true,
                response_headers: None,
                response_body: None,
                metadata: None,
            },
            500..=599 => Self::Api {
                message: body,
                status_code: Some(status),
                is_retryable: true,
                response_headers: None,
                response_body: None,
                metadata: None,
            },
            _ => Self::Api {
                message: body,
                status_code: Some(status),
                is_retryable: false,
                response_headers: None,
                response_body: None,
                metadata: None,
            },
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Api { is_retryable: true, .. })
    }

    /// Wire name, matching the serialized `name` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aborted { .. } => "MessageAbortedError",
            Self::Auth { .. } => "ProviderAuthError",
            Self::OutputLength {} => "MessageOutputLengthError",
            Self::Api { .. } => "APIError",
            Self::Unknown { .. } => "UnknownError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_named_error() {
        let err = ProviderError::auth("anthropic", "no key");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["name"], "ProviderAuthError");
        assert_eq!(json["data"]["providerID"], "anthropic");
        assert_eq!(json["data"]["message"], "no key");
    }

    #[test]
    fn roundtrip_all_variants() {
        let errors = vec![
            ProviderError::aborted("ctrl-c"),
            ProviderError::auth("openai", "expired"),
            ProviderError::OutputLength {},
            ProviderError::Api {
                message: "overloaded".into(),
                status_code: Some(529),
                is_retryable: true,
                response_headers: None,
                response_body: Some("{}".into()),
                metadata: None,
            },
            ProviderError::unknown("boom"),
        ];
        for err in errors {
            let json = serde_json::to_string(&err).unwrap();
            let parsed: ProviderError = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, err);
        }
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            ProviderError::from_status("anthropic", 401, "unauthorized"),
            ProviderError::Auth { .. }
        ));
        assert!(ProviderError::from_status("anthropic", 429, "rate limited").is_retryable());
        assert!(ProviderError::from_status("anthropic", 503, "unavailable").is_retryable());
        assert!(!ProviderError::from_status("anthropic", 400, "bad request").is_retryable());
    }

    #[test]
    fn aborted_classification() {
        assert!(ProviderError::aborted("stop").is_aborted());
        assert!(!ProviderError::unknown("stop").is_aborted());
    }
}
