use reqwest::StatusCode;
use shared::error::ApiErrorBody;
use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("network error: {message}")]
    Network { message: String },
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("authorization failed: {message}")]
    Auth { message: String },
    #[error("protocol error: {message}")]
    Protocol { message: String },
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: &'static str, after_ms: u64 },
    #[error("push connection rejected authorization {failures} times; giving up")]
    RetryBudgetExhausted { failures: u32 },
    #[error("push connection is not established")]
    NotConnected,
    #[error("session has been cleared; sign in again")]
    SessionCleared,
    #[error("credential storage error: {message}")]
    Storage { message: String },
}

impl ClientError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn timeout(operation: &'static str, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            after_ms: after.as_millis() as u64,
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<ApiErrorBody>(body)
            .map(|body| body.message)
            .ok()
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("unexpected response")
                    .to_string()
            });

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Self::Auth { message }
        } else {
            Self::Api {
                status: status.as_u16(),
                message,
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Auth { .. } | Self::RetryBudgetExhausted { .. } | Self::SessionCleared
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return Self::Timeout {
                operation: "request",
                after_ms: 0,
            };
        }
        if let Some(status) = value.status() {
            return Self::from_status(status, "");
        }
        if value.is_decode() {
            return Self::protocol(format!("invalid response body: {value}"));
        }
        Self::network(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match value {
            WsError::Http(response) => {
                let status = response.status();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    Self::Auth {
                        message: format!("push handshake rejected with {status}"),
                    }
                } else {
                    Self::Api {
                        status: status.as_u16(),
                        message: format!("push handshake rejected with {status}"),
                    }
                }
            }
            WsError::Protocol(err) => Self::protocol(err.to_string()),
            other => Self::network(other.to_string()),
        }
    }
}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
