use crate::store::StoreError;
use std::fmt;
use thiserror::Error;
use waengine_core::binary::BinaryError;
use waengine_core::noise::NoiseError;
use waengine_core::signal::SignalError;

/// Why a connection ended, with the status code reported alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    TimedOut,
    LoggedOut,
    BadSession,
    RestartRequired,
    MultideviceMismatch,
    Forbidden,
    UnavailableService,
}

impl DisconnectReason {
    pub fn status_code(self) -> u16 {
        match self {
            DisconnectReason::ConnectionClosed => 428,
            DisconnectReason::ConnectionLost => 408,
            DisconnectReason::ConnectionReplaced => 440,
            DisconnectReason::TimedOut => 408,
            DisconnectReason::LoggedOut => 401,
            DisconnectReason::BadSession => 500,
            DisconnectReason::RestartRequired => 515,
            DisconnectReason::MultideviceMismatch => 411,
            DisconnectReason::Forbidden => 403,
            DisconnectReason::UnavailableService => 503,
        }
    }

    /// Maps a server status code. 408 is ambiguous and reads as a lost
    /// connection; unknown codes are treated as a bad session.
    pub fn from_status_code(code: u16) -> Self {
        match code {
            428 => DisconnectReason::ConnectionClosed,
            408 => DisconnectReason::ConnectionLost,
            440 => DisconnectReason::ConnectionReplaced,
            401 => DisconnectReason::LoggedOut,
            515 => DisconnectReason::RestartRequired,
            411 => DisconnectReason::MultideviceMismatch,
            403 => DisconnectReason::Forbidden,
            503 => DisconnectReason::UnavailableService,
            _ => DisconnectReason::BadSession,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::ConnectionClosed => "connection closed",
            DisconnectReason::ConnectionLost => "connection lost",
            DisconnectReason::ConnectionReplaced => "connection replaced",
            DisconnectReason::TimedOut => "timed out",
            DisconnectReason::LoggedOut => "logged out",
            DisconnectReason::BadSession => "bad session",
            DisconnectReason::RestartRequired => "restart required",
            DisconnectReason::MultideviceMismatch => "multidevice mismatch",
            DisconnectReason::Forbidden => "forbidden",
            DisconnectReason::UnavailableService => "unavailable service",
        };
        write!(f, "{name} ({})", self.status_code())
    }
}

/// Diagnosis attached to the terminal connection update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectError {
    pub reason: DisconnectReason,
    pub message: String,
}

impl fmt::Display for DisconnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Connection Closed")]
    ConnectionClosed,

    #[error("Connection was lost")]
    ConnectionLost,

    #[error("Timed Out")]
    Timeout,

    #[error("server error {code}: {text}")]
    Protocol { code: u16, text: String },

    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("storage error: {0}")]
    Storage(StoreError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("websocket error {code}: {message}")]
    WebSocket { code: u16, message: String },

    #[error("{message}")]
    Stream {
        reason: DisconnectReason,
        message: String,
    },

    #[error("logged out: {0}")]
    LoggedOut(String),

    #[error("a request with id {0} is already pending")]
    DuplicateRequest(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("handshake failed: {0}")]
    Handshake(#[from] NoiseError),

    #[error("signal error: {0}")]
    Signal(#[from] SignalError),

    #[error("binary codec error: {0}")]
    Binary(#[from] BinaryError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotADirectory(_) => EngineError::Configuration(err.to_string()),
            other => EngineError::Storage(other),
        }
    }
}

impl EngineError {
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            EngineError::ConnectionClosed => DisconnectReason::ConnectionClosed,
            EngineError::ConnectionLost => DisconnectReason::ConnectionLost,
            EngineError::Timeout => DisconnectReason::TimedOut,
            EngineError::Protocol { code, .. } => DisconnectReason::from_status_code(*code),
            EngineError::WebSocket { code, .. } => DisconnectReason::from_status_code(*code),
            EngineError::Stream { reason, .. } => *reason,
            EngineError::LoggedOut(_) => DisconnectReason::LoggedOut,
            EngineError::AuthenticationFailure(_)
            | EngineError::RateLimited(_)
            | EngineError::Storage(_)
            | EngineError::Configuration(_)
            | EngineError::DuplicateRequest(_)
            | EngineError::MalformedResponse(_)
            | EngineError::Handshake(_)
            | EngineError::Signal(_)
            | EngineError::Binary(_) => DisconnectReason::BadSession,
        }
    }

    pub fn to_disconnect_error(&self) -> DisconnectError {
        DisconnectError {
            reason: self.disconnect_reason(),
            message: self.to_string(),
        }
    }

    /// Copies the error for fan-out to several waiters. Wrapped library
    /// errors are not `Clone`, so they are flattened to their message.
    pub fn duplicate(&self) -> EngineError {
        match self {
            EngineError::ConnectionClosed => EngineError::ConnectionClosed,
            EngineError::ConnectionLost => EngineError::ConnectionLost,
            EngineError::Timeout => EngineError::Timeout,
            EngineError::Protocol { code, text } => EngineError::Protocol {
                code: *code,
                text: text.clone(),
            },
            EngineError::AuthenticationFailure(m) => EngineError::AuthenticationFailure(m.clone()),
            EngineError::RateLimited(m) => EngineError::RateLimited(m.clone()),
            EngineError::Configuration(m) => EngineError::Configuration(m.clone()),
            EngineError::WebSocket { code, message } => EngineError::WebSocket {
                code: *code,
                message: message.clone(),
            },
            EngineError::Stream { reason, message } => EngineError::Stream {
                reason: *reason,
                message: message.clone(),
            },
            EngineError::LoggedOut(m) => EngineError::LoggedOut(m.clone()),
            EngineError::DuplicateRequest(id) => EngineError::DuplicateRequest(id.clone()),
            EngineError::MalformedResponse(m) => EngineError::MalformedResponse(m.clone()),
            other => EngineError::Stream {
                reason: other.disconnect_reason(),
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_carry_status_codes() {
        assert_eq!(EngineError::ConnectionClosed.disconnect_reason().status_code(), 428);
        assert_eq!(EngineError::ConnectionLost.disconnect_reason().status_code(), 408);
        assert_eq!(EngineError::Timeout.disconnect_reason(), DisconnectReason::TimedOut);
        assert_eq!(
            EngineError::Protocol {
                code: 401,
                text: "x".into()
            }
            .disconnect_reason(),
            DisconnectReason::LoggedOut
        );
        assert_eq!(DisconnectReason::from_status_code(999), DisconnectReason::BadSession);
    }

    #[test]
    fn non_directory_store_error_is_a_configuration_error() {
        let err: EngineError = StoreError::NotADirectory("/tmp/x".into()).into();
        assert!(matches!(err, EngineError::Configuration(_)));
        let err: EngineError = StoreError::Serialization("bad".into()).into();
        assert!(matches!(err, EngineError::Storage(_)));
    }
}
