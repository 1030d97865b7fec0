//! Closed error taxonomy (§7). Each component-level error enum below maps to
//! one of these abstract kinds; transports translate a kind to a close code
//! or an `error{...}` frame.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ConnectionError,
    ContractNotFound,
    StreamTimeout,
    RateLimitExceeded,
    InvalidMessage,
    BufferOverflow,
    SlowConsumer,
    StorageError,
    InternalError,
}

impl ErrorKind {
    /// Whether a handler receiving this kind can still recover (stay open)
    /// or must terminate. Per §7, `STREAM_TIMEOUT` terminates via
    /// `complete`, not `error`, and is handled separately by callers.
    pub fn recoverable(&self) -> bool {
        matches!(self, ErrorKind::ConnectionError)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("connection to {host}:{port} timed out after {timeout_ms}ms")]
    HandshakeTimeout {
        host: String,
        port: u16,
        timeout_ms: u64,
    },
    #[error("socket error: {0}")]
    Socket(String),
    #[error("upstream reported contract not found for request {request_id}")]
    ContractNotFound { request_id: i32 },
    #[error("upstream error code {code} for request {request_id:?}: {message}")]
    UpstreamCode {
        code: i32,
        request_id: Option<i32>,
        message: String,
    },
}

impl UpstreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpstreamError::HandshakeTimeout { .. } | UpstreamError::Socket(_) => {
                ErrorKind::ConnectionError
            }
            UpstreamError::ContractNotFound { .. } => ErrorKind::ContractNotFound,
            UpstreamError::UpstreamCode { code, .. } => classify_upstream_code(*code),
        }
    }
}

/// Error classification table from spec §4.1 / §7.
pub fn classify_upstream_code(code: i32) -> ErrorKind {
    match code {
        502 | 504 | 1100 => ErrorKind::ConnectionError,
        200 => ErrorKind::ContractNotFound,
        2100..=2106 | 2158 => ErrorKind::InternalError, // informational: log only, never surfaced as an error frame
        _ => ErrorKind::InternalError,
    }
}

/// True for codes that are purely informational (log only), per §4.1.
pub fn is_informational_code(code: i32) -> bool {
    matches!(code, 2104 | 2106 | 2158) || (2100..=2103).contains(&code)
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("duplicate request_id {0} registered")]
    DuplicateRequestId(i32),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::StorageError
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("message failed schema validation: {0}")]
    InvalidMessage(String),
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),
    #[error("subscriber outbound queue overflowed")]
    BufferOverflow,
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::InvalidMessage(_) => ErrorKind::InvalidMessage,
            TransportError::RateLimitExceeded(_) => ErrorKind::RateLimitExceeded,
            TransportError::BufferOverflow => ErrorKind::SlowConsumer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_codes_classify_as_connection_error() {
        for code in [502, 504, 1100] {
            assert_eq!(classify_upstream_code(code), ErrorKind::ConnectionError);
        }
    }

    #[test]
    fn contract_not_found_code_200() {
        assert_eq!(classify_upstream_code(200), ErrorKind::ContractNotFound);
    }

    #[test]
    fn informational_codes_identified() {
        assert!(is_informational_code(2104));
        assert!(is_informational_code(2106));
        assert!(is_informational_code(2158));
        assert!(is_informational_code(2101));
        assert!(!is_informational_code(502));
    }

    #[test]
    fn only_connection_error_is_recoverable() {
        assert!(ErrorKind::ConnectionError.recoverable());
        assert!(!ErrorKind::InternalError.recoverable());
        assert!(!ErrorKind::ContractNotFound.recoverable());
    }
}
