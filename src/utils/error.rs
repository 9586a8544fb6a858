//! Error handling for the proxy-lifecycle engine.

use thiserror::Error;

/// Crate-wide error type. Transient probe failures (timeouts, transport
/// errors, JSON mismatches) never reach here — they are absorbed into a
/// record's fail counter by the validator/manager. This enum covers the
/// fatal and caller-actionable kinds only.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("connection timed out")]
    Timeout,

    #[error("invalid proxy address: {0}")]
    InvalidFormat(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no proxy available")]
    NoProxyAvailable,
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Trait for safe error handling with added context.
pub trait SafeUnwrap<T> {
    fn safe_unwrap(self, context: &str) -> ProxyResult<T>;
}

impl<T> SafeUnwrap<T> for Option<T> {
    fn safe_unwrap(self, context: &str) -> ProxyResult<T> {
        self.ok_or_else(|| ProxyError::Config(format!("expected value in {}", context)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(ProxyError::Timeout.to_string(), "connection timed out");
        assert_eq!(
            ProxyError::NoProxyAvailable.to_string(),
            "no proxy available"
        );
    }

    #[test]
    fn safe_unwrap_reports_context() {
        let v: Option<u32> = None;
        let err = v.safe_unwrap("queue_size").unwrap_err();
        assert!(err.to_string().contains("queue_size"));
    }
}
