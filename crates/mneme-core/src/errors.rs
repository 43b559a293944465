use std::time::Duration;

/// Failure talking to an external provider (embedding model or text generator).
///
/// Every variant means "feature unavailable for this call". Callers degrade
/// instead of surfacing these to the end user.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Status { .. } => "status",
            Self::Decode(_) => "decode",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_variants() {
        let cases = vec![
            (ProviderError::Network("refused".into()), "network error: refused"),
            (
                ProviderError::Timeout(Duration::from_secs(2)),
                "timeout after 2s",
            ),
            (
                ProviderError::Status {
                    status: 503,
                    body: "busy".into(),
                },
                "provider returned 503: busy",
            ),
            (ProviderError::Decode("eof".into()), "decode error: eof"),
            (ProviderError::Cancelled, "cancelled"),
        ];
        for (err, expected) in cases {
            assert_eq!(err.to_string(), expected);
        }
    }

    #[test]
    fn kinds() {
        assert_eq!(ProviderError::Cancelled.error_kind(), "cancelled");
        assert_eq!(
            ProviderError::Timeout(Duration::from_millis(5)).error_kind(),
            "timeout"
        );
        assert!(ProviderError::Cancelled.is_cancelled());
        assert!(!ProviderError::Network(String::new()).is_cancelled());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProviderError>();
    }
}
