use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected http status {0}")]
    Status(u16),

    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("snapshot io error: {0}")]
    Snapshot(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl IndexerError {
    /// Transient failures worth another attempt. Decode and serialization
    /// errors are deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            IndexerError::RateLimited { .. } => true,
            IndexerError::Http(_) => true,
            IndexerError::Rpc(_) => true,
            IndexerError::Status(code) => *code >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(IndexerError::RateLimited { retry_after_ms: None }.is_retryable());
        assert!(IndexerError::Rpc("node behind".to_string()).is_retryable());
        assert!(IndexerError::Status(503).is_retryable());
        assert!(!IndexerError::Status(404).is_retryable());
        assert!(!IndexerError::Decode("bad discriminator".to_string()).is_retryable());
    }
}
