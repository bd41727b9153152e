use serde::Serialize;
use thiserror::Error;

/// Failure raised by a source adapter or the fetcher underneath it.
///
/// The variant is the classification; the classifier never inspects
/// messages to decide a category.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("blocked by source: {0}")]
    Blocked(String),
    #[error("rate limited by source: {0}")]
    RateLimited(String),
    #[error("bad source configuration: {0}")]
    BadConfig(String),
    #[error("tls certificate failure: {0}")]
    TlsCert(String),
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

impl SourceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SourceError::Blocked(_) => ErrorCategory::Blocked,
            SourceError::RateLimited(_) => ErrorCategory::RateLimited,
            SourceError::BadConfig(_) => ErrorCategory::BadConfig,
            SourceError::TlsCert(_) => ErrorCategory::TlsCert,
            SourceError::TransientNetwork(_) => ErrorCategory::TransientNetwork,
            SourceError::Unclassified(_) => ErrorCategory::Unclassified,
        }
    }

    pub fn unclassified(message: impl Into<String>) -> Self {
        SourceError::Unclassified(anyhow::anyhow!(message.into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Blocked,
    RateLimited,
    BadConfig,
    TlsCert,
    TransientNetwork,
    Unclassified,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Blocked => "blocked",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::BadConfig => "bad_config",
            ErrorCategory::TlsCert => "tls_cert",
            ErrorCategory::TransientNetwork => "transient_network",
            ErrorCategory::Unclassified => "unclassified",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_errors_are_unclassified() {
        let err: SourceError = anyhow::anyhow!("parser exploded").into();
        assert_eq!(err.category(), ErrorCategory::Unclassified);
        assert_eq!(err.to_string(), "parser exploded");
        assert_eq!(
            SourceError::BadConfig("404".into()).category().as_str(),
            "bad_config"
        );
    }
}
