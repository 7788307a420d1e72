use thiserror::Error;

/// Failure taxonomy for staleness resolution. All variants are non-fatal to
/// the session: the caller records the container Failed and moves on.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("registry authentication failed: {0}")]
    AuthFailed(String),

    #[error("manifest unavailable: {0}")]
    ManifestUnavailable(String),

    #[error("network timeout contacting registry")]
    NetworkTimeout,

    #[error("no manifest entry matches architecture {0}/{1}")]
    ArchNotFound(String, String),

    #[error("pull failed: {0}")]
    PullFailed(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for ResolverError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ResolverError::NetworkTimeout
        } else {
            ResolverError::ManifestUnavailable(e.to_string())
        }
    }
}
