pub mod http;
pub mod parse;

use async_trait::async_trait;
use thiserror::Error;

use crate::snapshot::Snapshot;
use crate::subscription::Credential;

pub use http::HttpPortalClient;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("portal rejected the credentials")]
    AuthFailed,
    #[error("portal unreachable: {0}")]
    Unreachable(String),
    #[error("dashboard not recognized: {0}")]
    ParseFailed(String),
}

impl FetchError {
    /// Transient failures are retried silently on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// One authenticated fetch of the dashboard. Implementations keep no state between
/// calls and never retry.
#[async_trait]
pub trait PortalClient: Send + Sync {
    async fn fetch(&self, credential: &Credential) -> Result<Snapshot, FetchError>;
}
