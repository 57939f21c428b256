use crate::{
    ingest::build::IngestErr,
    local::storage::StorageErr,
    remote::{fetch::FetchErr, provider::ProviderErr},
    rt::pool::PoolErr,
};

/// Top-level error for engine operations (queues, reconciliation, CLI).
/// Recoverable conditions are handled inside the component that can recover
/// them; whatever reaches this type is surfaced to the user.
#[derive(Debug, thiserror::Error)]
pub enum EngineErr {
    #[error(transparent)]
    Storage(#[from] StorageErr),

    #[error(transparent)]
    Ingest(#[from] IngestErr),

    #[error(transparent)]
    Provider(#[from] ProviderErr),

    #[error(transparent)]
    Fetch(#[from] FetchErr),

    #[error(transparent)]
    Pool(#[from] PoolErr),

    #[error("operation cancelled")]
    Cancelled,
}

impl EngineErr {
    /// Auth failures mark the provider as needing attention and are never
    /// retried within the failing task.
    pub fn is_auth(&self) -> bool {
        matches!(self, EngineErr::Provider(err) if err.is_auth())
    }

    /// A missing remote object invalidates the relevant cache entry; the
    /// next reconciliation drops the placeholder.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineErr::Provider(err) if err.is_not_found())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineErr::Cancelled)
    }
}

pub type Result<T> = culprit::Result<T, EngineErr>;
