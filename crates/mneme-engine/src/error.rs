use mneme_core::ProviderError;
use mneme_store::StoreError;

/// Errors surfaced by the memory engine.
///
/// Only `Storage` on a user's own input is meant to abort a turn. The other
/// variants describe augmentation that did not happen.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(#[from] ProviderError),

    #[error("model produced an empty reply")]
    EmptyGeneration,
}

impl MemoryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::ProviderUnavailable(e) if e.is_cancelled())
    }
}
