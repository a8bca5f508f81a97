use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by index mutations. The read path (`find`) never returns
/// these; it degrades to an empty result list and a logged error.
#[derive(Error, Debug)]
pub enum MatcherError {
    /// Malformed embedding or metadata, rejected before touching the index.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Index is out of room; callers retry with a reduced batch rather than
    /// silently dropping registrations.
    #[error("index capacity exhausted: {0}")]
    Capacity(String),
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("unknown face id: {0}")]
    NotFound(String),
}
