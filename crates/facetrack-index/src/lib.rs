//! facetrack-index — similarity search over face embeddings.
//!
//! Stores L2-normalized embeddings behind a pluggable nearest-neighbor
//! backend (exact flat scan, inverted-file, or small-world graph), answers
//! ranked identity queries with TTL caching, and persists the gallery as an
//! atomic file triple (metadata + raw embeddings + index blob).

pub mod backend;
pub mod cache;
pub mod error;
pub mod matcher;
pub mod store;
pub mod types;

pub use backend::{BackendConfig, BackendKind};
pub use error::MatcherError;
pub use matcher::{FaceMatcher, MatcherConfig, MatcherStats};
pub use types::{IndexEntry, MatchResult};
