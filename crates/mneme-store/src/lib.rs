//! # mneme-store
//!
//! Durable per-user memory on a single embedded `SQLite` file:
//!
//! - [`MessageLog`]: ordered raw turns and retained rolling summaries
//! - [`SemanticIndex`]: embedding records with cosine search
//! - [`migrations`]: versioned schema upgrades run on open
//!
//! All repositories share one [`Database`] handle and therefore one lock.

pub mod database;
pub mod error;
pub mod messages;
pub mod migrations;
pub mod row_helpers;
pub mod semantic;
pub mod similarity;
pub mod timestamp;

pub use database::Database;
pub use error::StoreError;
pub use messages::{MessageLog, Summary, DEFAULT_KEEP_RECENT};
pub use semantic::{ScoredRecord, SearchOptions, SemanticIndex, SemanticRecord};
pub use similarity::cosine_similarity;
