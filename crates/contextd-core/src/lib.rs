//! Core library for contextd
//!
//! Everything the daemon needs that does not talk to an external process:
//!
//! - [`queue`]: the JSONL event log written by session hooks
//! - [`db`]: the SQLite knowledge store and its full-text index
//! - [`diff`]: unified-diff parsing, function chunking and import scanning
//! - [`similarity`]: TF-IDF near-duplicate detection
//! - [`scoring`] / [`context`]: relevance scoring and context block assembly

pub mod context;
pub mod db;
pub mod diff;
pub mod queue;
pub mod scoring;
pub mod similarity;
pub mod types;

pub use context::{ContextBlock, ContextBuilder, ContextLimits, ContextRequest};
pub use db::{error_signature, IndexDrift, KnowledgeStore};
pub use queue::EventQueue;
pub use similarity::{find_similar, SimilarMatch, DEFAULT_SIMILARITY_THRESHOLD};
pub use types::*;
