//! Durable progress records and the challenge catalog.

pub mod catalog;
pub mod progress;

/// Challenge manifest loader mapping ids to on-disk directories.
pub use catalog::{ChallengeCatalog, ChallengeMeta};
/// SQLite-backed attempt/solve store.
pub use progress::ProgressStore;
