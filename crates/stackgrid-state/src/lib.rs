//! stackgrid-state: embedded state store for stackgrid.
//!
//! Backed by [redb](https://docs.rs/redb), persists service nodes,
//! dependency edges, detection runs, and versioned graph snapshots, on disk
//! or in memory.
//!
//! Values are JSON in redb's `&[u8]` columns under `{workspace}/...` keys.
//! The `StateStore` is `Clone + Send + Sync` (an `Arc<Database>`) and can be
//! shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
