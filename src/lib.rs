//! Silt - embedded distributed-SCM engine
//!
//! A library-level source-control engine: repositories and checkouts are
//! SQLite databases, immutable content blobs are addressed by cryptographic
//! hash, and history is described by "structural artifacts" parsed from a
//! line/card text grammar.
//!
//! # Architecture
//!
//! Silt layers a **blob store + artifact model + crosslinker** over SQLite:
//!
//! - **Blob store**: content-addressed rows with zlib framing and delta
//!   chains between related versions
//! - **Decks**: parsed structural artifacts (checkins, wiki pages, tags,
//!   tickets, forum posts) with strict card grammar and Z-card self-hash
//! - **Crosslinker**: materializes relational views (timeline, per-file
//!   history, tags, leaves) from the artifact set; fully rebuildable
//! - **Checkout engine**: vfile state machine, change scanning, extract,
//!   and three-way update over a working directory
//!
//! # Entry points
//!
//! Everything hangs off a [`Fossil`] context: open or create a repository
//! via [`repo`], store bytes via [`blob`], build artifacts via [`deck`],
//! and drive working directories via [`checkout`].

#![deny(clippy::all)]

// Core modules
pub mod constants;
pub mod error;
pub mod hash;
pub mod util;

// Codec layer
pub mod delta;
pub mod merge3;

// Storage layer
pub mod blob;
pub mod cache;
pub mod db;

// Artifact layer
pub mod deck;
pub mod xlink;

// Lifecycle & working-directory layer
pub mod checkout;
pub mod context;
pub mod repo;
pub mod resolver;

// Re-export commonly used items
pub use context::{ConfirmEvent, ConfirmEventId, ConfirmResponse, Fossil};
pub use error::{ErrorKind, Result, SiltError};

/// Engine version.
pub fn version() -> &'static str {
  env!("CARGO_PKG_VERSION")
}
