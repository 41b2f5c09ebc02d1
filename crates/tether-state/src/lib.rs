//! tether-state — embedded document store for the Tether service broker.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for services, service instances, and the app/team/user records
//! the broker reads and writes.
//!
//! # Architecture
//!
//! All documents are JSON-serialized into redb's `&[u8]` value columns and
//! keyed by their unique name (users by email).
//!
//! Mutations of set-valued fields (`apps`, `teams`, `env`) go through
//! `update_*` methods that read, modify, and write back a document inside a
//! single redb write transaction. redb admits one writer at a time, so these
//! updates are atomic with respect to each other and never lose writes.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{BoundWrite, SetChange, StateStore};
pub use types::*;
