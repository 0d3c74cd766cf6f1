//! Durable storage layer for Cinder.
//!
//! Three pieces: the versioned record [`codec`] (concurrent batch
//! encode/decode), the append-only [`store`] implementing the `TaskDb` /
//! `JobDb` ports with optimistic concurrency, and the mutex-guarded
//! [`cache`] projection keyed by (repo, commit).

pub mod cache;
pub mod codec;
pub mod store;

pub use cache::{JobCache, TaskCache};
pub use codec::Codec;
pub use store::LogDb;
