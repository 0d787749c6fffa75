//! In-memory FATE store backend
//!
//! Implements the full store contract - reservations with owner/serial
//! guards, write-after-delete rejection, deferral tracking with overflow -
//! without persistence. Steps are held as trait objects, so no
//! serialization round-trip is involved; this is the reference backend for
//! engine tests and for embeddings that do not need durability.

mod store;

pub use store::MemFateStore;
