//! SQLite-backed durable FATE store
//!
//! Persists one row per transaction plus its step stack and tx-info map.
//! Every mutation through a reservation handle runs inside a SQLite
//! transaction that first re-checks the `(owner lock, serial)` tuple, so a
//! handle whose process was declared dead observes `LostReservation` and a
//! handle whose row is gone observes `Deleted`; there are no partial
//! writes. Stack order, deferral deadlines, and the monotonic clock floor
//! all survive restarts.

mod schema;
mod store;

pub use store::{SqliteFateStore, SqliteStoreConfig};
