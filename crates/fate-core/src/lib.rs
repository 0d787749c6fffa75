//! FATE core: traits and types for the fault-tolerant transaction engine
//!
//! This crate defines the abstractions shared by the store backends and the
//! executor:
//! - `Step`: the unit-of-work capability (readiness probe, action,
//!   compensation, return value) plus the opaque serialization seam
//! - `FateStore` / `ReservedTx`: the durable-store contract with
//!   reservation-guarded mutation
//! - `TxStatus` and the legal-transition table
//! - The deferral tracker with overflow backpressure
//! - Lock identity for crash-orphan recovery
//! - Monotonic scheduling time
//!
//! Backends live in `fate-mem` and `fate-sqlite`; the engine lives in
//! `fate`.

pub mod clock;
pub mod deferral;
pub mod error;
pub mod id;
pub mod lock;
pub mod status;
pub mod step;
pub mod store;

pub use clock::MonotonicClock;
pub use deferral::{filter_runnable, DeferralTracker, RunnableCandidate};
pub use error::{FateError, Result};
pub use id::{FateId, FateIdGenerator, UuidFateIdGenerator};
pub use lock::{LockId, LockService, ProcessLockService};
pub use status::{check_transition, TxStatus};
pub use step::{ExceptionRecord, FailurePhase, Step, StepRegistry, TxInfoKey};
pub use store::{FateStore, ReadOnlyFateStore, ReservedTx, TxFilter, TxSnapshot, TxSummary};
