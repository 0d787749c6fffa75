//! FATE: fault-tolerant asynchronous transaction executor
//!
//! FATE drives multi-step administrative operations through a chain of
//! idempotent steps held in a durable store. Transactions survive process
//! crashes and resume automatically; a failed step triggers reverse-order
//! compensation; steps that are not ready are deferred durably instead of
//! busy-waiting.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fate::{Fate, FateConfig, FateStore, LockService, ProcessLockService, Step, TxStatus};
//! use fate_mem::MemFateStore;
//!
//! # struct Announce;
//! # impl Step<()> for Announce {
//! #     fn name(&self) -> &str { "Announce" }
//! #     fn is_ready(&self, _: fate::FateId, _: &()) -> anyhow::Result<Duration> { Ok(Duration::ZERO) }
//! #     fn call(&self, _: fate::FateId, _: &()) -> anyhow::Result<Option<Box<dyn Step<()>>>> { Ok(None) }
//! #     fn undo(&self, _: fate::FateId, _: &()) -> anyhow::Result<()> { Ok(()) }
//! # }
//! # fn main() -> fate::Result<()> {
//! let locks = ProcessLockService::new();
//! let store: Arc<dyn FateStore<()>> = Arc::new(MemFateStore::new(locks.lock_id().clone()));
//! let engine = Fate::new((), store, &locks, FateConfig::default())?;
//!
//! let id = engine.start_transaction()?;
//! engine.seed_transaction("announce", id, Box::new(Announce), true, "say hello")?;
//! assert_ne!(engine.wait_for_completion(id)?, TxStatus::Failed);
//! engine.shutdown(Duration::from_secs(10));
//! # Ok(())
//! # }
//! ```

pub mod config;
mod executor;
#[allow(clippy::module_inception)]
mod fate;

// Re-export the core vocabulary so embedders depend on one crate.
pub use fate_core::{
    check_transition, DeferralTracker, ExceptionRecord, FailurePhase, FateError, FateId,
    FateIdGenerator, FateStore, LockId, LockService, MonotonicClock, ProcessLockService,
    ReadOnlyFateStore, ReservedTx, Result, Step, StepRegistry, TxFilter, TxInfoKey, TxSnapshot,
    TxStatus, TxSummary, UuidFateIdGenerator,
};

pub use config::FateConfig;
pub use executor::ShutdownSignal;
pub use fate::Fate;
