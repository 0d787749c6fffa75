//! Public API of the transaction engine.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use fate_core::error::{FateError, Result};
use fate_core::id::FateId;
use fate_core::lock::LockService;
use fate_core::status::TxStatus;
use fate_core::step::{ExceptionRecord, FailurePhase, Step, TxInfoKey};
use fate_core::store::{FateStore, TxFilter, TxSummary};

use crate::config::FateConfig;
use crate::executor::{Executor, ShutdownSignal};

const WAIT_POLL: Duration = Duration::from_millis(50);

/// The engine: seeds transactions into a [`FateStore`] and runs a worker
/// pool that drives them to a terminal status, compensating on failure.
///
/// `E` is the embedder-defined environment handed to every step
/// invocation.
pub struct Fate<E: Send + Sync + 'static> {
    store: Arc<dyn FateStore<E>>,
    executor: Executor<E>,
}

impl<E: Send + Sync + 'static> Fate<E> {
    /// Start the engine.
    ///
    /// Reservations stamped by lock ids that `locks` no longer considers
    /// live are cleared first, so work orphaned by a crashed process is
    /// claimable before the first worker polls. Workers begin polling
    /// after `config.poll_initial_delay`.
    pub fn new(
        env: E,
        store: Arc<dyn FateStore<E>>,
        locks: &dyn LockService,
        config: FateConfig,
    ) -> Result<Self> {
        let recovered = store.recover_orphans(locks)?;
        info!(
            workers = config.worker_pool_size,
            recovered, "starting fate engine"
        );
        let executor = Executor::start(store.clone(), Arc::new(env), config);
        Ok(Fate { store, executor })
    }

    /// Allocate a transaction id. The row starts at `NEW` and runs nothing
    /// until seeded.
    pub fn start_transaction(&self) -> Result<FateId> {
        self.store.create()
    }

    /// Seed a `NEW` transaction: push its initial step, record the
    /// operation tag and reason, and submit it for execution.
    ///
    /// Returns `Ok(true)` when this call seeded the transaction,
    /// `Ok(false)` when it was an identical repeat of an earlier seed or
    /// the transaction was cancelled before seeding. A repeat seed with
    /// different arguments fails `WrongStatus`.
    pub fn seed_transaction(
        &self,
        fate_op: impl Into<String>,
        id: FateId,
        step: Box<dyn Step<E>>,
        auto_clean: bool,
        reason: impl Into<String>,
    ) -> Result<bool> {
        let fate_op = fate_op.into();
        let reason = reason.into();
        let mut tx = self.store.reserve(id)?;
        match tx.status()? {
            TxStatus::New => {
                if tx.stack_len()? == 0 {
                    tx.push(Arc::from(step))?;
                }
                tx.set_tx_info(TxInfoKey::FateOp, Value::String(fate_op.clone()))?;
                tx.set_tx_info(TxInfoKey::AutoClean, Value::Bool(auto_clean))?;
                tx.set_tx_info(TxInfoKey::Reason, Value::String(reason))?;
                tx.set_status(TxStatus::Submitted)?;
                info!(fate_id = %id, fate_op, "seeded transaction");
                Ok(true)
            }
            TxStatus::Submitted => {
                let identical = tx.tx_info(TxInfoKey::FateOp)? == Some(Value::String(fate_op))
                    && tx.tx_info(TxInfoKey::Reason)? == Some(Value::String(reason))
                    && tx.tx_info(TxInfoKey::AutoClean)? == Some(Value::Bool(auto_clean))
                    && tx.top()?.map(|s| s.name().to_owned()) == Some(step.name().to_owned());
                if identical {
                    debug!(fate_id = %id, "ignoring repeated identical seed");
                    Ok(false)
                } else {
                    Err(FateError::wrong_status(id, "NEW", TxStatus::Submitted))
                }
            }
            // Cancelled before seeding; the cancellation wins and the step
            // never runs.
            TxStatus::FailedInProgress | TxStatus::Failed => Ok(false),
            other => Err(FateError::wrong_status(id, "NEW", other)),
        }
    }

    /// Cancel a transaction that has not been claimed by the executor.
    ///
    /// Returns `true` if the transaction is (or now will be) dead:
    /// cancelled by this call, already failed, already finished, or
    /// unknown. Returns `false` once the executor holds the reservation or
    /// execution is in progress.
    pub fn cancel(&self, id: FateId) -> Result<bool> {
        loop {
            match self.store.status(id)? {
                TxStatus::Unknown
                | TxStatus::Successful
                | TxStatus::Failed
                | TxStatus::FailedInProgress => return Ok(true),
                TxStatus::InProgress => {
                    debug!(fate_id = %id, "cancel refused, transaction is running");
                    return Ok(false);
                }
                TxStatus::New | TxStatus::Submitted => {
                    match self.store.try_reserve(id) {
                        Ok(Some(mut tx)) => {
                            let status = tx.status()?;
                            if matches!(status, TxStatus::New | TxStatus::Submitted) {
                                tx.set_exception(ExceptionRecord::new(
                                    "cancel",
                                    FailurePhase::Cancelled,
                                    format!("transaction cancelled by user while {status}"),
                                ))?;
                                tx.set_status(TxStatus::FailedInProgress)?;
                                info!(fate_id = %id, "cancelled transaction");
                                return Ok(true);
                            }
                            // Status moved while we reserved; look again.
                        }
                        Ok(None) => {
                            debug!(fate_id = %id, "cancel refused, transaction is reserved");
                            return Ok(false);
                        }
                        Err(FateError::NotFound(_)) => return Ok(true),
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Block until the transaction reaches a terminal status (or its row
    /// disappears through auto-clean / delete) and return that status.
    pub fn wait_for_completion(&self, id: FateId) -> Result<TxStatus> {
        loop {
            let status = self.store.status(id)?;
            if status.is_terminal() || status == TxStatus::Unknown {
                return Ok(status);
            }
            if self.executor.is_shutdown() {
                return Err(FateError::Interrupted);
            }
            thread::sleep(WAIT_POLL);
        }
    }

    /// Current status; `Unknown` when no row exists.
    pub fn get_status(&self, id: FateId) -> Result<TxStatus> {
        self.store.status(id)
    }

    /// The failure that sent the transaction down the compensation path,
    /// if any.
    pub fn get_exception(&self, id: FateId) -> Result<Option<ExceptionRecord>> {
        Ok(self.store.read(id)?.and_then(|snapshot| snapshot.exception))
    }

    /// Success payload of a completed transaction.
    pub fn get_return_value(&self, id: FateId) -> Result<Option<Value>> {
        Ok(self
            .store
            .read(id)?
            .and_then(|snapshot| snapshot.return_value().cloned()))
    }

    /// Administrative listing.
    pub fn list(&self, filter: &TxFilter) -> Result<Vec<TxSummary>> {
        self.store.list(filter)
    }

    /// Remove a transaction in a terminal status; afterwards its status
    /// reads `Unknown`.
    pub fn delete(&self, id: FateId) -> Result<()> {
        let mut tx = self.store.reserve(id)?;
        let status = tx.status()?;
        if !status.is_terminal() {
            return Err(FateError::wrong_status(id, "a terminal status", status));
        }
        tx.delete()
    }

    /// Change the worker pool size; applied between loop iterations, never
    /// mid-step.
    pub fn resize_pool(&self, workers: usize) {
        self.executor.resize(workers);
    }

    pub fn worker_count(&self) -> usize {
        self.executor.worker_target()
    }

    /// Handle embedders can thread into their environment so steps observe
    /// shutdown.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.executor.shutdown_signal()
    }

    /// Read access to the underlying store.
    pub fn store(&self) -> &Arc<dyn FateStore<E>> {
        &self.store
    }

    /// Stop taking new work, wait up to `grace` for in-flight steps, then
    /// detach whatever is still running.
    pub fn shutdown(&self, grace: Duration) {
        self.executor.shutdown(grace);
    }
}
