//! The durable-store contract.
//!
//! A store persists one row per transaction: status, step stack, tx info,
//! exception record, deferral deadline, and the reservation tuple. Rows are
//! mutated only through a [`ReservedTx`] handle, which every write guards
//! with the `(lock id, serial)` pair it was issued under; a handle whose
//! row was deleted fails `Deleted`, and one whose reservation was taken
//! over by a newer owner fails `LostReservation`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::id::FateId;
use crate::lock::LockService;
use crate::status::TxStatus;
use crate::step::{ExceptionRecord, Step, TxInfoKey};

/// Constraints for `list`. An empty filter matches every row.
#[derive(Debug, Clone, Default)]
pub struct TxFilter {
    pub statuses: Option<Vec<TxStatus>>,
    pub fate_op: Option<String>,
}

impl TxFilter {
    pub fn all() -> Self {
        TxFilter::default()
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = TxStatus>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    pub fn with_fate_op(mut self, fate_op: impl Into<String>) -> Self {
        self.fate_op = Some(fate_op.into());
        self
    }

    pub fn matches(&self, status: TxStatus, fate_op: Option<&str>) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&status) {
                return false;
            }
        }
        if let Some(wanted) = &self.fate_op {
            if fate_op != Some(wanted.as_str()) {
                return false;
            }
        }
        true
    }
}

/// One row of an administrative listing.
#[derive(Debug, Clone, Serialize)]
pub struct TxSummary {
    pub id: FateId,
    pub status: TxStatus,
    pub fate_op: Option<String>,
    pub created: DateTime<Utc>,
    pub reserved: bool,
    pub top_step: Option<String>,
}

/// Point-in-time view of a single row. Consistent per row; two snapshots
/// taken in one `list` call may straddle concurrent writes.
#[derive(Debug, Clone)]
pub struct TxSnapshot {
    pub id: FateId,
    pub status: TxStatus,
    pub created: DateTime<Utc>,
    /// Step names, bottom of the stack first.
    pub stack: Vec<String>,
    pub tx_info: HashMap<TxInfoKey, Value>,
    pub exception: Option<ExceptionRecord>,
}

impl TxSnapshot {
    pub fn fate_op(&self) -> Option<&str> {
        self.tx_info.get(&TxInfoKey::FateOp).and_then(Value::as_str)
    }

    pub fn auto_clean(&self) -> bool {
        self.tx_info
            .get(&TxInfoKey::AutoClean)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn return_value(&self) -> Option<&Value> {
        self.tx_info.get(&TxInfoKey::ReturnValue)
    }
}

/// Read-only store operations; no reservation required.
pub trait ReadOnlyFateStore<E: 'static>: Send + Sync {
    /// Status of `id`; `Unknown` when no row exists.
    fn status(&self, id: FateId) -> Result<TxStatus>;

    /// Snapshot of `id`, or `None` when no row exists.
    fn read(&self, id: FateId) -> Result<Option<TxSnapshot>>;

    /// Filtered listing over all rows. Finite and eager; each returned
    /// row is self-consistent but the set as a whole is not a snapshot.
    fn list(&self, filter: &TxFilter) -> Result<Vec<TxSummary>>;

    /// One scan pass over claimable work. Yields each eligible id at most
    /// once; ids deferred to a future deadline are withheld unless the
    /// deferred map has overflowed. Implementations consult
    /// `keep_scanning` while walking the underlying rows, so it bounds
    /// the cost of the scan itself, not just the post-fetch filter.
    fn runnable(&self, keep_scanning: &(dyn Fn() -> bool + Sync)) -> Result<Vec<FateId>>;

    /// Current size of the deferred map.
    fn deferred_count(&self) -> usize;

    /// Whether the deferred map has overflowed and deadlines are being
    /// ignored.
    fn is_deferred_overflow(&self) -> bool;
}

/// Full store contract.
pub trait FateStore<E: 'static>: ReadOnlyFateStore<E> {
    /// Allocate a fresh id and insert its row at `New`. Retries internally
    /// on id collision.
    fn create(&self) -> Result<FateId>;

    /// Reserve `id`, blocking while another owner holds it. Reserving an
    /// unknown id is a contract violation and fails `NotFound`.
    fn reserve(&self, id: FateId) -> Result<Box<dyn ReservedTx<E>>>;

    /// Non-blocking reserve: `None` when another owner holds the row.
    fn try_reserve(&self, id: FateId) -> Result<Option<Box<dyn ReservedTx<E>>>>;

    /// Clear reservations whose owner is no longer live, making the rows
    /// claimable again. Returns how many rows were recovered. Called once
    /// at process startup.
    fn recover_orphans(&self, locks: &dyn LockService) -> Result<usize>;
}

/// Exclusive handle on one row. Dropping the handle releases the
/// reservation (unless the row was deleted through it).
pub trait ReservedTx<E: 'static>: Send {
    fn id(&self) -> FateId;

    fn status(&self) -> Result<TxStatus>;

    /// Write a new status. Illegal transitions fail `WrongStatus` without
    /// writing.
    fn set_status(&mut self, status: TxStatus) -> Result<()>;

    /// The step currently on top of the stack.
    fn top(&self) -> Result<Option<Arc<dyn Step<E>>>>;

    fn stack_len(&self) -> Result<usize>;

    fn push(&mut self, step: Arc<dyn Step<E>>) -> Result<()>;

    /// Pop the top step. Popping an empty stack fails `InvalidState`.
    fn pop(&mut self) -> Result<()>;

    fn tx_info(&self, key: TxInfoKey) -> Result<Option<Value>>;

    fn set_tx_info(&mut self, key: TxInfoKey, value: Value) -> Result<()>;

    fn set_exception(&mut self, record: ExceptionRecord) -> Result<()>;

    /// Persist a deferral deadline `delay` from now and register it with
    /// the deferred map. The reservation should be dropped afterwards so
    /// the row can be claimed once the deadline passes.
    fn defer(&mut self, delay: Duration) -> Result<()>;

    /// Remove the row. Every subsequent operation on this handle fails
    /// `Deleted`.
    fn delete(&mut self) -> Result<()>;
}

impl<E: 'static> std::fmt::Debug for dyn ReservedTx<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedTx").field("id", &self.id()).finish()
    }
}
