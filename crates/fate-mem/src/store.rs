use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use fate_core::clock::MonotonicClock;
use fate_core::deferral::{filter_runnable, DeferralTracker, RunnableCandidate};
use fate_core::error::{FateError, Result};
use fate_core::id::{FateId, FateIdGenerator, UuidFateIdGenerator};
use fate_core::lock::{LockId, LockService};
use fate_core::status::{check_transition, TxStatus};
use fate_core::step::{ExceptionRecord, Step, TxInfoKey};
use fate_core::store::{
    FateStore, ReadOnlyFateStore, ReservedTx, TxFilter, TxSnapshot, TxSummary,
};

const DEFAULT_MAX_DEFERRED: usize = 10_000;
const RESERVE_RETRY: Duration = Duration::from_millis(20);

struct TxRecord<E: 'static> {
    status: TxStatus,
    stack: Vec<Arc<dyn Step<E>>>,
    tx_info: HashMap<TxInfoKey, Value>,
    exception: Option<ExceptionRecord>,
    reservation: Option<(LockId, u64)>,
    /// Monotonic per row; bumped on every reserve and on orphan recovery so
    /// stale handles observe `LostReservation`.
    serial: u64,
    deferred_until: Option<u64>,
    created: DateTime<Utc>,
}

impl<E: 'static> TxRecord<E> {
    fn new() -> Self {
        TxRecord {
            status: TxStatus::New,
            stack: Vec::new(),
            tx_info: HashMap::new(),
            exception: None,
            reservation: None,
            serial: 0,
            deferred_until: None,
            created: Utc::now(),
        }
    }

    fn fate_op(&self) -> Option<String> {
        self.tx_info
            .get(&TxInfoKey::FateOp)
            .and_then(Value::as_str)
            .map(str::to_owned)
    }
}

struct Inner<E: 'static> {
    rows: Mutex<BTreeMap<FateId, TxRecord<E>>>,
    deferrals: DeferralTracker,
    clock: MonotonicClock,
    lock_id: LockId,
    id_gen: Box<dyn FateIdGenerator>,
}

/// In-memory store. Cheap to clone; clones share the same rows.
pub struct MemFateStore<E: 'static> {
    inner: Arc<Inner<E>>,
}

impl<E: 'static> Clone for MemFateStore<E> {
    fn clone(&self) -> Self {
        MemFateStore {
            inner: self.inner.clone(),
        }
    }
}

impl<E: 'static> MemFateStore<E> {
    pub fn new(lock_id: LockId) -> Self {
        Self::with_max_deferred(lock_id, DEFAULT_MAX_DEFERRED)
    }

    pub fn with_max_deferred(lock_id: LockId, max_deferred: usize) -> Self {
        MemFateStore {
            inner: Arc::new(Inner {
                rows: Mutex::new(BTreeMap::new()),
                deferrals: DeferralTracker::new(max_deferred),
                clock: MonotonicClock::new(),
                lock_id,
                id_gen: Box::new(UuidFateIdGenerator),
            }),
        }
    }
}

impl<E: 'static> ReadOnlyFateStore<E> for MemFateStore<E> {
    fn status(&self, id: FateId) -> Result<TxStatus> {
        let rows = self.inner.rows.lock();
        Ok(rows.get(&id).map_or(TxStatus::Unknown, |row| row.status))
    }

    fn read(&self, id: FateId) -> Result<Option<TxSnapshot>> {
        let rows = self.inner.rows.lock();
        Ok(rows.get(&id).map(|row| TxSnapshot {
            id,
            status: row.status,
            created: row.created,
            stack: row.stack.iter().map(|s| s.name().to_owned()).collect(),
            tx_info: row.tx_info.clone(),
            exception: row.exception.clone(),
        }))
    }

    fn list(&self, filter: &TxFilter) -> Result<Vec<TxSummary>> {
        let rows = self.inner.rows.lock();
        Ok(rows
            .iter()
            .filter(|(_, row)| filter.matches(row.status, row.fate_op().as_deref()))
            .map(|(id, row)| TxSummary {
                id: *id,
                status: row.status,
                fate_op: row.fate_op(),
                created: row.created,
                reserved: row.reservation.is_some(),
                top_step: row.stack.last().map(|s| s.name().to_owned()),
            })
            .collect())
    }

    fn runnable(&self, keep_scanning: &(dyn Fn() -> bool + Sync)) -> Result<Vec<FateId>> {
        // The row scan itself honors keep_scanning, so a shutdown bounds
        // the cost of the scan and not just the filter below.
        let candidates: Vec<RunnableCandidate> = {
            let rows = self.inner.rows.lock();
            let mut candidates = Vec::new();
            for (id, row) in rows.iter() {
                if !keep_scanning() {
                    break;
                }
                candidates.push(RunnableCandidate {
                    id: *id,
                    status: row.status,
                    reserved: row.reservation.is_some(),
                    deferred_until: row.deferred_until,
                });
            }
            candidates
        };
        Ok(filter_runnable(
            &self.inner.deferrals,
            self.inner.clock.now_millis(),
            candidates,
            keep_scanning,
        ))
    }

    fn deferred_count(&self) -> usize {
        self.inner.deferrals.count()
    }

    fn is_deferred_overflow(&self) -> bool {
        self.inner.deferrals.is_overflow()
    }
}

impl<E: 'static> FateStore<E> for MemFateStore<E> {
    fn create(&self) -> Result<FateId> {
        let mut rows = self.inner.rows.lock();
        loop {
            let id = self.inner.id_gen.new_id();
            if let std::collections::btree_map::Entry::Vacant(entry) = rows.entry(id) {
                entry.insert(TxRecord::new());
                debug!(fate_id = %id, "created transaction");
                return Ok(id);
            }
        }
    }

    fn reserve(&self, id: FateId) -> Result<Box<dyn ReservedTx<E>>> {
        loop {
            if let Some(reserved) = self.try_reserve(id)? {
                return Ok(reserved);
            }
            thread::sleep(RESERVE_RETRY);
        }
    }

    fn try_reserve(&self, id: FateId) -> Result<Option<Box<dyn ReservedTx<E>>>> {
        let mut rows = self.inner.rows.lock();
        let row = rows.get_mut(&id).ok_or(FateError::NotFound(id))?;
        if row.reservation.is_some() {
            return Ok(None);
        }
        row.serial += 1;
        row.reservation = Some((self.inner.lock_id.clone(), row.serial));
        Ok(Some(Box::new(MemReservedTx {
            inner: self.inner.clone(),
            id,
            serial: row.serial,
            deleted: false,
        })))
    }

    fn recover_orphans(&self, locks: &dyn LockService) -> Result<usize> {
        let mut rows = self.inner.rows.lock();
        let mut recovered = 0;
        for (id, row) in rows.iter_mut() {
            if let Some((owner, _)) = &row.reservation {
                if !locks.is_live(owner) {
                    debug!(fate_id = %id, owner = %owner, "clearing orphaned reservation");
                    row.reservation = None;
                    row.serial += 1;
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "recovered orphaned reservations");
        }
        Ok(recovered)
    }
}

struct MemReservedTx<E: 'static> {
    inner: Arc<Inner<E>>,
    id: FateId,
    serial: u64,
    deleted: bool,
}

impl<E: 'static> MemReservedTx<E> {
    fn with_row<T>(&self, f: impl FnOnce(&mut TxRecord<E>) -> Result<T>) -> Result<T> {
        if self.deleted {
            return Err(FateError::Deleted(self.id));
        }
        let mut rows = self.inner.rows.lock();
        let row = rows.get_mut(&self.id).ok_or(FateError::Deleted(self.id))?;
        match &row.reservation {
            Some((owner, serial))
                if *owner == self.inner.lock_id && *serial == self.serial =>
            {
                f(row)
            }
            _ => Err(FateError::LostReservation(self.id)),
        }
    }
}

impl<E: 'static> ReservedTx<E> for MemReservedTx<E> {
    fn id(&self) -> FateId {
        self.id
    }

    fn status(&self) -> Result<TxStatus> {
        self.with_row(|row| Ok(row.status))
    }

    fn set_status(&mut self, status: TxStatus) -> Result<()> {
        let id = self.id;
        self.with_row(|row| {
            check_transition(id, row.status, status)?;
            debug!(fate_id = %id, from = %row.status, to = %status, "status change");
            row.status = status;
            // A status change supersedes any pending deferral.
            row.deferred_until = None;
            Ok(())
        })
    }

    fn top(&self) -> Result<Option<Arc<dyn Step<E>>>> {
        self.with_row(|row| Ok(row.stack.last().cloned()))
    }

    fn stack_len(&self) -> Result<usize> {
        self.with_row(|row| Ok(row.stack.len()))
    }

    fn push(&mut self, step: Arc<dyn Step<E>>) -> Result<()> {
        self.with_row(|row| {
            row.stack.push(step);
            Ok(())
        })
    }

    fn pop(&mut self) -> Result<()> {
        let id = self.id;
        self.with_row(|row| {
            row.stack
                .pop()
                .map(|_| ())
                .ok_or_else(|| FateError::InvalidState(format!("pop on empty stack for {id}")))
        })
    }

    fn tx_info(&self, key: TxInfoKey) -> Result<Option<Value>> {
        self.with_row(|row| Ok(row.tx_info.get(&key).cloned()))
    }

    fn set_tx_info(&mut self, key: TxInfoKey, value: Value) -> Result<()> {
        self.with_row(|row| {
            row.tx_info.insert(key, value);
            Ok(())
        })
    }

    fn set_exception(&mut self, record: ExceptionRecord) -> Result<()> {
        self.with_row(|row| {
            row.exception = Some(record);
            Ok(())
        })
    }

    fn defer(&mut self, delay: Duration) -> Result<()> {
        let deadline = self.inner.clock.deadline_after(delay);
        self.with_row(|row| {
            row.deferred_until = Some(deadline);
            Ok(())
        })?;
        if !self.inner.deferrals.defer(self.id, deadline) {
            // Overflow: every pending deferral is woken early, durably.
            let mut rows = self.inner.rows.lock();
            for row in rows.values_mut() {
                row.deferred_until = None;
            }
        }
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        if self.deleted {
            return Err(FateError::Deleted(self.id));
        }
        let mut rows = self.inner.rows.lock();
        let row = rows.get(&self.id).ok_or(FateError::Deleted(self.id))?;
        match &row.reservation {
            Some((owner, serial))
                if *owner == self.inner.lock_id && *serial == self.serial =>
            {
                rows.remove(&self.id);
                self.deleted = true;
                self.inner.deferrals.remove(self.id);
                debug!(fate_id = %self.id, "deleted transaction");
                Ok(())
            }
            _ => Err(FateError::LostReservation(self.id)),
        }
    }
}

impl<E: 'static> Drop for MemReservedTx<E> {
    fn drop(&mut self) {
        if self.deleted {
            return;
        }
        let mut rows = self.inner.rows.lock();
        if let Some(row) = rows.get_mut(&self.id) {
            if matches!(&row.reservation, Some((owner, serial))
                if *owner == self.inner.lock_id && *serial == self.serial)
            {
                row.reservation = None;
            }
        }
    }
}
