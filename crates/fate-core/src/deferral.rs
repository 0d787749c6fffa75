//! Deferred-transaction bookkeeping shared by store backends.
//!
//! Deferral deadlines themselves are durable (they live in the row); this
//! tracker is the in-memory view that enforces the `max_deferred` cap. When
//! a deferral would exceed the cap the tracker flips the overflow flag and
//! clears itself; while the flag is set, the runnable filter ignores all
//! deadlines so deferred transactions wake early instead of starving new
//! arrivals. The flag clears at the end of the first scan pass that leaves
//! the map empty.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::info;

use crate::id::FateId;
use crate::status::TxStatus;

pub struct DeferralTracker {
    max_deferred: usize,
    deferred: Mutex<HashMap<FateId, u64>>,
    overflow: AtomicBool,
}

impl DeferralTracker {
    pub fn new(max_deferred: usize) -> Self {
        DeferralTracker {
            max_deferred,
            deferred: Mutex::new(HashMap::new()),
            overflow: AtomicBool::new(false),
        }
    }

    /// Record a deferral. Returns `false` if the map was full, in which
    /// case the overflow flag is now set and the map has been cleared; the
    /// caller must then also clear its stored deadlines so the early wake
    /// survives a restart.
    pub fn defer(&self, id: FateId, deadline_millis: u64) -> bool {
        let mut deferred = self.deferred.lock();
        if deferred.len() >= self.max_deferred {
            info!(
                max_deferred = self.max_deferred,
                "deferred map is full, switching to overflow: all deferrals run early"
            );
            self.overflow.store(true, Ordering::SeqCst);
            deferred.clear();
            false
        } else {
            deferred.insert(id, deadline_millis);
            true
        }
    }

    pub fn remove(&self, id: FateId) {
        self.deferred.lock().remove(&id);
    }

    pub fn count(&self) -> usize {
        self.deferred.lock().len()
    }

    pub fn is_overflow(&self) -> bool {
        self.overflow.load(Ordering::SeqCst)
    }

    /// Snapshot the overflow flag at the start of a scan pass.
    fn begin_pass(&self) -> bool {
        self.overflow.load(Ordering::SeqCst)
    }

    /// Close out a scan pass: if the pass started in overflow and the map
    /// drained, the backlog has been flushed and deadlines apply again.
    fn finish_pass(&self, overflow_at_start: bool) {
        if overflow_at_start && self.deferred.lock().is_empty() {
            self.overflow.store(false, Ordering::SeqCst);
        }
    }
}

/// One row as seen by a runnable scan.
#[derive(Debug, Clone, Copy)]
pub struct RunnableCandidate {
    pub id: FateId,
    pub status: TxStatus,
    pub reserved: bool,
    pub deferred_until: Option<u64>,
}

/// The runnable filter both store backends share.
///
/// Yields ids whose status is claimable and whose stored deadline has
/// passed, each at most once per pass. Currently-reserved rows are skipped;
/// `keep_scanning` is consulted between rows so a shutdown aborts the scan
/// promptly.
pub fn filter_runnable<I>(
    tracker: &DeferralTracker,
    now_millis: u64,
    candidates: I,
    keep_scanning: &(dyn Fn() -> bool + Sync),
) -> Vec<FateId>
where
    I: IntoIterator<Item = RunnableCandidate>,
{
    let overflow = tracker.begin_pass();
    let mut runnable = Vec::new();

    for candidate in candidates {
        if !keep_scanning() {
            break;
        }
        if candidate.reserved || !candidate.status.is_runnable() {
            continue;
        }
        match candidate.deferred_until {
            Some(deadline) if deadline > now_millis && !overflow => continue,
            _ => {
                tracker.remove(candidate.id);
                runnable.push(candidate.id);
            }
        }
    }

    tracker.finish_pass(overflow);
    runnable
}
