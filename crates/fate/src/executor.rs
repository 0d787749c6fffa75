//! Worker pool driving transactions through their step stacks.
//!
//! Each worker loops: scan the store for runnable ids, claim one with
//! `try_reserve`, and drive it until it defers, fails, or reaches a
//! terminal status. The reservation protocol is the only cross-worker
//! exclusion; a claim that is lost mid-flight (`LostReservation` /
//! `Deleted`) simply abandons the iteration.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use fate_core::error::{FateError, Result};
use fate_core::status::TxStatus;
use fate_core::step::{ExceptionRecord, FailurePhase, TxInfoKey};
use fate_core::store::{FateStore, ReservedTx};

use crate::config::FateConfig;

const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Cloneable shutdown flag.
///
/// The engine flips it when `shutdown` is called. Embedders that want
/// long-running steps to yield promptly can thread a clone into their step
/// environment and return an error once it trips; that takes the ordinary
/// failure/compensation path.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Sleep up to `total`, waking early if shutdown triggers. Returns
    /// `false` when interrupted.
    pub fn sleep(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.is_shutdown() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }
}

/// Exponential idle backoff: `min * 2^k` capped at `max`, reset whenever a
/// claim led to actual work.
struct IdleBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    fn new(min: Duration, max: Duration) -> Self {
        IdleBackoff {
            min,
            max,
            current: min,
        }
    }

    fn reset(&mut self) {
        self.current = self.min;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

struct Shared<E: Send + Sync + 'static> {
    store: Arc<dyn FateStore<E>>,
    env: Arc<E>,
    config: FateConfig,
    shutdown: ShutdownSignal,
    target_workers: AtomicUsize,
    live_workers: AtomicUsize,
}

pub(crate) struct Executor<E: Send + Sync + 'static> {
    shared: Arc<Shared<E>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<E: Send + Sync + 'static> Executor<E> {
    pub fn start(store: Arc<dyn FateStore<E>>, env: Arc<E>, config: FateConfig) -> Self {
        let target = config.worker_pool_size;
        let executor = Executor {
            shared: Arc::new(Shared {
                store,
                env,
                config,
                shutdown: ShutdownSignal::new(),
                target_workers: AtomicUsize::new(target),
                live_workers: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        };
        executor.spawn_to_target();
        executor
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shared.shutdown.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.is_shutdown()
    }

    pub fn worker_target(&self) -> usize {
        self.shared.target_workers.load(Ordering::SeqCst)
    }

    /// Change the worker pool size. Growth spawns workers immediately;
    /// shrinking takes effect as workers reach the top of their loop, never
    /// mid-step.
    pub fn resize(&self, workers: usize) {
        self.shared.target_workers.store(workers, Ordering::SeqCst);
        info!(workers, "worker pool resized");
        self.spawn_to_target();
    }

    /// Stop intake, wait up to `grace` for in-flight steps, then detach
    /// whatever is still running.
    pub fn shutdown(&self, grace: Duration) {
        self.shared.shutdown.trigger();
        info!("fate executor shutting down");
        let deadline = Instant::now() + grace;
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("fate worker still running at shutdown deadline, detaching");
            }
        }
    }

    fn spawn_to_target(&self) {
        let mut workers = self.workers.lock();
        workers.retain(|handle| !handle.is_finished());
        while self.shared.live_workers.load(Ordering::SeqCst)
            < self.shared.target_workers.load(Ordering::SeqCst)
        {
            if self.shared.shutdown.is_shutdown() {
                return;
            }
            self.shared.live_workers.fetch_add(1, Ordering::SeqCst);
            let shared = self.shared.clone();
            let spawned = thread::Builder::new()
                .name("fate-worker".into())
                .spawn(move || worker_loop(shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    self.shared.live_workers.fetch_sub(1, Ordering::SeqCst);
                    error!(error = %e, "failed to spawn fate worker");
                    return;
                }
            }
        }
    }
}

impl<E: Send + Sync + 'static> Drop for Executor<E> {
    fn drop(&mut self) {
        // Idempotent: after an explicit shutdown the worker list is empty.
        self.shutdown(self.shared.config.shutdown_grace);
    }
}

/// If the pool shrank, one worker claims the right to exit by decrementing
/// the live counter.
fn claim_resize_exit<E: Send + Sync + 'static>(shared: &Shared<E>) -> bool {
    loop {
        let live = shared.live_workers.load(Ordering::SeqCst);
        let target = shared.target_workers.load(Ordering::SeqCst);
        if live <= target {
            return false;
        }
        if shared
            .live_workers
            .compare_exchange(live, live - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
    }
}

fn worker_loop<E: Send + Sync + 'static>(shared: Arc<Shared<E>>) {
    debug!("fate worker started");
    shared.shutdown.sleep(shared.config.poll_initial_delay);

    let mut backoff = IdleBackoff::new(
        shared.config.poll_min_interval,
        shared.config.poll_max_interval,
    );
    let mut resized_away = false;

    while !shared.shutdown.is_shutdown() {
        if claim_resize_exit(&shared) {
            resized_away = true;
            break;
        }

        let runnable = shared
            .store
            .runnable(&|| !shared.shutdown.is_shutdown());
        let ids = match runnable {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "runnable scan failed");
                shared.shutdown.sleep(backoff.next_delay());
                continue;
            }
        };

        let mut did_work = false;
        for id in ids {
            if shared.shutdown.is_shutdown() {
                break;
            }
            match shared.store.try_reserve(id) {
                Ok(Some(tx)) => match run_transaction(tx, &shared) {
                    // A claim-and-release of an unseeded row is not work;
                    // it must not reset the idle pacing.
                    Ok(worked) => did_work |= worked,
                    Err(e) => {
                        if e.is_reservation_loss() {
                            debug!(fate_id = %id, error = %e, "abandoning claim");
                        } else {
                            error!(fate_id = %id, error = %e, "error driving transaction");
                        }
                    }
                },
                Ok(None) => {}
                // Deleted between the scan and the claim.
                Err(FateError::NotFound(_)) => {}
                Err(e) => warn!(fate_id = %id, error = %e, "reservation attempt failed"),
            }
        }

        if did_work {
            backoff.reset();
        } else {
            shared.shutdown.sleep(backoff.next_delay());
        }
    }

    if !resized_away {
        shared.live_workers.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("fate worker exiting");
}

/// Drive one claimed transaction as far as it will go under this
/// reservation. Returns when the transaction defers, fails, reaches a
/// terminal status, or turns out not to be seeded yet; dropping the handle
/// releases the reservation.
///
/// The returned bool reports whether the claim performed any work; a bare
/// claim-and-release of an unseeded (or already-terminal, non-auto-clean)
/// row reports `false` so it does not reset the caller's idle pacing.
fn run_transaction<E: Send + Sync + 'static>(
    mut tx: Box<dyn ReservedTx<E>>,
    shared: &Shared<E>,
) -> Result<bool> {
    let id = tx.id();
    let mut worked = false;
    loop {
        match tx.status()? {
            // Not seeded yet; nothing to run.
            TxStatus::New | TxStatus::Unknown => return Ok(worked),
            TxStatus::Submitted => {
                tx.set_status(TxStatus::InProgress)?;
                worked = true;
            }
            TxStatus::InProgress => {
                worked = true;
                let Some(step) = tx.top()? else {
                    // Stack drained by pops: normal completion.
                    tx.set_status(TxStatus::Successful)?;
                    continue;
                };
                let delay = match step.is_ready(id, shared.env.as_ref()) {
                    Ok(delay) => delay,
                    Err(e) => {
                        fail_transaction(&mut tx, step.name(), FailurePhase::IsReady, e)?;
                        return Ok(true);
                    }
                };
                if !delay.is_zero() {
                    debug!(fate_id = %id, step = step.name(), ?delay, "step not ready, deferring");
                    tx.defer(delay)?;
                    return Ok(true);
                }
                debug!(fate_id = %id, step = step.name(), "executing step");
                match step.call(id, shared.env.as_ref()) {
                    Ok(Some(next)) => tx.push(Arc::from(next))?,
                    Ok(None) => {
                        if tx.stack_len()? == 1 {
                            // Popping the last step completes the
                            // transaction; capture its return value first.
                            if let Some(value) = step.return_value() {
                                tx.set_tx_info(TxInfoKey::ReturnValue, value)?;
                            }
                        }
                        tx.pop()?;
                    }
                    Err(e) => {
                        fail_transaction(&mut tx, step.name(), FailurePhase::Call, e)?;
                        return Ok(true);
                    }
                }
            }
            TxStatus::FailedInProgress => {
                compensate(&mut tx, shared)?;
                worked = true;
            }
            status @ (TxStatus::Successful | TxStatus::Failed) => {
                let auto_clean =
                    matches!(tx.tx_info(TxInfoKey::AutoClean)?, Some(Value::Bool(true)));
                if auto_clean {
                    debug!(fate_id = %id, %status, "auto-cleaning terminal transaction");
                    tx.delete()?;
                    worked = true;
                }
                return Ok(worked);
            }
        }
    }
}

/// Record the original failure and hand the transaction to the
/// compensation path. The reservation is released afterwards; any worker
/// may pick up the rollback.
fn fail_transaction<E: Send + Sync + 'static>(
    tx: &mut Box<dyn ReservedTx<E>>,
    step_name: &str,
    phase: FailurePhase,
    err: anyhow::Error,
) -> Result<()> {
    let id = tx.id();
    warn!(fate_id = %id, step = step_name, %phase, error = %err, "step failed, transaction will be rolled back");
    tx.set_exception(ExceptionRecord::new(step_name, phase, format!("{err:#}")))?;
    tx.set_status(TxStatus::FailedInProgress)
}

/// Walk the stack top-down invoking `undo`. Undo failures are logged and
/// never halt the rollback; the stored exception stays the original
/// failure.
fn compensate<E: Send + Sync + 'static>(
    tx: &mut Box<dyn ReservedTx<E>>,
    shared: &Shared<E>,
) -> Result<()> {
    let id = tx.id();
    info!(fate_id = %id, "rolling back transaction");
    while let Some(step) = tx.top()? {
        if let Err(e) = step.undo(id, shared.env.as_ref()) {
            warn!(fate_id = %id, step = step.name(), error = %e, "undo failed, continuing rollback");
        }
        tx.pop()?;
    }
    tx.set_status(TxStatus::Failed)
}
