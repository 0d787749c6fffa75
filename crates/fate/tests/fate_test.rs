//! End-to-end engine tests against the in-memory store: lifecycle,
//! cancellation, compensation ordering, deferred overflow, seed
//! idempotency, shutdown, and pool resizing.
//!
//! Test steps coordinate with the test body through atomics injected via
//! the step environment (never process globals).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use fate::{
    FailurePhase, Fate, FateConfig, FateError, FateId, FateStore, LockService,
    ProcessLockService, Step, TxFilter, TxStatus,
};
use fate_mem::MemFateStore;

#[derive(Clone, Default)]
struct TestEnv {
    calls: Arc<AtomicUsize>,
    call_started: Arc<AtomicBool>,
    gate_open: Arc<AtomicBool>,
    ready_delay_ms: Arc<AtomicU64>,
    undo_order: Arc<Mutex<Vec<String>>>,
}

impl TestEnv {
    fn open_gate(&self) {
        self.gate_open.store(true, Ordering::SeqCst);
    }

    fn wait_gate(&self) -> anyhow::Result<()> {
        let deadline = Instant::now() + Duration::from_secs(20);
        while !self.gate_open.load(Ordering::SeqCst) {
            if Instant::now() > deadline {
                anyhow::bail!("gate never opened");
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }

    fn undo_order(&self) -> Vec<String> {
        self.undo_order.lock().unwrap().clone()
    }
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for {what}");
}

fn config(workers: usize) -> FateConfig {
    FateConfig::default()
        .with_poll_initial_delay(Duration::from_millis(5))
        .with_poll_intervals(Duration::from_millis(5), Duration::from_millis(40))
        .with_worker_pool_size(workers)
        .with_shutdown_grace(Duration::from_secs(5))
}

fn engine_with(env: &TestEnv, cfg: FateConfig, max_deferred: usize) -> Fate<TestEnv> {
    let locks = ProcessLockService::new();
    let store: Arc<dyn FateStore<TestEnv>> = Arc::new(MemFateStore::with_max_deferred(
        locks.lock_id().clone(),
        max_deferred,
    ));
    Fate::new(env.clone(), store, &locks, cfg).unwrap()
}

fn engine(env: &TestEnv, workers: usize) -> Fate<TestEnv> {
    engine_with(env, config(workers), 10_000)
}

/// Runs immediately, counts invocations, returns `<data>_done`.
struct SimpleStep {
    data: String,
}

impl Step<TestEnv> for SimpleStep {
    fn name(&self) -> &str {
        "SimpleStep"
    }

    fn is_ready(&self, _id: FateId, _env: &TestEnv) -> anyhow::Result<Duration> {
        Ok(Duration::ZERO)
    }

    fn call(&self, _id: FateId, env: &TestEnv) -> anyhow::Result<Option<Box<dyn Step<TestEnv>>>> {
        env.calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    fn undo(&self, _id: FateId, _env: &TestEnv) -> anyhow::Result<()> {
        Ok(())
    }

    fn return_value(&self) -> Option<serde_json::Value> {
        Some(json!(format!("{}_done", self.data)))
    }
}

/// `call` announces itself and blocks until the test opens the gate.
struct GatedStep;

impl Step<TestEnv> for GatedStep {
    fn name(&self) -> &str {
        "GatedStep"
    }

    fn is_ready(&self, _id: FateId, _env: &TestEnv) -> anyhow::Result<Duration> {
        Ok(Duration::ZERO)
    }

    fn call(&self, _id: FateId, env: &TestEnv) -> anyhow::Result<Option<Box<dyn Step<TestEnv>>>> {
        env.call_started.store(true, Ordering::SeqCst);
        env.wait_gate()?;
        env.calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    fn undo(&self, _id: FateId, _env: &TestEnv) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq)]
enum FailWhere {
    Call,
    IsReady,
}

/// OP1 -> OP2 -> ... -> OP<total>, with the last operation failing either
/// in `call` or in `is_ready`. Undo invocations are recorded in order.
struct ChainStep {
    op: u32,
    total: u32,
    fail_in: FailWhere,
}

impl Step<TestEnv> for ChainStep {
    fn name(&self) -> &str {
        "ChainStep"
    }

    fn is_ready(&self, _id: FateId, _env: &TestEnv) -> anyhow::Result<Duration> {
        if self.fail_in == FailWhere::IsReady && self.op == self.total {
            anyhow::bail!("OP{} isReady() failed - this is expected", self.op);
        }
        Ok(Duration::ZERO)
    }

    fn call(&self, _id: FateId, _env: &TestEnv) -> anyhow::Result<Option<Box<dyn Step<TestEnv>>>> {
        if self.op < self.total {
            return Ok(Some(Box::new(ChainStep {
                op: self.op + 1,
                total: self.total,
                fail_in: self.fail_in,
            })));
        }
        anyhow::bail!("OP{} call() failed - this is expected", self.op);
    }

    fn undo(&self, _id: FateId, env: &TestEnv) -> anyhow::Result<()> {
        env.undo_order
            .lock()
            .unwrap()
            .push(format!("OP{}", self.op));
        Ok(())
    }
}

/// Like `ChainStep` failing in `call`, but the undo of OP2 also fails.
/// Compensation must keep going and the stored exception must stay the
/// original call failure.
struct BrittleUndoChain {
    op: u32,
    total: u32,
}

impl Step<TestEnv> for BrittleUndoChain {
    fn name(&self) -> &str {
        "BrittleUndoChain"
    }

    fn is_ready(&self, _id: FateId, _env: &TestEnv) -> anyhow::Result<Duration> {
        Ok(Duration::ZERO)
    }

    fn call(&self, _id: FateId, _env: &TestEnv) -> anyhow::Result<Option<Box<dyn Step<TestEnv>>>> {
        if self.op < self.total {
            return Ok(Some(Box::new(BrittleUndoChain {
                op: self.op + 1,
                total: self.total,
            })));
        }
        anyhow::bail!("OP{} call() failed - this is expected", self.op);
    }

    fn undo(&self, _id: FateId, env: &TestEnv) -> anyhow::Result<()> {
        env.undo_order
            .lock()
            .unwrap()
            .push(format!("OP{}", self.op));
        if self.op == 2 {
            anyhow::bail!("OP2 undo() failed - this is expected");
        }
        Ok(())
    }
}

/// Readiness delay comes from the environment, so the test can flip all
/// pending transactions from "defer 30s" to "run now" at once.
struct DeferredStep;

impl Step<TestEnv> for DeferredStep {
    fn name(&self) -> &str {
        "DeferredStep"
    }

    fn is_ready(&self, _id: FateId, env: &TestEnv) -> anyhow::Result<Duration> {
        Ok(Duration::from_millis(env.ready_delay_ms.load(Ordering::SeqCst)))
    }

    fn call(&self, _id: FateId, env: &TestEnv) -> anyhow::Result<Option<Box<dyn Step<TestEnv>>>> {
        env.wait_gate()?;
        env.calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    fn undo(&self, _id: FateId, _env: &TestEnv) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn test_happy_path_lifecycle() {
    let env = TestEnv::default();
    let fate = engine(&env, 2);

    let id = fate.start_transaction().unwrap();
    assert_eq!(fate.get_status(id).unwrap(), TxStatus::New);

    assert!(fate
        .seed_transaction(
            "simple-op",
            id,
            Box::new(SimpleStep { data: "one".into() }),
            false,
            "happy path",
        )
        .unwrap());

    assert_eq!(fate.wait_for_completion(id).unwrap(), TxStatus::Successful);
    assert_eq!(env.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fate.get_return_value(id).unwrap(), Some(json!("one_done")));
    assert!(fate.get_exception(id).unwrap().is_none());

    let rows = fate
        .list(&TxFilter::all().with_fate_op("simple-op"))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
    assert_eq!(rows[0].status, TxStatus::Successful);

    fate.delete(id).unwrap();
    assert_eq!(fate.get_status(id).unwrap(), TxStatus::Unknown);

    fate.shutdown(Duration::from_secs(5));
}

#[test]
fn test_auto_clean_removes_successful_transaction() {
    let env = TestEnv::default();
    let fate = engine(&env, 2);

    let id = fate.start_transaction().unwrap();
    fate.seed_transaction(
        "simple-op",
        id,
        Box::new(SimpleStep { data: "two".into() }),
        true,
        "auto clean",
    )
    .unwrap();

    // The row disappears on its own after completion.
    wait_until("auto-clean to remove the row", || {
        fate.get_status(id).unwrap() == TxStatus::Unknown
    });
    assert_eq!(env.calls.load(Ordering::SeqCst), 1);

    fate.shutdown(Duration::from_secs(5));
}

#[test]
fn test_cancel_while_new() {
    let env = TestEnv::default();
    // Generous initial delay: the cancel must land before any worker can
    // transiently claim the unseeded row.
    let fate = engine_with(
        &env,
        config(2).with_poll_initial_delay(Duration::from_millis(500)),
        10_000,
    );

    let id = fate.start_transaction().unwrap();
    assert_eq!(fate.get_status(id).unwrap(), TxStatus::New);

    assert!(fate.cancel(id).unwrap());
    let status = fate.get_status(id).unwrap();
    assert!(
        status == TxStatus::FailedInProgress || status == TxStatus::Failed,
        "unexpected status after cancel: {status}"
    );

    // Seeding after cancellation is a no-op; the cancellation wins.
    assert!(!fate
        .seed_transaction(
            "simple-op",
            id,
            Box::new(SimpleStep { data: "late".into() }),
            true,
            "seed after cancel",
        )
        .unwrap());

    wait_until("cancelled transaction to finalize", || {
        fate.get_status(id).unwrap() == TxStatus::Failed
    });

    // Nothing ever ran.
    assert_eq!(env.calls.load(Ordering::SeqCst), 0);

    let exception = fate.get_exception(id).unwrap().expect("exception recorded");
    assert_eq!(exception.phase, FailurePhase::Cancelled);
    assert!(exception.message.contains("cancelled"));

    fate.delete(id).unwrap();
    assert_eq!(fate.get_status(id).unwrap(), TxStatus::Unknown);

    fate.shutdown(Duration::from_secs(5));
}

#[test]
fn test_cancel_after_reservation_is_refused() {
    let env = TestEnv::default();
    let fate = engine(&env, 2);

    let id = fate.start_transaction().unwrap();
    fate.seed_transaction("gated-op", id, Box::new(GatedStep), false, "cancel race")
        .unwrap();

    // Wait until the executor is inside call(); the reservation is held.
    wait_until("step to start", || {
        env.call_started.load(Ordering::SeqCst)
    });
    assert_eq!(fate.get_status(id).unwrap(), TxStatus::InProgress);

    assert!(!fate.cancel(id).unwrap());

    env.open_gate();
    assert_eq!(fate.wait_for_completion(id).unwrap(), TxStatus::Successful);

    fate.delete(id).unwrap();
    fate.shutdown(Duration::from_secs(5));
}

#[test]
fn test_compensation_order_on_call_failure() {
    let env = TestEnv::default();
    let fate = engine(&env, 2);

    let id = fate.start_transaction().unwrap();
    fate.seed_transaction(
        "chain-op",
        id,
        Box::new(ChainStep {
            op: 1,
            total: 3,
            fail_in: FailWhere::Call,
        }),
        false,
        "chain fails in call",
    )
    .unwrap();

    assert_eq!(fate.wait_for_completion(id).unwrap(), TxStatus::Failed);
    assert_eq!(env.undo_order(), vec!["OP3", "OP2", "OP1"]);

    let exception = fate.get_exception(id).unwrap().expect("exception recorded");
    assert_eq!(exception.phase, FailurePhase::Call);
    assert!(exception.message.contains("call() failed"));

    fate.delete(id).unwrap();
    fate.shutdown(Duration::from_secs(5));
}

#[test]
fn test_compensation_order_on_is_ready_failure() {
    let env = TestEnv::default();
    let fate = engine(&env, 2);

    let id = fate.start_transaction().unwrap();
    fate.seed_transaction(
        "chain-op",
        id,
        Box::new(ChainStep {
            op: 1,
            total: 3,
            fail_in: FailWhere::IsReady,
        }),
        false,
        "chain fails in is_ready",
    )
    .unwrap();

    assert_eq!(fate.wait_for_completion(id).unwrap(), TxStatus::Failed);
    // The step whose is_ready failed was pushed, so it is undone too.
    assert_eq!(env.undo_order(), vec!["OP3", "OP2", "OP1"]);

    let exception = fate.get_exception(id).unwrap().expect("exception recorded");
    assert_eq!(exception.phase, FailurePhase::IsReady);
    assert!(exception.message.contains("isReady() failed"));

    fate.delete(id).unwrap();
    fate.shutdown(Duration::from_secs(5));
}

#[test]
fn test_undo_failure_does_not_halt_compensation() {
    let env = TestEnv::default();
    let fate = engine(&env, 2);

    let id = fate.start_transaction().unwrap();
    fate.seed_transaction(
        "chain-op",
        id,
        Box::new(BrittleUndoChain { op: 1, total: 3 }),
        false,
        "undo of OP2 fails",
    )
    .unwrap();

    assert_eq!(fate.wait_for_completion(id).unwrap(), TxStatus::Failed);
    // Every step was visited despite the failing undo.
    assert_eq!(env.undo_order(), vec!["OP3", "OP2", "OP1"]);

    // The surfaced exception is the original call failure, not the undo
    // failure.
    let exception = fate.get_exception(id).unwrap().expect("exception recorded");
    assert_eq!(exception.phase, FailurePhase::Call);
    assert!(exception.message.contains("OP3 call() failed"));
    assert!(!exception.message.contains("undo()"));

    fate.delete(id).unwrap();
    fate.shutdown(Duration::from_secs(5));
}

#[test]
fn test_wait_for_completion_on_unknown_id() {
    let env = TestEnv::default();
    let fate = engine(&env, 0);
    let status = fate.wait_for_completion(FateId::from_u64(12345)).unwrap();
    assert_eq!(status, TxStatus::Unknown);
    fate.shutdown(Duration::from_secs(1));
}

#[test]
fn test_deferred_overflow() {
    let env = TestEnv::default();
    // Long enough that nothing runs on its own while the map fills, short
    // enough that a transaction parked on a stale deadline still wakes
    // within the test timeout.
    env.ready_delay_ms.store(5_000, Ordering::SeqCst);
    let fate = engine_with(&env, config(2), 10);

    let seed_deferred = |ids: &mut Vec<FateId>| {
        let id = fate.start_transaction().unwrap();
        fate.seed_transaction("deferred-op", id, Box::new(DeferredStep), true, "slow")
            .unwrap();
        ids.push(id);
    };

    // Ten transactions fill the deferred map exactly to the cap.
    let mut ids = Vec::new();
    for _ in 0..10 {
        seed_deferred(&mut ids);
    }
    wait_until("deferred map to fill", || {
        fate.store().deferred_count() == 10
    });
    assert!(!fate.store().is_deferred_overflow());

    // Ten more: the eleventh deferral overflows, clearing the map and
    // setting the flag.
    for _ in 0..10 {
        seed_deferred(&mut ids);
    }
    wait_until("overflow flag to set", || {
        fate.store().is_deferred_overflow()
    });
    wait_until("deferred map to drain", || {
        fate.store().deferred_count() == 0
    });

    // Let everything run: no more deferrals, gate open.
    env.ready_delay_ms.store(0, Ordering::SeqCst);
    env.open_gate();

    wait_until("all twenty calls to execute", || {
        env.calls.load(Ordering::SeqCst) == 20
    });
    wait_until("overflow flag to clear", || {
        !fate.store().is_deferred_overflow()
    });
    wait_until("all transactions to auto-clean", || {
        ids.iter()
            .all(|id| fate.get_status(*id).unwrap() == TxStatus::Unknown)
    });

    fate.shutdown(Duration::from_secs(5));
}

#[test]
fn test_seed_idempotency() {
    let env = TestEnv::default();
    // No workers: the row must stay exactly where seeding left it.
    let fate = engine(&env, 0);

    let id = fate.start_transaction().unwrap();
    assert!(fate
        .seed_transaction(
            "op-a",
            id,
            Box::new(SimpleStep { data: "a".into() }),
            false,
            "first seed",
        )
        .unwrap());
    assert_eq!(fate.get_status(id).unwrap(), TxStatus::Submitted);

    // Identical repeat: same post-state, reports "already seeded".
    assert!(!fate
        .seed_transaction(
            "op-a",
            id,
            Box::new(SimpleStep { data: "a".into() }),
            false,
            "first seed",
        )
        .unwrap());
    assert_eq!(fate.get_status(id).unwrap(), TxStatus::Submitted);
    let snapshot = fate.store().read(id).unwrap().unwrap();
    assert_eq!(snapshot.stack, vec!["SimpleStep"]);

    // Differing repeat is rejected without a write.
    let err = fate
        .seed_transaction(
            "op-a",
            id,
            Box::new(SimpleStep { data: "a".into() }),
            false,
            "different reason",
        )
        .unwrap_err();
    assert!(matches!(err, FateError::WrongStatus { .. }));

    // And a non-terminal row cannot be deleted.
    assert!(matches!(
        fate.delete(id).unwrap_err(),
        FateError::WrongStatus { .. }
    ));

    fate.shutdown(Duration::from_secs(1));
}

#[test]
fn test_shutdown_detaches_blocked_worker_and_interrupts_waiters() {
    let env = TestEnv::default();
    let fate = engine(&env, 1);

    let id = fate.start_transaction().unwrap();
    fate.seed_transaction("gated-op", id, Box::new(GatedStep), false, "blocks")
        .unwrap();
    wait_until("step to start", || {
        env.call_started.load(Ordering::SeqCst)
    });

    // The worker is stuck inside call(); shutdown must give up after the
    // grace period instead of hanging.
    let started = Instant::now();
    fate.shutdown(Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(5));

    // Waiters observe the shutdown.
    assert!(matches!(
        fate.wait_for_completion(id).unwrap_err(),
        FateError::Interrupted
    ));

    // Unblock the detached worker so it can exit.
    env.open_gate();
}

#[test]
fn test_resize_pool() {
    let env = TestEnv::default();
    let fate = engine(&env, 1);
    assert_eq!(fate.worker_count(), 1);

    fate.resize_pool(3);
    assert_eq!(fate.worker_count(), 3);

    let id = fate.start_transaction().unwrap();
    fate.seed_transaction(
        "simple-op",
        id,
        Box::new(SimpleStep { data: "grown".into() }),
        false,
        "after growth",
    )
    .unwrap();
    assert_eq!(fate.wait_for_completion(id).unwrap(), TxStatus::Successful);
    fate.delete(id).unwrap();

    fate.resize_pool(1);
    assert_eq!(fate.worker_count(), 1);

    let id = fate.start_transaction().unwrap();
    fate.seed_transaction(
        "simple-op",
        id,
        Box::new(SimpleStep { data: "shrunk".into() }),
        false,
        "after shrink",
    )
    .unwrap();
    assert_eq!(fate.wait_for_completion(id).unwrap(), TxStatus::Successful);
    fate.delete(id).unwrap();

    fate.shutdown(Duration::from_secs(5));
}
