use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info, warn};

use fate_core::clock::MonotonicClock;
use fate_core::deferral::{filter_runnable, DeferralTracker, RunnableCandidate};
use fate_core::error::{FateError, Result};
use fate_core::id::{FateId, FateIdGenerator, UuidFateIdGenerator};
use fate_core::lock::{LockId, LockService};
use fate_core::status::{check_transition, TxStatus};
use fate_core::step::{ExceptionRecord, Step, StepRegistry, TxInfoKey};
use fate_core::store::{
    FateStore, ReadOnlyFateStore, ReservedTx, TxFilter, TxSnapshot, TxSummary,
};

use crate::schema;

const BUSY_RETRIES: u32 = 5;
const RESERVE_RETRY: Duration = Duration::from_millis(20);
const SCAN_BATCH: usize = 256;

/// Configuration for [`SqliteFateStore`].
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Path of the database file. Parent directories are created.
    pub path: PathBuf,
    /// Cap on the in-memory deferred map before overflow kicks in.
    pub max_deferred: usize,
    /// Use WAL journaling (recommended).
    pub wal_mode: bool,
}

impl SqliteStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SqliteStoreConfig {
            path: path.into(),
            max_deferred: 10_000,
            wal_mode: true,
        }
    }

    pub fn with_max_deferred(mut self, max_deferred: usize) -> Self {
        self.max_deferred = max_deferred;
        self
    }
}

struct Inner<E: 'static> {
    conn: Mutex<Connection>,
    registry: StepRegistry<E>,
    deferrals: DeferralTracker,
    clock: MonotonicClock,
    lock_id: LockId,
    id_gen: Box<dyn FateIdGenerator>,
}

/// SQLite-backed FATE store. Cheap to clone; clones share one connection.
pub struct SqliteFateStore<E: 'static> {
    inner: Arc<Inner<E>>,
}

impl<E: 'static> Clone for SqliteFateStore<E> {
    fn clone(&self) -> Self {
        SqliteFateStore {
            inner: self.inner.clone(),
        }
    }
}

fn db_id(id: FateId) -> i64 {
    id.as_u64() as i64
}

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Retry transient failures with capped backoff; everything else becomes
/// `Backend`.
fn run_with_retry<T>(
    op: &'static str,
    mut attempt_fn: impl FnMut() -> rusqlite::Result<T>,
) -> Result<T> {
    let mut delay = Duration::from_millis(10);
    let mut attempt = 0;
    loop {
        match attempt_fn() {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt < BUSY_RETRIES => {
                attempt += 1;
                debug!(op, attempt, error = %e, "transient sqlite error, retrying");
                thread::sleep(delay);
                delay = (delay * 2).min(Duration::from_millis(250));
            }
            Err(e) => return Err(FateError::Backend(format!("{op}: {e}"))),
        }
    }
}

fn parse_status(raw: &str) -> rusqlite::Result<TxStatus> {
    raw.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("bad status {raw:?}").into(),
        )
    })
}

fn parse_created(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl<E: 'static> SqliteFateStore<E> {
    /// Open (creating if needed) the store at `config.path`.
    ///
    /// `registry` must know how to decode every step type that will be
    /// pushed through this store. `lock_id` stamps reservations made by
    /// this process; rows reserved by dead owners are reclaimed through
    /// [`FateStore::recover_orphans`], which the engine runs at startup.
    pub fn open(
        config: SqliteStoreConfig,
        lock_id: LockId,
        registry: StepRegistry<E>,
    ) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            &config.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| FateError::Backend(format!("opening {}: {e}", config.path.display())))?;

        if config.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| FateError::Backend(format!("enabling WAL: {e}")))?;
        }
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| FateError::Backend(format!("setting synchronous: {e}")))?;

        schema::init(&conn)?;
        let floor = schema::clock_floor(&conn)?;

        info!(path = %config.path.display(), clock_floor = floor, "opened fate store");

        Ok(SqliteFateStore {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                registry,
                deferrals: DeferralTracker::new(config.max_deferred),
                clock: MonotonicClock::with_floor(floor),
                lock_id,
                id_gen: Box::new(UuidFateIdGenerator),
            }),
        })
    }
}

impl<E: 'static> ReadOnlyFateStore<E> for SqliteFateStore<E> {
    fn status(&self, id: FateId) -> Result<TxStatus> {
        let conn = self.inner.conn.lock().unwrap();
        let raw: Option<String> = run_with_retry("status", || {
            conn.query_row(
                "SELECT status FROM fate_tx WHERE tx_id = ?1",
                params![db_id(id)],
                |row| row.get(0),
            )
            .optional()
        })?;
        match raw {
            Some(raw) => Ok(raw
                .parse()
                .map_err(|_| FateError::Serialization(format!("bad status {raw:?}")))?),
            None => Ok(TxStatus::Unknown),
        }
    }

    fn read(&self, id: FateId) -> Result<Option<TxSnapshot>> {
        let conn = self.inner.conn.lock().unwrap();
        let row: Option<(String, String, Option<String>)> = run_with_retry("read", || {
            conn.query_row(
                "SELECT status, created_at, exception FROM fate_tx WHERE tx_id = ?1",
                params![db_id(id)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
        })?;
        let Some((status_raw, created_raw, exception_raw)) = row else {
            return Ok(None);
        };

        let stack: Vec<String> = run_with_retry("read stack", || {
            let mut stmt = conn
                .prepare("SELECT step_name FROM fate_step WHERE tx_id = ?1 ORDER BY pos ASC")?;
            let names = stmt
                .query_map(params![db_id(id)], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })?;

        let raw_info: Vec<(String, String)> = run_with_retry("read tx info", || {
            let mut stmt = conn
                .prepare("SELECT info_key, info_value FROM fate_tx_info WHERE tx_id = ?1")?;
            let pairs = stmt
                .query_map(params![db_id(id)], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
            Ok(pairs)
        })?;

        let mut tx_info = HashMap::new();
        for (key_raw, value_raw) in raw_info {
            if let Some(key) = TxInfoKey::parse(&key_raw) {
                let value: Value = serde_json::from_str(&value_raw)
                    .map_err(|e| FateError::Serialization(e.to_string()))?;
                tx_info.insert(key, value);
            }
        }

        let exception = match exception_raw {
            Some(raw) => Some(
                serde_json::from_str::<ExceptionRecord>(&raw)
                    .map_err(|e| FateError::Serialization(e.to_string()))?,
            ),
            None => None,
        };

        Ok(Some(TxSnapshot {
            id,
            status: status_raw
                .parse()
                .map_err(|_| FateError::Serialization(format!("bad status {status_raw:?}")))?,
            created: parse_created(&created_raw),
            stack,
            tx_info,
            exception,
        }))
    }

    fn list(&self, filter: &TxFilter) -> Result<Vec<TxSummary>> {
        let conn = self.inner.conn.lock().unwrap();
        let rows: Vec<(i64, String, String, bool, Option<String>, Option<String>)> =
            run_with_retry("list", || {
                let mut stmt = conn.prepare(
                    "SELECT t.tx_id, t.status, t.created_at,
                            t.reservation_lock IS NOT NULL,
                            (SELECT info_value FROM fate_tx_info
                              WHERE tx_id = t.tx_id AND info_key = 'fate_op'),
                            (SELECT step_name FROM fate_step
                              WHERE tx_id = t.tx_id ORDER BY pos DESC LIMIT 1)
                       FROM fate_tx t ORDER BY t.tx_id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })?;

        let mut summaries = Vec::new();
        for (raw_id, status_raw, created_raw, reserved, fate_op_raw, top_step) in rows {
            let status: TxStatus = status_raw
                .parse()
                .map_err(|_| FateError::Serialization(format!("bad status {status_raw:?}")))?;
            // fate_op is stored as a JSON string value.
            let fate_op = fate_op_raw
                .as_deref()
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .and_then(|v| v.as_str().map(str::to_owned));
            if !filter.matches(status, fate_op.as_deref()) {
                continue;
            }
            summaries.push(TxSummary {
                id: FateId::from_u64(raw_id as u64),
                status,
                fate_op,
                created: parse_created(&created_raw),
                reserved,
                top_step,
            });
        }
        Ok(summaries)
    }

    fn runnable(&self, keep_scanning: &(dyn Fn() -> bool + Sync)) -> Result<Vec<FateId>> {
        // Keyset-paginated scan: keep_scanning is consulted between
        // batches, so a shutdown bounds the cost of the query itself and
        // not just the filter below.
        let mut candidates: Vec<RunnableCandidate> = Vec::new();
        {
            let conn = self.inner.conn.lock().unwrap();
            let mut last_id = i64::MIN;
            loop {
                if !keep_scanning() {
                    break;
                }
                let batch: Vec<(i64, RunnableCandidate)> =
                    run_with_retry("runnable scan", || {
                        let mut stmt = conn.prepare(
                            "SELECT tx_id, status, reservation_lock IS NOT NULL, deferred_until
                               FROM fate_tx
                              WHERE tx_id > ?1
                                AND status IN ('NEW', 'SUBMITTED', 'IN_PROGRESS',
                                               'FAILED_IN_PROGRESS')
                              ORDER BY tx_id
                              LIMIT ?2",
                        )?;
                        let rows = stmt
                            .query_map(params![last_id, SCAN_BATCH as i64], |row| {
                                let raw_id: i64 = row.get(0)?;
                                let status_raw: String = row.get(1)?;
                                let reserved: bool = row.get(2)?;
                                let deferred: Option<i64> = row.get(3)?;
                                Ok((
                                    raw_id,
                                    RunnableCandidate {
                                        id: FateId::from_u64(raw_id as u64),
                                        status: parse_status(&status_raw)?,
                                        reserved,
                                        deferred_until: deferred.map(|d| d as u64),
                                    },
                                ))
                            })?
                            .collect::<rusqlite::Result<Vec<_>>>()?;
                        Ok(rows)
                    })?;
                let exhausted = batch.len() < SCAN_BATCH;
                for (raw_id, candidate) in batch {
                    last_id = raw_id;
                    candidates.push(candidate);
                }
                if exhausted {
                    break;
                }
            }
        }

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

impl<E: 'static> FateStore<E> for SqliteFateStore<E> {
    fn create(&self) -> Result<FateId> {
        let conn = self.inner.conn.lock().unwrap();
        loop {
            let id = self.inner.id_gen.new_id();
            let created = Utc::now().to_rfc3339();
            let changed = run_with_retry("create", || {
                conn.execute(
                    "INSERT OR IGNORE INTO fate_tx (tx_id, status, created_at)
                     VALUES (?1, 'NEW', ?2)",
                    params![db_id(id), created],
                )
            })?;
            if changed == 1 {
                debug!(fate_id = %id, "created transaction");
                return Ok(id);
            }
            // Id collision; draw again.
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
        let conn = self.inner.conn.lock().unwrap();
        let changed = run_with_retry("reserve", || {
            conn.execute(
                "UPDATE fate_tx
                    SET reservation_lock = ?2,
                        reservation_serial = reservation_serial + 1
                  WHERE tx_id = ?1 AND reservation_lock IS NULL",
                params![db_id(id), self.inner.lock_id.as_str()],
            )
        })?;
        if changed == 0 {
            let exists: Option<i64> = run_with_retry("reserve existence check", || {
                conn.query_row(
                    "SELECT 1 FROM fate_tx WHERE tx_id = ?1",
                    params![db_id(id)],
                    |row| row.get(0),
                )
                .optional()
            })?;
            return match exists {
                Some(_) => Ok(None),
                None => Err(FateError::NotFound(id)),
            };
        }
        let serial: i64 = run_with_retry("reserve serial read", || {
            conn.query_row(
                "SELECT reservation_serial FROM fate_tx WHERE tx_id = ?1",
                params![db_id(id)],
                |row| row.get(0),
            )
        })?;
        Ok(Some(Box::new(SqliteReservedTx {
            inner: self.inner.clone(),
            id,
            serial,
            deleted: false,
        })))
    }

    fn recover_orphans(&self, locks: &dyn LockService) -> Result<usize> {
        let conn = self.inner.conn.lock().unwrap();
        let owners: Vec<String> = run_with_retry("orphan scan", || {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT reservation_lock FROM fate_tx
                  WHERE reservation_lock IS NOT NULL",
            )?;
            let owners = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(owners)
        })?;

        let mut recovered = 0;
        for owner in owners {
            if locks.is_live(&LockId::new(owner.clone())) {
                continue;
            }
            recovered += run_with_retry("orphan recovery", || {
                conn.execute(
                    "UPDATE fate_tx
                        SET reservation_lock = NULL,
                            reservation_serial = reservation_serial + 1
                      WHERE reservation_lock = ?1",
                    params![owner],
                )
            })?;
        }
        if recovered > 0 {
            info!(recovered, "recovered orphaned reservations");
        }
        Ok(recovered)
    }
}

enum Guard<T> {
    Applied(Result<T>),
    RowGone,
    OwnerChanged,
}

struct SqliteReservedTx<E: 'static> {
    inner: Arc<Inner<E>>,
    id: FateId,
    serial: i64,
    deleted: bool,
}

impl<E: 'static> SqliteReservedTx<E> {
    /// Run `f` inside a SQLite transaction after re-checking that this
    /// handle still owns the row. The inner result decides commit (Ok) vs
    /// rollback (Err); ownership failures map to `Deleted` /
    /// `LostReservation`.
    fn guarded<T>(
        &self,
        op: &'static str,
        f: impl Fn(&rusqlite::Transaction<'_>) -> rusqlite::Result<Result<T>>,
    ) -> Result<T> {
        if self.deleted {
            return Err(FateError::Deleted(self.id));
        }
        let mut conn = self.inner.conn.lock().unwrap();
        let outcome = run_with_retry(op, || {
            let tx = conn.transaction()?;
            let owner: Option<(Option<String>, i64)> = tx
                .query_row(
                    "SELECT reservation_lock, reservation_serial FROM fate_tx WHERE tx_id = ?1",
                    params![db_id(self.id)],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match owner {
                None => Ok(Guard::RowGone),
                Some((Some(lock), serial))
                    if lock == self.inner.lock_id.as_str() && serial == self.serial =>
                {
                    let applied = f(&tx)?;
                    if applied.is_ok() {
                        tx.commit()?;
                    }
                    Ok(Guard::Applied(applied))
                }
                Some(_) => Ok(Guard::OwnerChanged),
            }
        })?;
        match outcome {
            Guard::Applied(result) => result,
            Guard::RowGone => Err(FateError::Deleted(self.id)),
            Guard::OwnerChanged => Err(FateError::LostReservation(self.id)),
        }
    }
}

impl<E: 'static> ReservedTx<E> for SqliteReservedTx<E> {
    fn id(&self) -> FateId {
        self.id
    }

    fn status(&self) -> Result<TxStatus> {
        self.guarded("status", |tx| {
            let raw: String = tx.query_row(
                "SELECT status FROM fate_tx WHERE tx_id = ?1",
                params![db_id(self.id)],
                |row| row.get(0),
            )?;
            Ok(parse_status(&raw).map_err(|e| FateError::Serialization(e.to_string())))
        })
    }

    fn set_status(&mut self, status: TxStatus) -> Result<()> {
        let id = self.id;
        self.guarded("set status", |tx| {
            let raw: String = tx.query_row(
                "SELECT status FROM fate_tx WHERE tx_id = ?1",
                params![db_id(id)],
                |row| row.get(0),
            )?;
            let current = parse_status(&raw)?;
            if let Err(e) = check_transition(id, current, status) {
                return Ok(Err(e));
            }
            tx.execute(
                "UPDATE fate_tx SET status = ?2, deferred_until = NULL WHERE tx_id = ?1",
                params![db_id(id), status.as_str()],
            )?;
            debug!(fate_id = %id, from = %current, to = %status, "status change");
            Ok(Ok(()))
        })
    }

    fn top(&self) -> Result<Option<Arc<dyn Step<E>>>> {
        self.guarded("read top step", |tx| {
            let row: Option<(String, Vec<u8>)> = tx
                .query_row(
                    "SELECT step_name, payload FROM fate_step
                      WHERE tx_id = ?1 ORDER BY pos DESC LIMIT 1",
                    params![db_id(self.id)],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(match row {
                Some((name, payload)) => {
                    self.inner.registry.decode(&name, &payload).map(Some)
                }
                None => Ok(None),
            })
        })
    }

    fn stack_len(&self) -> Result<usize> {
        self.guarded("stack length", |tx| {
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM fate_step WHERE tx_id = ?1",
                params![db_id(self.id)],
                |row| row.get(0),
            )?;
            Ok(Ok(count as usize))
        })
    }

    fn push(&mut self, step: Arc<dyn Step<E>>) -> Result<()> {
        let payload = step
            .encode()
            .map_err(|e| FateError::Serialization(format!("encoding {}: {e:#}", step.name())))?;
        let name = step.name().to_owned();
        self.guarded("push step", |tx| {
            tx.execute(
                "INSERT INTO fate_step (tx_id, pos, step_name, payload)
                 VALUES (?1,
                         COALESCE((SELECT MAX(pos) + 1 FROM fate_step WHERE tx_id = ?1), 0),
                         ?2, ?3)",
                params![db_id(self.id), name, payload],
            )?;
            Ok(Ok(()))
        })
    }

    fn pop(&mut self) -> Result<()> {
        let id = self.id;
        self.guarded("pop step", |tx| {
            let changed = tx.execute(
                "DELETE FROM fate_step
                  WHERE tx_id = ?1
                    AND pos = (SELECT MAX(pos) FROM fate_step WHERE tx_id = ?1)",
                params![db_id(id)],
            )?;
            if changed == 0 {
                Ok(Err(FateError::InvalidState(format!(
                    "pop on empty stack for {id}"
                ))))
            } else {
                Ok(Ok(()))
            }
        })
    }

    fn tx_info(&self, key: TxInfoKey) -> Result<Option<Value>> {
        self.guarded("read tx info", |tx| {
            let raw: Option<String> = tx
                .query_row(
                    "SELECT info_value FROM fate_tx_info WHERE tx_id = ?1 AND info_key = ?2",
                    params![db_id(self.id), key.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(match raw {
                Some(raw) => serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|e| FateError::Serialization(e.to_string())),
                None => Ok(None),
            })
        })
    }

    fn set_tx_info(&mut self, key: TxInfoKey, value: Value) -> Result<()> {
        let raw = value.to_string();
        self.guarded("set tx info", |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO fate_tx_info (tx_id, info_key, info_value)
                 VALUES (?1, ?2, ?3)",
                params![db_id(self.id), key.as_str(), raw],
            )?;
            Ok(Ok(()))
        })
    }

    fn set_exception(&mut self, record: ExceptionRecord) -> Result<()> {
        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(e) => return Err(FateError::Serialization(e.to_string())),
        };
        self.guarded("set exception", |tx| {
            tx.execute(
                "UPDATE fate_tx SET exception = ?2 WHERE tx_id = ?1",
                params![db_id(self.id), raw],
            )?;
            Ok(Ok(()))
        })
    }

    fn defer(&mut self, delay: Duration) -> Result<()> {
        let now = self.inner.clock.now_millis();
        let deadline = now.saturating_add(delay.as_millis() as u64);
        self.guarded("defer", |tx| {
            tx.execute(
                "UPDATE fate_tx SET deferred_until = ?2 WHERE tx_id = ?1",
                params![db_id(self.id), deadline as i64],
            )?;
            // Ratchet the persisted clock floor to the current reading so a
            // restart cannot observe time running backwards (which would
            // stretch or collapse pending deadlines).
            tx.execute(
                "UPDATE fate_meta SET clock_floor = ?1 WHERE clock_floor < ?1",
                params![now as i64],
            )?;
            Ok(Ok(()))
        })?;
        if !self.inner.deferrals.defer(self.id, deadline) {
            // Overflow: every pending deferral is woken early, durably.
            let conn = self.inner.conn.lock().unwrap();
            run_with_retry("defer overflow clear", || {
                conn.execute("UPDATE fate_tx SET deferred_until = NULL", [])
            })?;
        }
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        let id = self.id;
        self.guarded("delete", |tx| {
            tx.execute(
                "DELETE FROM fate_step WHERE tx_id = ?1",
                params![db_id(id)],
            )?;
            tx.execute(
                "DELETE FROM fate_tx_info WHERE tx_id = ?1",
                params![db_id(id)],
            )?;
            tx.execute("DELETE FROM fate_tx WHERE tx_id = ?1", params![db_id(id)])?;
            Ok(Ok(()))
        })?;
        self.deleted = true;
        self.inner.deferrals.remove(id);
        debug!(fate_id = %id, "deleted transaction");
        Ok(())
    }
}

impl<E: 'static> Drop for SqliteReservedTx<E> {
    fn drop(&mut self) {
        if self.deleted {
            return;
        }
        let conn = self.inner.conn.lock().unwrap();
        let released = conn.execute(
            "UPDATE fate_tx SET reservation_lock = NULL
              WHERE tx_id = ?1 AND reservation_lock = ?2 AND reservation_serial = ?3",
            params![db_id(self.id), self.inner.lock_id.as_str(), self.serial],
        );
        if let Err(e) = released {
            warn!(fate_id = %self.id, error = %e, "failed to release reservation");
        }
    }
}
