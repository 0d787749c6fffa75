use rusqlite::Connection;

use fate_core::error::{FateError, Result};

/// Create the FATE tables if they do not exist.
pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS fate_tx (
            tx_id INTEGER PRIMARY KEY,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            reservation_lock TEXT,
            reservation_serial INTEGER NOT NULL DEFAULT 0,
            deferred_until INTEGER,
            exception TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_fate_tx_status ON fate_tx(status);

        CREATE TABLE IF NOT EXISTS fate_step (
            tx_id INTEGER NOT NULL,
            pos INTEGER NOT NULL,
            step_name TEXT NOT NULL,
            payload BLOB NOT NULL,
            PRIMARY KEY (tx_id, pos)
        );

        CREATE TABLE IF NOT EXISTS fate_tx_info (
            tx_id INTEGER NOT NULL,
            info_key TEXT NOT NULL,
            info_value TEXT NOT NULL,
            PRIMARY KEY (tx_id, info_key)
        );

        CREATE TABLE IF NOT EXISTS fate_meta (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            clock_floor INTEGER NOT NULL DEFAULT 0
        );
        INSERT OR IGNORE INTO fate_meta (id, clock_floor) VALUES (0, 0);",
    )
    .map_err(|e| FateError::Backend(format!("initializing schema: {e}")))?;

    Ok(())
}

/// Read the persisted clock floor; deadlines written before a restart stay
/// meaningful because the clock is re-seeded from this value.
pub fn clock_floor(conn: &Connection) -> Result<u64> {
    let floor: i64 = conn
        .query_row("SELECT clock_floor FROM fate_meta WHERE id = 0", [], |row| {
            row.get(0)
        })
        .map_err(|e| FateError::Backend(format!("reading clock floor: {e}")))?;
    Ok(floor as u64)
}
