use rusqlite::{Connection, Result};

/// Initialise the users table. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            name          TEXT PRIMARY KEY NOT NULL,
            is_admin      INTEGER NOT NULL DEFAULT 0,
            userdata      TEXT NOT NULL DEFAULT '{}',  -- JSON object
            registered_at INTEGER NOT NULL
        );",
    )
}
