use rusqlite::{Connection, Result};

/// Initialise dataset tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_datasets_table(conn)?;
    create_annotations_table(conn)?;
    Ok(())
}

fn create_datasets_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS datasets (
            key              TEXT PRIMARY KEY,
            key_parent       TEXT,
            type             TEXT NOT NULL,
            owner            TEXT NOT NULL DEFAULT '',
            parameters       TEXT NOT NULL DEFAULT '{}',
            timestamp        INTEGER NOT NULL,
            expires_after    INTEGER,
            status           TEXT NOT NULL DEFAULT '',
            num_rows         INTEGER NOT NULL DEFAULT -1,
            is_finished      INTEGER NOT NULL DEFAULT 0,
            result_file      TEXT NOT NULL DEFAULT '',
            software_version TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_datasets_parent
            ON datasets(key_parent);
        CREATE INDEX IF NOT EXISTS idx_datasets_owner
            ON datasets(owner);
        CREATE INDEX IF NOT EXISTS idx_datasets_expires
            ON datasets(expires_after) WHERE expires_after IS NOT NULL;",
    )
}

fn create_annotations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS annotations (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            dataset           TEXT NOT NULL,
            item_id           TEXT NOT NULL,
            label             TEXT NOT NULL,
            value             TEXT NOT NULL DEFAULT '',
            author            TEXT NOT NULL DEFAULT '',
            by_processor      INTEGER NOT NULL DEFAULT 0,
            timestamp         INTEGER NOT NULL,
            timestamp_created INTEGER NOT NULL,
            UNIQUE(dataset, item_id, label)
        );
        CREATE INDEX IF NOT EXISTS idx_annotations_dataset
            ON annotations(dataset);",
    )
}
