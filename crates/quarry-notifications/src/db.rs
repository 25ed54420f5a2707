use rusqlite::{Connection, Result};

/// Initialise notification tables. Safe to call on every startup.
///
/// A notification is unique per `(recipient, message)`, so adding the same
/// notice twice keeps a single row. Dismissals of broadcast notifications
/// are tracked per user and cascade away with their notification.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS notifications (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            recipient   TEXT NOT NULL,
            message     TEXT NOT NULL,
            dismissible INTEGER NOT NULL DEFAULT 1,
            created_at  INTEGER NOT NULL,
            expires_at  INTEGER,
            UNIQUE(recipient, message)
        );
        CREATE INDEX IF NOT EXISTS idx_notifications_expires
            ON notifications(expires_at) WHERE expires_at IS NOT NULL;

        CREATE TABLE IF NOT EXISTS notification_dismissals (
            notification_id INTEGER NOT NULL
                REFERENCES notifications(id) ON DELETE CASCADE,
            username        TEXT NOT NULL,
            PRIMARY KEY (notification_id, username)
        );",
    )
}
