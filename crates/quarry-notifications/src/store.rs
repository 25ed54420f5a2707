use std::sync::{Mutex, MutexGuard, PoisonError};

use quarry_core::Clock;
use rusqlite::{types::Type, Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use crate::{
    db::init_db,
    error::{NotificationError, Result},
    types::{Notification, Recipient},
};

/// Persists user- and admin-facing notices.
pub struct NotificationStore {
    db: Mutex<Connection>,
    clock: Clock,
}

impl NotificationStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            clock: Clock::System,
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Add a notification. Returns false when the same message already
    /// exists for the recipient, in which case nothing changes.
    #[instrument(skip(self, message), fields(recipient = %recipient))]
    pub fn add_notification(
        &self,
        recipient: &Recipient,
        message: &str,
        dismissible: bool,
        expires_at: Option<i64>,
    ) -> Result<bool> {
        let n = self.conn().execute(
            "INSERT OR IGNORE INTO notifications
             (recipient, message, dismissible, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                recipient.to_string(),
                message,
                dismissible,
                self.clock.now(),
                expires_at
            ],
        )?;
        if n == 1 {
            info!("notification added");
        } else {
            debug!("notification already present");
        }
        Ok(n == 1)
    }

    /// Unexpired notifications visible to a user: addressed to them, to
    /// everyone, or (for admins) to all admins. Broadcasts the user
    /// dismissed are left out.
    pub fn for_user(&self, name: &str, is_admin: bool) -> Result<Vec<Notification>> {
        let admins = Recipient::Admins.to_string();
        let everyone = Recipient::Everyone.to_string();
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT n.id, n.recipient, n.message, n.dismissible, n.created_at, n.expires_at
             FROM notifications n
             WHERE (n.recipient = ?1 OR n.recipient = ?2 OR (?3 AND n.recipient = ?4))
               AND (n.expires_at IS NULL OR n.expires_at > ?5)
               AND NOT EXISTS (SELECT 1 FROM notification_dismissals d
                               WHERE d.notification_id = n.id AND d.username = ?1)
             ORDER BY n.id",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![name, everyone, is_admin, admins, self.clock.now()],
            row_to_notification,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// All notifications addressed to exactly this recipient, expired or not.
    pub fn for_recipient(&self, recipient: &Recipient) -> Result<Vec<Notification>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT id, recipient, message, dismissible, created_at, expires_at
             FROM notifications WHERE recipient = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([recipient.to_string()], row_to_notification)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get(&self, id: i64) -> Result<Option<Notification>> {
        let n = self
            .conn()
            .query_row(
                "SELECT id, recipient, message, dismissible, created_at, expires_at
                 FROM notifications WHERE id = ?1",
                [id],
                row_to_notification,
            )
            .optional()?;
        Ok(n)
    }

    /// Dismiss a notification on behalf of `user`. Direct notifications are
    /// deleted; broadcasts are hidden for that user only. Returns false if
    /// the notification does not exist, is not dismissible or is not
    /// addressed to the user.
    pub fn dismiss(&self, id: i64, user: &str) -> Result<bool> {
        let Some(notification) = self.get(id)? else {
            return Ok(false);
        };
        if !notification.dismissible {
            return Ok(false);
        }
        let db = self.conn();
        let changed = match notification.recipient {
            Recipient::User(ref name) if name == user => {
                db.execute("DELETE FROM notifications WHERE id = ?1", [id])?
            }
            Recipient::User(_) => 0,
            Recipient::Admins | Recipient::Everyone => db.execute(
                "INSERT OR IGNORE INTO notification_dismissals (notification_id, username)
                 VALUES (?1, ?2)",
                rusqlite::params![id, user],
            )?,
        };
        Ok(changed == 1)
    }

    /// Delete notifications for `recipient` whose message starts with
    /// `prefix`.
    pub fn delete_matching(&self, recipient: &Recipient, prefix: &str) -> Result<usize> {
        let n = self.conn().execute(
            "DELETE FROM notifications
             WHERE recipient = ?1 AND substr(message, 1, length(?2)) = ?2",
            rusqlite::params![recipient.to_string(), prefix],
        )?;
        Ok(n)
    }

    /// Make `message` the only notification for `recipient` starting with
    /// `prefix`. An identical existing notification is kept as is, so its
    /// dismissals survive. Returns true if `message` was newly added.
    #[instrument(skip(self, prefix, message), fields(recipient = %recipient))]
    pub fn replace_matching(
        &self,
        recipient: &Recipient,
        prefix: &str,
        message: &str,
        dismissible: bool,
        expires_at: Option<i64>,
    ) -> Result<bool> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        let replaced = tx.execute(
            "DELETE FROM notifications
             WHERE recipient = ?1 AND substr(message, 1, length(?2)) = ?2 AND message != ?3",
            rusqlite::params![recipient.to_string(), prefix, message],
        )?;
        let added = tx.execute(
            "INSERT OR IGNORE INTO notifications
             (recipient, message, dismissible, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                recipient.to_string(),
                message,
                dismissible,
                self.clock.now(),
                expires_at
            ],
        )?;
        tx.commit()?;
        debug!(replaced, added = added == 1, "notification replaced");
        Ok(added == 1)
    }

    pub fn delete_for_recipient(&self, recipient: &Recipient) -> Result<usize> {
        let db = self.conn();
        let n = db.execute(
            "DELETE FROM notifications WHERE recipient = ?1",
            [recipient.to_string()],
        )?;
        if let Recipient::User(ref name) = recipient {
            db.execute("DELETE FROM notification_dismissals WHERE username = ?1", [name])?;
        }
        Ok(n)
    }

    /// Delete every notification whose expiry has passed.
    #[instrument(skip(self))]
    pub fn expire(&self) -> Result<usize> {
        let n = self.conn().execute(
            "DELETE FROM notifications WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            [self.clock.now()],
        )?;
        if n > 0 {
            info!(count = n, "expired notifications removed");
        }
        Ok(n)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let recipient: String = row.get(1)?;
    let recipient = recipient.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            Box::new(NotificationError::InvalidRecipient(e)),
        )
    })?;
    Ok(Notification {
        id: row.get(0)?,
        recipient,
        message: row.get(2)?,
        dismissible: row.get(3)?,
        created_at: row.get(4)?,
        expires_at: row.get(5)?,
    })
}
