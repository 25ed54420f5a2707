use std::sync::{Mutex, MutexGuard, PoisonError};

use quarry_core::Clock;
use rusqlite::{types::Type, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{info, instrument};

use crate::{
    db::init_db,
    error::{Result, UserError},
    types::{User, DELETE_AFTER},
};

const USER_COLUMNS: &str = "name, is_admin, userdata, registered_at";

pub struct UserStore {
    db: Mutex<Connection>,
    clock: Clock,
}

impl UserStore {
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

    pub fn create(&self, name: &str, is_admin: bool) -> Result<User> {
        let now = self.clock.now();
        let n = self.conn().execute(
            "INSERT OR IGNORE INTO users (name, is_admin, userdata, registered_at)
             VALUES (?1, ?2, '{}', ?3)",
            rusqlite::params![name, is_admin, now],
        )?;
        if n == 0 {
            return Err(UserError::AlreadyExists(name.to_string()));
        }
        info!(user = name, is_admin, "user created");
        Ok(User {
            name: name.to_string(),
            is_admin,
            userdata: Map::new(),
            registered_at: now,
        })
    }

    pub fn get(&self, name: &str) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE name = ?1"),
                [name],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn list(&self) -> Result<Vec<User>> {
        self.query_users("ORDER BY name", [])
    }

    /// Users that have a non-empty `delete-after` setting.
    pub fn with_delete_after(&self) -> Result<Vec<User>> {
        self.query_users(
            "WHERE IFNULL(json_extract(userdata, ?1), '') != '' ORDER BY name",
            [format!("$.\"{DELETE_AFTER}\"")],
        )
    }

    pub fn get_value(&self, name: &str, key: &str) -> Result<Option<Value>> {
        let user = self.get(name)?.ok_or_else(|| UserError::NotFound(name.to_string()))?;
        Ok(user.userdata.get(key).cloned())
    }

    /// Set one userdata key.
    #[instrument(skip(self, value))]
    pub fn set_value(&self, name: &str, key: &str, value: Value) -> Result<()> {
        self.update_userdata(name, |data| {
            data.insert(key.to_string(), value);
        })
    }

    /// Remove one userdata key. Returns whether it was set.
    pub fn remove_value(&self, name: &str, key: &str) -> Result<bool> {
        self.update_userdata(name, |data| data.shift_remove(key).is_some())
    }

    /// Delete the user row only. Owned data is cleaned up by the caller.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let n = self.conn().execute("DELETE FROM users WHERE name = ?1", [name])?;
        Ok(n == 1)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn query_users(&self, clause: &str, params: impl rusqlite::Params) -> Result<Vec<User>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!("SELECT {USER_COLUMNS} FROM users {clause}"))?;
        let rows = stmt.query_map(params, row_to_user)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn update_userdata<T>(&self, name: &str, f: impl FnOnce(&mut Map<String, Value>) -> T) -> Result<T> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        let json: Option<String> = tx
            .query_row("SELECT userdata FROM users WHERE name = ?1", [name], |row| row.get(0))
            .optional()?;
        let json = json.ok_or_else(|| UserError::NotFound(name.to_string()))?;
        let mut data: Map<String, Value> = serde_json::from_str(&json)?;
        let out = f(&mut data);
        tx.execute(
            "UPDATE users SET userdata = ?2 WHERE name = ?1",
            rusqlite::params![name, Value::Object(data).to_string()],
        )?;
        tx.commit()?;
        Ok(out)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let userdata: String = row.get(2)?;
    let userdata: Map<String, Value> = serde_json::from_str(&userdata)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(User {
        name: row.get(0)?,
        is_admin: row.get(1)?,
        userdata,
        registered_at: row.get(3)?,
    })
}
