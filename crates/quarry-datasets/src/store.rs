use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use quarry_core::Clock;
use rusqlite::{types::Type, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::{
    db::init_db,
    error::{DatasetError, Result},
    types::{Annotation, Dataset, NewAnnotation, NewDataset},
};

const DATASET_COLUMNS: &str = "key, key_parent, type, owner, parameters, timestamp, expires_after,
                               status, num_rows, is_finished, result_file, software_version";

/// Owns the `datasets` and `annotations` tables and the result artifacts
/// stored under the results directory.
pub struct DatasetStore {
    db: Mutex<Connection>,
    clock: Clock,
    results_dir: PathBuf,
}

impl DatasetStore {
    pub fn new(conn: Connection, results_dir: impl Into<PathBuf>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            clock: Clock::System,
            results_dir: results_dir.into(),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Absolute path of a dataset's result artifact.
    pub fn result_path(&self, dataset: &Dataset) -> PathBuf {
        self.results_dir.join(&dataset.result_file)
    }

    /// Scratch directory a dataset may use while it is being produced.
    pub fn staging_path(&self, key: &str) -> PathBuf {
        self.results_dir.join(format!("{key}-staging"))
    }

    /// Create a dataset. The parent, when given, must exist.
    #[instrument(skip(self, new), fields(dataset.type = %new.dataset_type))]
    pub fn create(&self, new: NewDataset) -> Result<Dataset> {
        let now = self.clock.now();
        let key = dataset_key(&new.dataset_type, &new.parameters, now);
        let parameters_json = Value::Object(new.parameters.clone()).to_string();
        let result_file = format!("{key}.{}", new.extension);

        let db = self.conn();
        if let Some(ref parent) = new.parent {
            if !key_exists(&db, parent)? {
                return Err(DatasetError::NotFound(parent.clone()));
            }
        }
        db.execute(
            "INSERT INTO datasets
             (key, key_parent, type, owner, parameters, timestamp, expires_after, result_file)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                key,
                new.parent,
                new.dataset_type,
                new.owner,
                parameters_json,
                now,
                new.expires_after,
                result_file,
            ],
        )?;
        info!(dataset.key = %key, parent = ?new.parent, "dataset created");

        Ok(Dataset {
            key,
            key_parent: new.parent,
            dataset_type: new.dataset_type,
            owner: new.owner,
            parameters: new.parameters,
            timestamp: now,
            expires_after: new.expires_after,
            status: String::new(),
            num_rows: -1,
            is_finished: false,
            result_file,
            software_version: String::new(),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<Dataset>> {
        let dataset = self
            .conn()
            .query_row(
                &format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE key = ?1"),
                [key],
                row_to_dataset,
            )
            .optional()?;
        Ok(dataset)
    }

    /// Direct children of a dataset, oldest first.
    pub fn children(&self, key: &str) -> Result<Vec<Dataset>> {
        self.query_datasets(
            "WHERE key_parent = ?1 ORDER BY timestamp, key",
            rusqlite::params![key],
        )
    }

    /// Top-level datasets owned by `owner`.
    pub fn owned_by(&self, owner: &str) -> Result<Vec<Dataset>> {
        self.query_datasets(
            "WHERE owner = ?1 AND key_parent IS NULL ORDER BY timestamp, key",
            rusqlite::params![owner],
        )
    }

    /// Top-level datasets of `datasource` created before `cutoff` that are
    /// not marked to be kept.
    pub fn expired_for_datasource(&self, datasource: &str, cutoff: i64) -> Result<Vec<Dataset>> {
        let candidates = self.query_datasets(
            "WHERE key_parent IS NULL
               AND json_extract(parameters, '$.datasource') = ?1
               AND timestamp < ?2
             ORDER BY timestamp, key",
            rusqlite::params![datasource, cutoff],
        )?;
        Ok(candidates.into_iter().filter(|d| !d.keep()).collect())
    }

    /// Datasets of any datasource whose explicit expiry lies before `now`.
    pub fn explicitly_expired(&self, now: i64) -> Result<Vec<Dataset>> {
        self.query_datasets(
            "WHERE expires_after IS NOT NULL AND expires_after < ?1
             ORDER BY expires_after, key",
            rusqlite::params![now],
        )
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM datasets", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn update_status(&self, key: &str, status: &str) -> Result<()> {
        self.update_row(
            key,
            "UPDATE datasets SET status = ?2 WHERE key = ?1",
            rusqlite::params![key, status],
        )
    }

    pub fn set_software_version(&self, key: &str, version: &str) -> Result<()> {
        self.update_row(
            key,
            "UPDATE datasets SET software_version = ?2 WHERE key = ?1",
            rusqlite::params![key, version],
        )
    }

    /// Point the dataset at a result artifact with another extension.
    pub fn set_result_extension(&self, key: &str, extension: &str) -> Result<String> {
        let file = format!("{key}.{}", extension.trim_start_matches('.'));
        self.update_row(
            key,
            "UPDATE datasets SET result_file = ?2 WHERE key = ?1",
            rusqlite::params![key, file],
        )?;
        Ok(file)
    }

    /// Mark a dataset finished with `num_rows` result items.
    pub fn finish(&self, key: &str, num_rows: i64) -> Result<()> {
        debug!(dataset.key = key, num_rows, "dataset finished");
        self.update_row(
            key,
            "UPDATE datasets SET is_finished = 1, num_rows = ?2 WHERE key = ?1",
            rusqlite::params![key, num_rows],
        )
    }

    /// Mark a dataset finished without results, showing `message` as its
    /// status.
    pub fn finish_with_error(&self, key: &str, message: &str) -> Result<()> {
        warn!(dataset.key = key, message, "dataset finished with error");
        self.update_row(
            key,
            "UPDATE datasets SET is_finished = 1, num_rows = 0, status = ?2 WHERE key = ?1",
            rusqlite::params![key, message],
        )
    }

    pub fn set_parameter(&self, key: &str, name: &str, value: Value) -> Result<()> {
        self.update_parameters(key, |params| {
            params.insert(name.to_string(), value);
        })
    }

    /// Remove one parameter. Returns whether it was present.
    pub fn delete_parameter(&self, key: &str, name: &str) -> Result<bool> {
        self.update_parameters(key, |params| params.shift_remove(name).is_some())
    }

    /// Remove several parameters at once. Returns how many were present.
    pub fn delete_parameters(&self, key: &str, names: &[&str]) -> Result<usize> {
        self.update_parameters(key, |params| {
            names
                .iter()
                .filter(|name| params.shift_remove(**name).is_some())
                .count()
        })
    }

    /// Store annotations for items of `dataset`. Existing annotations with
    /// the same item and label are replaced only when `overwrite` is set.
    /// Returns the number of rows written.
    #[instrument(skip(self, annotations), fields(count = annotations.len()))]
    pub fn add_annotations(
        &self,
        dataset: &str,
        annotations: &[NewAnnotation],
        overwrite: bool,
    ) -> Result<usize> {
        let now = self.clock.now();
        let conflict = if overwrite {
            "DO UPDATE SET value = excluded.value, author = excluded.author,
             by_processor = excluded.by_processor, timestamp = excluded.timestamp"
        } else {
            "DO NOTHING"
        };

        let mut db = self.conn();
        let tx = db.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO annotations
                 (dataset, item_id, label, value, author, by_processor, timestamp, timestamp_created)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(dataset, item_id, label) {conflict}"
            ))?;
            for a in annotations {
                written += stmt.execute(rusqlite::params![
                    dataset,
                    a.item_id,
                    a.label,
                    a.value,
                    a.author,
                    a.by_processor,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn annotations(&self, dataset: &str) -> Result<Vec<Annotation>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT id, dataset, item_id, label, value, author, by_processor,
                    timestamp, timestamp_created
             FROM annotations WHERE dataset = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([dataset], |row| {
            Ok(Annotation {
                id: row.get(0)?,
                dataset: row.get(1)?,
                item_id: row.get(2)?,
                label: row.get(3)?,
                value: row.get(4)?,
                author: row.get(5)?,
                by_processor: row.get(6)?,
                timestamp: row.get(7)?,
                timestamp_created: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn clear_annotations(&self, dataset: &str) -> Result<usize> {
        let n = self
            .conn()
            .execute("DELETE FROM annotations WHERE dataset = ?1", [dataset])?;
        Ok(n)
    }

    /// Delete a dataset and every dataset below it.
    ///
    /// The subtree is collected with an explicit stack and all rows are
    /// removed children-first in one transaction; result files and staging
    /// directories are removed afterwards. Deleting a key that no longer
    /// exists is a no-op. Returns the keys that were deleted.
    #[instrument(skip(self))]
    pub fn delete(&self, key: &str) -> Result<Vec<String>> {
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let root: Option<String> = tx
            .query_row(
                "SELECT result_file FROM datasets WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        let Some(root_file) = root else {
            debug!("dataset already gone");
            return Ok(Vec::new());
        };

        // Pre-order: every dataset appears before its descendants.
        let mut subtree: Vec<(String, String)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut stack = vec![(key.to_string(), root_file)];
        {
            let mut children = tx.prepare("SELECT key, result_file FROM datasets WHERE key_parent = ?1")?;
            while let Some((current, file)) = stack.pop() {
                if !seen.insert(current.clone()) {
                    continue;
                }
                let found = children
                    .query_map([&current], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
                stack.extend(found);
                subtree.push((current, file));
            }
        }

        for (k, _) in subtree.iter().rev() {
            tx.execute("DELETE FROM annotations WHERE dataset = ?1", [k])?;
            tx.execute("DELETE FROM datasets WHERE key = ?1", [k])?;
        }
        tx.commit()?;
        drop(db);

        for (k, file) in &subtree {
            self.remove_artifacts(k, file);
        }
        info!(deleted = subtree.len(), "dataset tree deleted");
        Ok(subtree.into_iter().map(|(k, _)| k).collect())
    }

    // --- private helpers ---------------------------------------------------

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn query_datasets(
        &self,
        clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Dataset>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!("SELECT {DATASET_COLUMNS} FROM datasets {clause}"))?;
        let rows = stmt.query_map(params, row_to_dataset)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn update_row(&self, key: &str, sql: &str, params: impl rusqlite::Params) -> Result<()> {
        let n = self.conn().execute(sql, params)?;
        if n == 0 {
            return Err(DatasetError::NotFound(key.to_string()));
        }
        Ok(())
    }

    fn update_parameters<T>(&self, key: &str, f: impl FnOnce(&mut Map<String, Value>) -> T) -> Result<T> {
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let json: Option<String> = tx
            .query_row("SELECT parameters FROM datasets WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        let Some(json) = json else {
            return Err(DatasetError::NotFound(key.to_string()));
        };
        let mut params: Map<String, Value> = serde_json::from_str(&json)?;
        let out = f(&mut params);
        tx.execute(
            "UPDATE datasets SET parameters = ?2 WHERE key = ?1",
            rusqlite::params![key, Value::Object(params).to_string()],
        )?;
        tx.commit()?;
        Ok(out)
    }

    fn remove_artifacts(&self, key: &str, result_file: &str) {
        if !result_file.is_empty() {
            let path = self.results_dir.join(result_file);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dataset.key = key, path = %path.display(), error = %e, "could not remove result file");
                }
            }
        }
        let staging = self.staging_path(key);
        if let Err(e) = std::fs::remove_dir_all(&staging) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dataset.key = key, path = %staging.display(), error = %e, "could not remove staging directory");
            }
        }
    }
}

/// 32 hex characters identifying a new dataset. Mixes in a random UUID so
/// identical queries made in the same second still get distinct keys.
fn dataset_key(dataset_type: &str, parameters: &Map<String, Value>, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dataset_type.as_bytes());
    hasher.update(Value::Object(parameters.clone()).to_string().as_bytes());
    hasher.update(timestamp.to_le_bytes());
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    let mut key = hex::encode(hasher.finalize());
    key.truncate(32);
    key
}

fn key_exists(db: &Connection, key: &str) -> Result<bool> {
    let found = db
        .query_row("SELECT 1 FROM datasets WHERE key = ?1", [key], |_| Ok(()))
        .optional()?
        .is_some();
    Ok(found)
}

fn row_to_dataset(row: &rusqlite::Row<'_>) -> rusqlite::Result<Dataset> {
    let parameters_json: String = row.get(4)?;
    let parameters: Map<String, Value> = serde_json::from_str(&parameters_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(Dataset {
        key: row.get(0)?,
        key_parent: row.get(1)?,
        dataset_type: row.get(2)?,
        owner: row.get(3)?,
        parameters,
        timestamp: row.get(5)?,
        expires_after: row.get(6)?,
        status: row.get(7)?,
        num_rows: row.get(8)?,
        is_finished: row.get(9)?,
        result_file: row.get(10)?,
        software_version: row.get(11)?,
    })
}
