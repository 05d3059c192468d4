//! SQLite repository.
//!
//! Every mutating call runs in an `IMMEDIATE` transaction and finishes with a
//! conditional single-row update, so concurrent writers serialize on the row
//! they touch and a stale version check persists nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::records::{
    KeyRecord, KeyStatus, TransactionCounts, TransactionMetadata, TransactionRecord,
    TransactionStatus, Transition, TransitionOutcome,
};
use crate::repository::{
    require_bindable, KeyRepository, PredecessorUpdate, TransactionRepository, META_REPLACED_BY,
    META_ROTATED_FROM,
};
use keyledger_common::{Error, KeyId, RequestContext, Result, TransactionId, UserId};
use keyledger_crypto::Algorithm;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS keys (
    id TEXT PRIMARY KEY,
    algorithm TEXT NOT NULL,
    key_length INTEGER NOT NULL,
    sealed_material BLOB NOT NULL,
    status TEXT NOT NULL,
    version INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    rotated_at INTEGER,
    revoked_at INTEGER,
    expired_at INTEGER,
    metadata TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_keys_status ON keys(status);

CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    key_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    status TEXT NOT NULL,
    algorithm TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    context TEXT NOT NULL,
    metadata TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transactions_pending ON transactions(status, started_at);

CREATE TABLE IF NOT EXISTS store_meta (
    name TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
"#;

const KEY_COLUMNS: &str = "id, algorithm, key_length, sealed_material, status, version, \
     created_at, expires_at, rotated_at, revoked_at, expired_at, metadata";

const TRANSACTION_COLUMNS: &str =
    "id, user_id, key_id, operation, status, algorithm, started_at, context, metadata";

fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Timestamps are stored as microseconds since the epoch so they sort as integers.
fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Serialization(format!("Timestamp out of range: {}", micros)))
}

fn opt_from_micros(micros: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    micros.map(from_micros).transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| Error::Serialization(e.to_string()))
}

/// Columns of a `keys` row before validation.
struct KeyRow {
    id: String,
    algorithm: String,
    key_length: u32,
    sealed_material: Vec<u8>,
    status: String,
    version: i64,
    created_at: i64,
    expires_at: i64,
    rotated_at: Option<i64>,
    revoked_at: Option<i64>,
    expired_at: Option<i64>,
    metadata: String,
}

impl KeyRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            algorithm: row.get(1)?,
            key_length: row.get(2)?,
            sealed_material: row.get(3)?,
            status: row.get(4)?,
            version: row.get(5)?,
            created_at: row.get(6)?,
            expires_at: row.get(7)?,
            rotated_at: row.get(8)?,
            revoked_at: row.get(9)?,
            expired_at: row.get(10)?,
            metadata: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<KeyRecord> {
        Ok(KeyRecord {
            id: KeyId::new(self.id)?,
            algorithm: self.algorithm.parse::<Algorithm>()?,
            key_length: self.key_length,
            sealed_material: self.sealed_material,
            status: self.status.parse()?,
            version: self.version as u64,
            created_at: from_micros(self.created_at)?,
            expires_at: from_micros(self.expires_at)?,
            rotated_at: opt_from_micros(self.rotated_at)?,
            revoked_at: opt_from_micros(self.revoked_at)?,
            expired_at: opt_from_micros(self.expired_at)?,
            metadata: from_json::<BTreeMap<String, String>>(&self.metadata)?,
        })
    }
}

/// Columns of a `transactions` row before validation.
struct TransactionRow {
    id: String,
    user_id: String,
    key_id: String,
    operation: String,
    status: String,
    algorithm: String,
    started_at: i64,
    context: String,
    metadata: String,
}

impl TransactionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            key_id: row.get(2)?,
            operation: row.get(3)?,
            status: row.get(4)?,
            algorithm: row.get(5)?,
            started_at: row.get(6)?,
            context: row.get(7)?,
            metadata: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<TransactionRecord> {
        Ok(TransactionRecord {
            id: TransactionId::new(self.id)?,
            user_id: UserId::new(self.user_id)?,
            key_id: KeyId::new(self.key_id)?,
            operation: self.operation.parse()?,
            status: self.status.parse()?,
            algorithm: self.algorithm.parse::<Algorithm>()?,
            started_at: from_micros(self.started_at)?,
            context: from_json::<RequestContext>(&self.context)?,
            metadata: from_json::<TransactionMetadata>(&self.metadata)?,
        })
    }
}

fn load_key(conn: &Connection, id: &KeyId) -> Result<Option<KeyRecord>> {
    let sql = format!("SELECT {} FROM keys WHERE id = ?1", KEY_COLUMNS);
    let row = conn
        .query_row(&sql, [id.as_str()], KeyRow::from_row)
        .optional()
        .map_err(db_err)?;
    row.map(KeyRow::into_record).transpose()
}

fn load_keys(conn: &Connection, filter: &str) -> Result<Vec<KeyRecord>> {
    let sql = format!(
        "SELECT {} FROM keys {} ORDER BY created_at, id",
        KEY_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map([], KeyRow::from_row)
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    rows.into_iter().map(KeyRow::into_record).collect()
}

fn insert_key(conn: &Connection, key: &KeyRecord) -> Result<()> {
    let sql = format!(
        "INSERT INTO keys ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        KEY_COLUMNS
    );
    conn.execute(
        &sql,
        params![
            key.id.as_str(),
            key.algorithm.as_str(),
            key.key_length,
            key.sealed_material,
            key.status.as_str(),
            key.version as i64,
            to_micros(key.created_at),
            to_micros(key.expires_at),
            key.rotated_at.map(to_micros),
            key.revoked_at.map(to_micros),
            key.expired_at.map(to_micros),
            to_json(&key.metadata)?,
        ],
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            Error::AlreadyExists(format!("Key already exists: {}", key.id))
        } else {
            db_err(e)
        }
    })?;
    Ok(())
}

/// Write the mutable columns of `key` if the stored version is still `expected_version`.
fn update_key_if_version(conn: &Connection, key: &KeyRecord, expected_version: u64) -> Result<()> {
    let changed = conn
        .execute(
            r#"
            UPDATE keys
            SET status = ?1, version = ?2, rotated_at = ?3, revoked_at = ?4,
                expired_at = ?5, metadata = ?6
            WHERE id = ?7 AND version = ?8
            "#,
            params![
                key.status.as_str(),
                key.version as i64,
                key.rotated_at.map(to_micros),
                key.revoked_at.map(to_micros),
                key.expired_at.map(to_micros),
                to_json(&key.metadata)?,
                key.id.as_str(),
                expected_version as i64,
            ],
        )
        .map_err(db_err)?;

    if changed != 1 {
        return Err(Error::Conflict(format!(
            "key {} changed concurrently",
            key.id
        )));
    }
    Ok(())
}

fn load_transaction(conn: &Connection, id: &TransactionId) -> Result<Option<TransactionRecord>> {
    let sql = format!(
        "SELECT {} FROM transactions WHERE id = ?1",
        TRANSACTION_COLUMNS
    );
    let row = conn
        .query_row(&sql, [id.as_str()], TransactionRow::from_row)
        .optional()
        .map_err(db_err)?;
    row.map(TransactionRow::into_record).transpose()
}

/// SQLite-backed repository for keys and transactions.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Create or open a database file.
    ///
    /// # Errors
    /// - Database creation or schema initialization failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db_err)?;
        // Other processes (the operator CLI) share the file.
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        info!(path = %db_path.as_ref().display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::lock_poisoned("sqlite connection"))
    }
}

#[async_trait]
impl KeyRepository for SqliteRepository {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn activate(
        &self,
        mut key: KeyRecord,
        predecessor: Option<PredecessorUpdate>,
    ) -> Result<()> {
        if key.status != KeyStatus::Active {
            return Err(Error::InvalidInput(format!(
                "key {} must be active to activate, is {}",
                key.id, key.status
            )));
        }

        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let active = load_keys(&tx, "WHERE status = 'active'")?;

        match predecessor {
            None => {
                if let Some(existing) = active.first() {
                    return Err(Error::Conflict(format!(
                        "key {} is already active",
                        existing.id
                    )));
                }
                insert_key(&tx, &key)?;
            }
            Some(update) => {
                if active.iter().any(|k| k.id != update.id) {
                    return Err(Error::Conflict(format!(
                        "another key than {} is active",
                        update.id
                    )));
                }

                let mut previous = load_key(&tx, &update.id)?
                    .ok_or_else(|| Error::NotFound(format!("Key not found: {}", update.id)))?;

                if previous.version != update.expected_version
                    || previous.status != KeyStatus::Active
                {
                    return Err(Error::Conflict(format!(
                        "key {} changed (version {}, status {})",
                        previous.id, previous.version, previous.status
                    )));
                }

                previous.transition(update.status, update.at)?;
                previous
                    .metadata
                    .insert(META_REPLACED_BY.to_string(), key.id.to_string());
                key.metadata
                    .insert(META_ROTATED_FROM.to_string(), previous.id.to_string());

                insert_key(&tx, &key)?;
                update_key_if_version(&tx, &previous, update.expected_version)?;
            }
        }

        tx.commit().map_err(db_err)?;
        debug!(key_id = %key.id, "key activated");
        Ok(())
    }

    async fn get_key(&self, id: &KeyId) -> Result<Option<KeyRecord>> {
        let conn = self.conn()?;
        load_key(&conn, id)
    }

    async fn active_keys(&self) -> Result<Vec<KeyRecord>> {
        let conn = self.conn()?;
        load_keys(&conn, "WHERE status = 'active'")
    }

    async fn list_keys(&self) -> Result<Vec<KeyRecord>> {
        let conn = self.conn()?;
        load_keys(&conn, "")
    }

    async fn update_key_status(
        &self,
        id: &KeyId,
        expected_version: u64,
        status: KeyStatus,
        at: DateTime<Utc>,
    ) -> Result<KeyRecord> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let mut record = load_key(&tx, id)?
            .ok_or_else(|| Error::NotFound(format!("Key not found: {}", id)))?;

        if record.version != expected_version {
            return Err(Error::Conflict(format!(
                "key {} is at version {}, expected {}",
                id, record.version, expected_version
            )));
        }

        record.transition(status, at)?;
        update_key_if_version(&tx, &record, expected_version)?;
        tx.commit().map_err(db_err)?;
        Ok(record)
    }

    async fn get_meta(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT value FROM store_meta WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    async fn put_meta(&self, name: &str, value: Vec<u8>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO store_meta (name, value) VALUES (?1, ?2)",
            params![name, value],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for SqliteRepository {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn insert_transaction(&self, record: TransactionRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let status = tx
            .query_row(
                "SELECT status FROM keys WHERE id = ?1",
                params![record.key_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?
            .map(|s| s.parse::<KeyStatus>())
            .transpose()?;
        require_bindable(&record.key_id, status)?;

        let sql = format!(
            "INSERT INTO transactions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            TRANSACTION_COLUMNS
        );
        tx.execute(
            &sql,
            params![
                record.id.as_str(),
                record.user_id.as_str(),
                record.key_id.as_str(),
                record.operation.as_str(),
                record.status.as_str(),
                record.algorithm.as_str(),
                to_micros(record.started_at),
                to_json(&record.context)?,
                to_json(&record.metadata)?,
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::AlreadyExists(format!("Transaction already exists: {}", record.id))
            } else {
                db_err(e)
            }
        })?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    async fn get_transaction(&self, id: &TransactionId) -> Result<Option<TransactionRecord>> {
        let conn = self.conn()?;
        load_transaction(&conn, id)
    }

    async fn apply_transition(
        &self,
        id: &TransactionId,
        transition: &Transition,
    ) -> Result<(TransactionRecord, TransitionOutcome)> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let mut record = load_transaction(&tx, id)?
            .ok_or_else(|| Error::NotFound(format!("Transaction not found: {}", id)))?;
        let previous_status = record.status;

        let outcome = record.apply(transition)?;
        if outcome == TransitionOutcome::Unchanged {
            return Ok((record, outcome));
        }

        let changed = tx
            .execute(
                "UPDATE transactions SET status = ?1, metadata = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    record.status.as_str(),
                    to_json(&record.metadata)?,
                    id.as_str(),
                    previous_status.as_str(),
                ],
            )
            .map_err(db_err)?;
        if changed != 1 {
            return Err(Error::Conflict(format!(
                "transaction {} changed concurrently",
                id
            )));
        }

        tx.commit().map_err(db_err)?;
        Ok((record, outcome))
    }

    async fn pending_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TransactionRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM transactions WHERE status = ?1 AND started_at < ?2 ORDER BY started_at",
            TRANSACTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![TransactionStatus::Pending.as_str(), to_micros(cutoff)],
                TransactionRow::from_row,
            )
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(TransactionRow::into_record).collect()
    }

    async fn count_by_status(&self) -> Result<TransactionCounts> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM transactions GROUP BY status")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        let mut counts = TransactionCounts::default();
        for (status, n) in rows {
            counts.add(status.parse()?, n as u64);
        }
        Ok(counts)
    }
}
