//! Versioned key/value records.
//!
//! Every record carries a version that starts at `1` and increments on each
//! write. Writers pass the version they last read (`0` for "must not exist");
//! a mismatch is rejected with [`StoreError::VersionConflict`] and nothing is
//! written. The store never retries on the caller's behalf.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const TABLE: &str = "records";

/// A live record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
    /// Key, unique within its namespace.
    pub key: String,
    /// Opaque value bytes.
    pub value: Vec<u8>,
    /// Current version, `>= 1`.
    pub version: u64,
}

/// One operation inside an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreOp {
    /// Create or replace a record.
    Put {
        /// Namespace.
        namespace: String,
        /// Key.
        key: String,
        /// New value.
        value: Vec<u8>,
        /// Version the caller read, `0` to create.
        expected_version: u64,
    },
    /// Remove a record.
    Delete {
        /// Namespace.
        namespace: String,
        /// Key.
        key: String,
        /// Version the caller read.
        expected_version: u64,
    },
}

impl StoreOp {
    fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } => key,
        }
    }

    fn expected_version(&self) -> u64 {
        match self {
            Self::Put {
                expected_version, ..
            }
            | Self::Delete {
                expected_version, ..
            } => *expected_version,
        }
    }
}

/// The operation that caused a batch to roll back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConflict {
    /// Position of the failing op in the batch.
    pub index: usize,
    /// Key of the failing op.
    pub key: String,
    /// Version the op expected.
    pub expected: u64,
    /// Version found, `0` when absent.
    pub actual: u64,
}

/// Result of [`RecordStore::transaction`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// All ops applied. Holds the resulting version per op (`0` for deletes).
    Committed {
        /// Versions in op order.
        versions: Vec<u64>,
    },
    /// Nothing applied.
    RolledBack {
        /// First conflicting op.
        conflict: BatchConflict,
    },
}

impl TransactionOutcome {
    /// Whether the batch took effect.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Repository for versioned records.
#[derive(Clone)]
pub struct RecordStore {
    db: Database,
}

impl RecordStore {
    /// Wrap an opened database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Backing database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Read a live record.
    #[instrument(skip(self))]
    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<StoreRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT value, version FROM records
                 WHERE namespace = ?1 AND key = ?2 AND deleted = 0",
            )?;
            let mut rows = stmt.query(params![namespace, key])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };
            Ok(Some(StoreRecord {
                key: key.to_owned(),
                value: row_helpers::get(row, 0, TABLE, "value")?,
                version: row_helpers::get_version(row, 1, TABLE)?,
            }))
        })
    }

    /// Write `value` if the stored version equals `expected_version`.
    /// Returns the new version.
    #[instrument(skip(self, value), fields(len = value.len()))]
    pub fn put(
        &self,
        namespace: &str,
        key: &str,
        value: &[u8],
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let version = apply_put(&tx, namespace, key, value, expected_version)?;
            tx.commit()?;
            debug!(namespace, key, version, "record written");
            Ok(version)
        })
    }

    /// Delete the record if the stored version equals `expected_version`.
    ///
    /// Deleting an absent key with `expected_version == 0` is `NotFound`;
    /// any other expectation against an absent key is a conflict.
    #[instrument(skip(self))]
    pub fn delete(
        &self,
        namespace: &str,
        key: &str,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            apply_delete(&tx, namespace, key, expected_version)?;
            tx.commit()?;
            debug!(namespace, key, "record deleted");
            Ok(())
        })
    }

    /// Remove the record and its version history if the stored version
    /// equals `expected_version`. Returns `false` when no row existed.
    ///
    /// Leaves no tombstone, so only use it for keys that are never reused.
    #[instrument(skip(self))]
    pub fn purge(
        &self,
        namespace: &str,
        key: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(slot) = read_slot(&tx, namespace, key)? else {
                return Ok(false);
            };
            let actual = slot.visible_version();
            if actual != expected_version {
                return Err(StoreError::VersionConflict {
                    key: key.to_owned(),
                    expected: expected_version,
                    actual,
                });
            }
            let _ = tx.execute(
                "DELETE FROM records WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )?;
            tx.commit()?;
            debug!(namespace, key, "record purged");
            Ok(true)
        })
    }

    /// Rows stored in `namespace`, tombstones included.
    pub fn row_count(&self, namespace: &str) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records WHERE namespace = ?1",
                [namespace],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }

    /// Apply `ops` atomically. Any conflicting op rolls back the whole batch.
    ///
    /// Ops see the effects of earlier ops in the same batch, so a put
    /// followed by a put on the same key must thread the version.
    /// A `Database` error also rolls back and is returned as `Err`.
    #[instrument(skip_all, fields(ops = ops.len()))]
    pub fn transaction(&self, ops: &[StoreOp]) -> Result<TransactionOutcome, StoreError> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut versions = Vec::with_capacity(ops.len());
            for (index, op) in ops.iter().enumerate() {
                let applied = match op {
                    StoreOp::Put {
                        namespace,
                        key,
                        value,
                        expected_version,
                    } => apply_put(&tx, namespace, key, value, *expected_version),
                    StoreOp::Delete {
                        namespace,
                        key,
                        expected_version,
                    } => apply_delete(&tx, namespace, key, *expected_version).map(|()| 0),
                };
                match applied {
                    Ok(version) => versions.push(version),
                    Err(StoreError::VersionConflict { key, expected, actual }) => {
                        tx.rollback()?;
                        debug!(index, key, expected, actual, "batch rolled back");
                        return Ok(TransactionOutcome::RolledBack {
                            conflict: BatchConflict {
                                index,
                                key,
                                expected,
                                actual,
                            },
                        });
                    }
                    Err(StoreError::NotFound { .. }) => {
                        tx.rollback()?;
                        debug!(index, key = op.key(), "batch rolled back on missing key");
                        return Ok(TransactionOutcome::RolledBack {
                            conflict: BatchConflict {
                                index,
                                key: op.key().to_owned(),
                                expected: op.expected_version(),
                                actual: 0,
                            },
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
            tx.commit()?;
            Ok(TransactionOutcome::Committed { versions })
        })
    }

    /// Live keys in `namespace`, sorted.
    pub fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT key FROM records WHERE namespace = ?1 AND deleted = 0 ORDER BY key",
            )?;
            let mut rows = stmt.query([namespace])?;
            let mut keys = Vec::new();
            while let Some(row) = rows.next()? {
                keys.push(row_helpers::get(row, 0, TABLE, "key")?);
            }
            Ok(keys)
        })
    }
}

/// Stored version slot, including tombstones.
struct Slot {
    version: u64,
    live: bool,
}

impl Slot {
    fn visible_version(&self) -> u64 {
        if self.live { self.version } else { 0 }
    }
}

fn read_slot(conn: &Connection, namespace: &str, key: &str) -> Result<Option<Slot>, StoreError> {
    let row = conn
        .query_row(
            "SELECT version, deleted FROM records WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?)),
        )
        .optional()?;
    row.map(|(version, deleted)| {
        let version = u64::try_from(version).map_err(|_| StoreError::CorruptRow {
            table: TABLE,
            column: "version",
            detail: format!("negative version {version}"),
        })?;
        Ok(Slot {
            version,
            live: !deleted,
        })
    })
    .transpose()
}

fn apply_put(
    conn: &Connection,
    namespace: &str,
    key: &str,
    value: &[u8],
    expected_version: u64,
) -> Result<u64, StoreError> {
    let slot = read_slot(conn, namespace, key)?;
    let actual = slot.as_ref().map_or(0, Slot::visible_version);
    if actual != expected_version {
        return Err(StoreError::VersionConflict {
            key: key.to_owned(),
            expected: expected_version,
            actual,
        });
    }
    let next = slot.map_or(0, |s| s.version) + 1;
    let _ = conn.execute(
        "INSERT INTO records (namespace, key, value, version, deleted, updated_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)
         ON CONFLICT (namespace, key) DO UPDATE SET
             value = excluded.value,
             version = excluded.version,
             deleted = 0,
             updated_at = excluded.updated_at",
        params![
            namespace,
            key,
            value,
            row_helpers::version_param(next)?,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(next)
}

fn apply_delete(
    conn: &Connection,
    namespace: &str,
    key: &str,
    expected_version: u64,
) -> Result<(), StoreError> {
    let slot = read_slot(conn, namespace, key)?;
    let actual = slot.as_ref().map_or(0, Slot::visible_version);
    if actual == 0 && expected_version == 0 {
        return Err(StoreError::NotFound {
            namespace: namespace.to_owned(),
            key: key.to_owned(),
        });
    }
    if actual != expected_version {
        return Err(StoreError::VersionConflict {
            key: key.to_owned(),
            expected: expected_version,
            actual,
        });
    }
    let _ = conn.execute(
        "UPDATE records SET value = NULL, deleted = 1, version = version + 1, updated_at = ?3
         WHERE namespace = ?1 AND key = ?2",
        params![namespace, key, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}
