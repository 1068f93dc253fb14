use chrono::{DateTime, Utc};
use pf_core::{QaRow, SessionKey};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Number, Value};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const SESSION_SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const READ_ONLY_PREFIXES: [&str; 2] = ["select", "pragma"];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("row {index} has blank key columns: {}", columns.join(", "))]
    BlankKeyColumns {
        index: usize,
        columns: Vec<&'static str>,
    },
    #[error("only SELECT or PRAGMA statements are allowed")]
    ReadOnlyViolation,
    #[error("unsupported query parameter at position {position}: {reason}")]
    InvalidParameter { position: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAllocation {
    pub chunk_id: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub truncated: bool,
}

/// Host-side `therapy.db`: cleaned QA rows plus the chunk id ledger.
///
/// Callers are expected to open one store per operation and drop it right
/// after; there is no pooling.
pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SESSION_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SESSION_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_session_export.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Inserts or replaces the non-key columns of every row in one
    /// transaction. Rows are checked up front, so a bad row aborts the whole
    /// batch before anything is written.
    pub fn upsert_qa_rows(&mut self, rows: &[QaRow]) -> Result<usize, StorageError> {
        for (index, row) in rows.iter().enumerate() {
            let columns = row.blank_key_columns();
            if !columns.is_empty() {
                return Err(StorageError::BlankKeyColumns { index, columns });
            }
        }

        let tx = self.conn.transaction()?;
        {
            let mut statement = tx.prepare(
                "
                INSERT INTO qa_pairs (
                    patient_id,
                    session_type,
                    session_date,
                    turn_id,
                    speaker,
                    text_raw,
                    text_clean
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(patient_id, session_type, session_date, turn_id) DO UPDATE SET
                    speaker=excluded.speaker,
                    text_raw=excluded.text_raw,
                    text_clean=excluded.text_clean
                ",
            )?;
            for row in rows {
                statement.execute(params![
                    row.patient_id,
                    row.session_type,
                    row.session_date,
                    row.turn_id,
                    row.speaker,
                    row.text_raw,
                    row.text_clean,
                ])?;
            }
        }
        tx.commit()?;

        Ok(rows.len())
    }

    pub fn qa_row(&self, key: &SessionKey, turn_id: i64) -> Result<Option<QaRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT patient_id, session_type, session_date, turn_id, speaker, text_raw, text_clean
                FROM qa_pairs
                WHERE patient_id = ?1 AND session_type = ?2 AND session_date = ?3 AND turn_id = ?4
                ",
                params![
                    key.patient_id(),
                    key.session_type(),
                    key.session_date(),
                    turn_id
                ],
                |row| {
                    Ok(QaRow {
                        patient_id: row.get(0)?,
                        session_type: row.get(1)?,
                        session_date: row.get(2)?,
                        turn_id: row.get(3)?,
                        speaker: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        text_raw: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                        text_clean: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;

        Ok(row)
    }

    pub fn qa_row_count(&self, key: &SessionKey) -> Result<i64, StorageError> {
        let count = self.conn.query_row(
            "
            SELECT COUNT(*) FROM qa_pairs
            WHERE patient_id = ?1 AND session_type = ?2 AND session_date = ?3
            ",
            params![key.patient_id(), key.session_type(), key.session_date()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Runs a caller-supplied read statement.
    ///
    /// The guard is a prefix whitelist (`SELECT`/`PRAGMA`, case-insensitive)
    /// backed by SQLite's `query_only` mode for the duration of the call. It
    /// is not a SQL parser: a SELECT whose string literals mention `insert`
    /// passes the prefix check, which is accepted.
    pub fn query(
        &self,
        sql: &str,
        params: &[Value],
        limit: Option<usize>,
    ) -> Result<QueryRows, StorageError> {
        if !is_read_only_statement(sql) {
            return Err(StorageError::ReadOnlyViolation);
        }
        let bound = params
            .iter()
            .enumerate()
            .map(|(position, value)| json_to_sql(position, value))
            .collect::<Result<Vec<_>, _>>()?;

        self.conn.pragma_update(None, "query_only", true)?;
        let result = self.run_query(sql, bound, limit);
        self.conn.pragma_update(None, "query_only", false)?;
        result
    }

    fn run_query(
        &self,
        sql: &str,
        bound: Vec<SqlValue>,
        limit: Option<usize>,
    ) -> Result<QueryRows, StorageError> {
        let mut statement = self.conn.prepare(sql)?;
        let columns = statement
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let column_count = columns.len();
        let limit = limit.filter(|limit| *limit > 0);

        let mut rows = statement.query(params_from_iter(bound))?;
        let mut collected = Vec::new();
        let mut truncated = false;
        while let Some(row) = rows.next()? {
            if limit.is_some_and(|limit| collected.len() >= limit) {
                truncated = true;
                break;
            }
            let mut values = Vec::with_capacity(column_count);
            for index in 0..column_count {
                values.push(sql_to_json(row.get_ref(index)?));
            }
            collected.push(values);
        }

        Ok(QueryRows {
            columns,
            rows: collected,
            truncated,
        })
    }

    /// Allocates the next chunk id for `key` inside an immediate transaction,
    /// so the read of the current maximum and the insert of its successor
    /// cannot interleave with another writer. The id is committed before it
    /// is returned.
    pub fn next_chunk_id(&mut self, key: &SessionKey) -> Result<u64, StorageError> {
        let session_key = key.storage_key();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(chunk_id) + 1, 0) FROM chunks WHERE session_key = ?1",
            [&session_key],
            |row| row.get(0),
        )?;
        tx.execute(
            "
            INSERT INTO chunks (
                session_key,
                patient_id,
                session_type,
                session_date,
                chunk_id,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                session_key,
                key.patient_id(),
                key.session_type(),
                key.session_date(),
                next,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        Ok(next as u64)
    }

    pub fn chunk_allocations(&self, key: &SessionKey) -> Result<Vec<ChunkAllocation>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT chunk_id, created_at
            FROM chunks
            WHERE session_key = ?1
            ORDER BY chunk_id ASC
            ",
        )?;

        let rows = statement.query_map([key.storage_key()], |row| {
            let created_at = DateTime::parse_from_rfc3339(&row.get::<_, String>(1)?)
                .map(|timestamp| timestamp.with_timezone(&Utc))
                .map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?;
            Ok(ChunkAllocation {
                chunk_id: row.get::<_, i64>(0)? as u64,
                created_at,
            })
        })?;

        let mut allocations = Vec::new();
        for row in rows {
            allocations.push(row?);
        }
        Ok(allocations)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

pub fn is_read_only_statement(sql: &str) -> bool {
    let lowered = sql.trim_start().to_ascii_lowercase();
    READ_ONLY_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
}

fn json_to_sql(position: usize, value: &Value) -> Result<SqlValue, StorageError> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(flag) => Ok(SqlValue::Integer(i64::from(*flag))),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Ok(SqlValue::Integer(int))
            } else if let Some(float) = number.as_f64() {
                Ok(SqlValue::Real(float))
            } else {
                Err(StorageError::InvalidParameter {
                    position,
                    reason: format!("number out of range: {number}"),
                })
            }
        }
        Value::String(text) => Ok(SqlValue::Text(text.clone())),
        Value::Array(_) | Value::Object(_) => Err(StorageError::InvalidParameter {
            position,
            reason: "arrays and objects cannot be bound".to_string(),
        }),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => Value::from(int),
        ValueRef::Real(float) => Number::from_f64(float)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn key() -> SessionKey {
        SessionKey::new("p1", "therapy", "2025-01-01").expect("valid key")
    }

    fn row(turn_id: i64, speaker: &str, text_clean: &str) -> QaRow {
        QaRow::for_session(&key(), turn_id, speaker, text_clean.to_lowercase(), text_clean)
    }

    #[test]
    fn migration_creates_export_tables() {
        let db = SessionStore::open_in_memory().expect("open db");

        for table in ["qa_pairs", "chunks"] {
            assert!(db.table_exists(table).expect("table check"));
        }
        assert_eq!(
            db.schema_version().expect("schema version"),
            SESSION_SCHEMA_VERSION
        );

        db.migrate().expect("second migrate is a no-op");
    }

    #[test]
    fn upsert_same_key_twice_keeps_single_latest_row() {
        let mut db = SessionStore::open_in_memory().expect("open db");

        db.upsert_qa_rows(&[row(1, "Client", "Hi.")])
            .expect("first upsert");
        db.upsert_qa_rows(&[row(1, "Client", "Hello there.")])
            .expect("second upsert");

        assert_eq!(db.qa_row_count(&key()).expect("count"), 1);
        let stored = db.qa_row(&key(), 1).expect("load").expect("row exists");
        assert_eq!(stored.text_clean, "Hello there.");
        assert_eq!(stored.text_raw, "hello there.");
    }

    #[test]
    fn upsert_rejects_whole_batch_when_any_row_has_blank_key() {
        let mut db = SessionStore::open_in_memory().expect("open db");
        let mut bad = row(2, "Therapist", "Go on.");
        bad.patient_id = String::new();

        let err = db
            .upsert_qa_rows(&[row(1, "Client", "Hi."), bad])
            .expect_err("blank key");
        assert!(matches!(err, StorageError::BlankKeyColumns { index: 1, .. }));
        assert_eq!(db.qa_row_count(&key()).expect("count"), 0);
    }

    #[test]
    fn query_returns_columns_rows_and_honours_limit() {
        let mut db = SessionStore::open_in_memory().expect("open db");
        db.upsert_qa_rows(&[
            row(1, "Client", "Hi."),
            row(2, "Therapist", "Welcome."),
            row(3, "Client", "Thanks."),
        ])
        .expect("upsert");

        let result = db
            .query(
                "SELECT turn_id, speaker FROM qa_pairs WHERE patient_id = ?1 ORDER BY turn_id",
                &[json!("p1")],
                Some(2),
            )
            .expect("query");

        assert_eq!(result.columns, vec!["turn_id", "speaker"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[1], vec![json!(2), json!("Therapist")]);
        assert!(result.truncated);

        let count = db
            .query("  select count(*) from qa_pairs", &[], None)
            .expect("count query");
        assert_eq!(count.rows, vec![vec![json!(3)]]);
        assert!(!count.truncated);
    }

    #[test]
    fn query_rejects_non_read_statements() {
        let mut db = SessionStore::open_in_memory().expect("open db");
        db.upsert_qa_rows(&[row(1, "Client", "Hi.")])
            .expect("upsert");

        for sql in [
            "DELETE FROM qa_pairs",
            "WITH doomed AS (SELECT 1) DELETE FROM qa_pairs",
            "drop table qa_pairs",
        ] {
            let err = db.query(sql, &[], None).expect_err("rejected");
            assert!(matches!(err, StorageError::ReadOnlyViolation));
        }
        assert_eq!(db.qa_row_count(&key()).expect("count"), 1);

        // Prefix check only: literals mentioning writes are fine inside a SELECT.
        let result = db
            .query("SELECT 'insert into qa_pairs' AS note", &[], None)
            .expect("select literal");
        assert_eq!(result.rows[0][0], json!("insert into qa_pairs"));
    }

    #[test]
    fn query_rejects_structured_parameters() {
        let db = SessionStore::open_in_memory().expect("open db");
        let err = db
            .query("SELECT ?1", &[json!({"a": 1})], None)
            .expect_err("object parameter");
        assert!(matches!(
            err,
            StorageError::InvalidParameter { position: 0, .. }
        ));
    }

    #[test]
    fn chunk_ids_increase_and_survive_reopen() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("export").join("therapy.db");

        {
            let mut db = SessionStore::open(&path).expect("open db");
            let ids = (0..3)
                .map(|_| db.next_chunk_id(&key()).expect("next id"))
                .collect::<Vec<_>>();
            assert_eq!(ids, vec![0, 1, 2]);
        }

        let mut reopened = SessionStore::open(&path).expect("reopen db");
        assert_eq!(reopened.next_chunk_id(&key()).expect("next id"), 3);

        let other = SessionKey::new("p2", "therapy", "2025-01-01").expect("key");
        assert_eq!(reopened.next_chunk_id(&other).expect("other session"), 0);

        let allocations = reopened.chunk_allocations(&key()).expect("allocations");
        assert_eq!(
            allocations
                .iter()
                .map(|allocation| allocation.chunk_id)
                .collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn interleaved_connections_never_share_an_id() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("therapy.db");
        let mut first = SessionStore::open(&path).expect("first connection");
        let mut second = SessionStore::open(&path).expect("second connection");

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(first.next_chunk_id(&key()).expect("first"));
            ids.push(second.next_chunk_id(&key()).expect("second"));
        }
        assert_eq!(ids, (0..8).collect::<Vec<u64>>());
    }
}
