//! SQLite ledger of datasets, shards and answered queries.
//!
//! Consistency contract:
//! - shard rows are insert-only; a trigger rejects updates to their public data or proof
//! - a shard insert and the matching `shards_done` increment commit in one transaction
//! - terminal dataset transitions only apply to a `generating` row, so they happen at most once
//! - `verified` may only move from NULL to a value

use crate::models::{DatasetStatus, Metric};
use chrono::{DateTime, Utc};
use cohort_zk::constants::NUM_BUCKETS;
use cohort_zk::ShardStats;
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

pub type Db = Pool<Sqlite>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("dataset {dataset_id} is no longer generating")]
    NotGenerating { dataset_id: Uuid },
}

// Primary SQLite result codes; sqlx reports the extended code as a decimal string.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl LedgerError {
    /// Lock contention, I/O and pool exhaustion may clear up on retry. Constraint and trigger
    /// aborts, state conflicts and corrupt rows fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Sqlx(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut) => true,
            LedgerError::Sqlx(sqlx::Error::Database(e)) => e
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
            _ => false,
        }
    }
}

const SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS datasets (
  id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  dataset_size INTEGER NOT NULL,
  shard_size INTEGER NOT NULL,
  num_buckets INTEGER NOT NULL,
  status TEXT NOT NULL,
  shards_total INTEGER NOT NULL,
  shards_done INTEGER NOT NULL DEFAULT 0,
  dataset_commitment_hex TEXT,
  error TEXT
)"#,
    r#"
CREATE TABLE IF NOT EXISTS shards (
  dataset_id TEXT NOT NULL,
  shard_index INTEGER NOT NULL,
  shard_commitment_hex TEXT NOT NULL,
  stats_json TEXT NOT NULL,
  proof_b64 TEXT NOT NULL,
  verified INTEGER,
  PRIMARY KEY(dataset_id, shard_index)
)"#,
    r#"
CREATE TRIGGER IF NOT EXISTS shards_immutable
BEFORE UPDATE OF dataset_id, shard_index, shard_commitment_hex, stats_json, proof_b64 ON shards
BEGIN
  SELECT RAISE(ABORT, 'shard rows are immutable');
END"#,
    r#"
CREATE TABLE IF NOT EXISTS queries (
  id TEXT PRIMARY KEY,
  dataset_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  query_json TEXT NOT NULL,
  result_json TEXT NOT NULL,
  verified INTEGER NOT NULL
)"#,
];

#[derive(Clone, Debug)]
pub struct DatasetRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub dataset_size: u64,
    pub shard_size: u64,
    pub num_buckets: u64,
    pub status: DatasetStatus,
    pub shards_total: u64,
    pub shards_done: u64,
    pub dataset_commitment_hex: Option<String>,
    pub error: Option<String>,
}

/// One proved shard as written by the generation job.
#[derive(Clone, Debug)]
pub struct NewShard {
    pub shard_index: u64,
    pub shard_commitment_hex: String,
    pub stats: ShardStats,
    pub proof_b64: String,
    pub verified: bool,
}

#[derive(Clone, Debug)]
pub struct ShardRow {
    pub shard_index: u64,
    pub shard_commitment_hex: String,
    pub stats: ShardStats,
    pub verified: Option<bool>,
    pub proof_b64: Option<String>,
}

/// What a successful query leaves in the audit log.
#[derive(Clone, Debug)]
pub struct QueryLogEntry {
    pub query_id: Uuid,
    pub dataset_id: Uuid,
    pub metric: Metric,
    pub bucket_index: usize,
    pub sum: u64,
    pub count: u64,
    pub mean: Option<f64>,
    pub verified: bool,
}

fn verified_to_sql(v: Option<bool>) -> Option<i64> {
    v.map(|b| if b { 1 } else { 0 })
}

#[derive(Clone, Debug)]
pub struct Ledger {
    db: Db,
}

impl Ledger {
    /// Open (creating if needed) the SQLite file at `path` and make sure the schema exists.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let ledger = Self { db };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    async fn init_schema(&self) -> Result<(), LedgerError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.db).await?;
        }
        Ok(())
    }

    pub async fn insert_dataset(
        &self,
        dataset_id: Uuid,
        dataset_size: u64,
        shard_size: u64,
        shards_total: u64,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"INSERT INTO datasets
               (id, created_at, dataset_size, shard_size, num_buckets, status, shards_total, shards_done)
               VALUES (?, ?, ?, ?, ?, ?, ?, 0)"#,
        )
        .bind(dataset_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(dataset_size as i64)
        .bind(shard_size as i64)
        .bind(NUM_BUCKETS as i64)
        .bind(DatasetStatus::Generating.as_str())
        .bind(shards_total as i64)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn get_dataset(&self, dataset_id: Uuid) -> Result<Option<DatasetRow>, LedgerError> {
        let row = sqlx::query(
            r#"SELECT created_at, dataset_size, shard_size, num_buckets, status, shards_total, shards_done,
                      dataset_commitment_hex, error
               FROM datasets WHERE id = ?"#,
        )
        .bind(dataset_id.to_string())
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else { return Ok(None); };

        let created_at: String = row.get("created_at");
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| LedgerError::Corrupt(format!("created_at: {e}")))?
            .with_timezone(&Utc);
        let status: String = row.get("status");
        let status = status.parse::<DatasetStatus>().map_err(LedgerError::Corrupt)?;

        Ok(Some(DatasetRow {
            id: dataset_id,
            created_at,
            dataset_size: row.get::<i64, _>("dataset_size") as u64,
            shard_size: row.get::<i64, _>("shard_size") as u64,
            num_buckets: row.get::<i64, _>("num_buckets") as u64,
            status,
            shards_total: row.get::<i64, _>("shards_total") as u64,
            shards_done: row.get::<i64, _>("shards_done") as u64,
            dataset_commitment_hex: row.get("dataset_commitment_hex"),
            error: row.get("error"),
        }))
    }

    /// Persist a shard and advance `shards_done` atomically.
    ///
    /// Readers never see `shards_done` count a shard whose row is not yet visible.
    pub async fn insert_shard(&self, dataset_id: Uuid, shard: &NewShard) -> Result<(), LedgerError> {
        let stats_json =
            serde_json::to_string(&shard.stats).map_err(|e| LedgerError::Corrupt(format!("stats: {e}")))?;

        let mut tx = self.db.begin().await?;

        let advanced = sqlx::query(
            r#"UPDATE datasets SET shards_done = shards_done + 1
               WHERE id = ? AND status = 'generating' AND shards_done < shards_total"#,
        )
        .bind(dataset_id.to_string())
        .execute(&mut *tx)
        .await?;
        if advanced.rows_affected() != 1 {
            return Err(LedgerError::NotGenerating { dataset_id });
        }

        sqlx::query(
            r#"INSERT INTO shards
               (dataset_id, shard_index, shard_commitment_hex, stats_json, proof_b64, verified)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(dataset_id.to_string())
        .bind(shard.shard_index as i64)
        .bind(&shard.shard_commitment_hex)
        .bind(stats_json)
        .bind(&shard.proof_b64)
        .bind(verified_to_sql(Some(shard.verified)))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn set_dataset_ready(&self, dataset_id: Uuid, commitment_hex: &str) -> Result<(), LedgerError> {
        let res = sqlx::query(
            r#"UPDATE datasets SET status = 'ready', dataset_commitment_hex = ?, error = NULL
               WHERE id = ? AND status = 'generating'"#,
        )
        .bind(commitment_hex)
        .bind(dataset_id.to_string())
        .execute(&self.db)
        .await?;
        if res.rows_affected() != 1 {
            return Err(LedgerError::NotGenerating { dataset_id });
        }
        Ok(())
    }

    pub async fn set_dataset_failed(&self, dataset_id: Uuid, error: &str) -> Result<(), LedgerError> {
        let res = sqlx::query(
            r#"UPDATE datasets SET status = 'failed', error = ?, dataset_commitment_hex = NULL
               WHERE id = ? AND status = 'generating'"#,
        )
        .bind(error)
        .bind(dataset_id.to_string())
        .execute(&self.db)
        .await?;
        if res.rows_affected() != 1 {
            return Err(LedgerError::NotGenerating { dataset_id });
        }
        Ok(())
    }

    /// Number of shard rows whose proof is recorded as verified.
    pub async fn count_verified_shards(&self, dataset_id: Uuid) -> Result<u64, LedgerError> {
        let row = sqlx::query(r#"SELECT COUNT(*) AS c FROM shards WHERE dataset_id = ? AND verified = 1"#)
            .bind(dataset_id.to_string())
            .fetch_one(&self.db)
            .await?;
        let c: i64 = row.get("c");
        Ok(c as u64)
    }

    /// Shard commitments in `shard_index` order.
    pub async fn shard_commitments(&self, dataset_id: Uuid) -> Result<Vec<String>, LedgerError> {
        let rows = sqlx::query(
            r#"SELECT shard_commitment_hex FROM shards WHERE dataset_id = ? ORDER BY shard_index"#,
        )
        .bind(dataset_id.to_string())
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
    }

    pub async fn list_shards(
        &self,
        dataset_id: Uuid,
        offset: u64,
        limit: u64,
        include_proof: bool,
    ) -> Result<Vec<ShardRow>, LedgerError> {
        let rows = sqlx::query(
            r#"SELECT shard_index, shard_commitment_hex, stats_json, verified,
                      CASE WHEN ? THEN proof_b64 ELSE NULL END AS proof_b64
               FROM shards
               WHERE dataset_id = ?
               ORDER BY shard_index
               LIMIT ? OFFSET ?"#,
        )
        .bind(include_proof)
        .bind(dataset_id.to_string())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(shard_row).collect()
    }

    /// Every shard of a dataset without proofs; what the query engine aggregates over.
    pub async fn all_shards(&self, dataset_id: Uuid) -> Result<Vec<ShardRow>, LedgerError> {
        self.list_shards(dataset_id, 0, i64::MAX as u64, false).await
    }

    pub async fn shard_proof(&self, dataset_id: Uuid, shard_index: u64) -> Result<Option<String>, LedgerError> {
        let row = sqlx::query(r#"SELECT proof_b64 FROM shards WHERE dataset_id = ? AND shard_index = ?"#)
            .bind(dataset_id.to_string())
            .bind(shard_index as i64)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Cache a verification result for a shard that has none yet. Returns whether it was written.
    pub async fn record_verification(
        &self,
        dataset_id: Uuid,
        shard_index: u64,
        verified: bool,
    ) -> Result<bool, LedgerError> {
        let res = sqlx::query(
            r#"UPDATE shards SET verified = ?
               WHERE dataset_id = ? AND shard_index = ? AND verified IS NULL"#,
        )
        .bind(verified_to_sql(Some(verified)))
        .bind(dataset_id.to_string())
        .bind(shard_index as i64)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn insert_query(&self, entry: &QueryLogEntry) -> Result<(), LedgerError> {
        let query_json = json!({
            "metric": entry.metric,
            "bucket_index": entry.bucket_index,
            "field": "blood_glucose_mg_dl"
        });
        let result_json = json!({
            "sum_glucose": entry.sum,
            "count": entry.count,
            "mean_glucose": entry.mean
        });

        sqlx::query(
            r#"INSERT INTO queries (id, dataset_id, created_at, query_json, result_json, verified)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.query_id.to_string())
        .bind(entry.dataset_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(query_json.to_string())
        .bind(result_json.to_string())
        .bind(if entry.verified { 1i64 } else { 0i64 })
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn count_queries(&self, dataset_id: Uuid) -> Result<u64, LedgerError> {
        let row = sqlx::query(r#"SELECT COUNT(*) AS c FROM queries WHERE dataset_id = ?"#)
            .bind(dataset_id.to_string())
            .fetch_one(&self.db)
            .await?;
        Ok(row.get::<i64, _>("c") as u64)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Db {
        &self.db
    }
}

fn shard_row(row: &sqlx::sqlite::SqliteRow) -> Result<ShardRow, LedgerError> {
    let stats_json: String = row.get("stats_json");
    let stats: ShardStats =
        serde_json::from_str(&stats_json).map_err(|e| LedgerError::Corrupt(format!("stats_json: {e}")))?;
    let verified: Option<i64> = row.get("verified");

    Ok(ShardRow {
        shard_index: row.get::<i64, _>("shard_index") as u64,
        shard_commitment_hex: row.get("shard_commitment_hex"),
        stats,
        verified: verified.map(|v| v == 1),
        proof_b64: row.get("proof_b64"),
    })
}
