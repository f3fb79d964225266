//! SQLite rendition of the column-family layout.
//!
//! One write connection behind a mutex, driven through `spawn_blocking`;
//! streaming reads open a dedicated connection per query so long-lived
//! cursors never block writers. All statements are prepared and
//! parameterized.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::bucket::BucketId;
use crate::storage::db::{
    BucketRecord, Database, MessageQuery, MessageRow, RowFilter, RowOrder,
};
use crate::storage::errors::DbError;
use crate::utils::utils_time::current_time_ms;

/// Row capacity of a streaming read channel; bounds buffered rows when the
/// consumer is slower than the cursor.
const READ_CHANNEL_CAPACITY: usize = 256;

const SELECT_BUCKET: &str =
    "SELECT id, stream_id, \"partition\", date_create, records, size FROM bucket";

pub struct SqliteDatabase {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    row_ttl_ms: Option<u64>,
}

impl SqliteDatabase {
    /// Open (or create) the store at `path`. `row_ttl_ms` enables the
    /// per-row time-to-live applied to inserted message rows.
    pub fn open(path: impl AsRef<Path>, row_ttl_ms: Option<u64>) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| DbError::Unavailable(e.to_string()))?;
            }
        }
        let conn = Connection::open(&path).map_err(unavailable)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(unavailable)?;
        init_db(&conn)?;
        debug!(path = %path.display(), "opened sqlite store");
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            row_ttl_ms,
        })
    }

    /// Run `f` on the write connection from the blocking pool.
    async fn call<R, F>(&self, f: F) -> Result<R, DbError>
    where
        F: FnOnce(&mut Connection) -> Result<R, DbError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&mut conn.lock()))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn ping(&self) -> Result<(), DbError> {
        self.call(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(unavailable)
        })
        .await
    }

    async fn insert_message_rows(&self, rows: Vec<MessageRow>) -> Result<(), DbError> {
        let expire_at = self.row_ttl_ms.map(|ttl| current_time_ms() + ttl);
        self.call(move |conn| {
            let tx = conn.transaction().map_err(query_err)?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT OR REPLACE INTO stream_data \
                         (stream_id, \"partition\", bucket_id, ts, sequence_no, \
                          publisher_id, msg_chain_id, payload, expire_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    )
                    .map_err(query_err)?;
                for row in &rows {
                    stmt.execute(params![
                        row.stream_id,
                        row.partition,
                        row.bucket_id,
                        ms_i64(row.ts),
                        ms_i64(row.sequence_no),
                        row.publisher_id,
                        row.msg_chain_id,
                        row.payload,
                        expire_at.map(ms_i64),
                    ])
                    .map_err(query_err)?;
                }
            }
            tx.commit().map_err(query_err)
        })
        .await
    }

    async fn upsert_bucket(&self, bucket: &BucketRecord) -> Result<(), DbError> {
        let bucket = bucket.clone();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "INSERT INTO bucket (stream_id, \"partition\", date_create, id, records, size) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT (stream_id, \"partition\", date_create) \
                     DO UPDATE SET records = excluded.records, size = excluded.size",
                )
                .map_err(query_err)?;
            stmt.execute(params![
                bucket.stream_id,
                bucket.partition,
                ms_i64(bucket.date_create),
                bucket.id,
                ms_i64(bucket.records),
                ms_i64(bucket.size),
            ])
            .map_err(query_err)?;
            Ok(())
        })
        .await
    }

    async fn last_buckets(
        &self,
        stream_id: &str,
        partition: u32,
        limit: u64,
        before_ts: Option<u64>,
    ) -> Result<Vec<BucketRecord>, DbError> {
        let stream_id = stream_id.to_string();
        self.call(move |conn| {
            let sql = match before_ts {
                Some(_) => format!(
                    "{SELECT_BUCKET} WHERE stream_id = ?1 AND \"partition\" = ?2 \
                     AND date_create <= ?3 ORDER BY date_create DESC LIMIT ?4"
                ),
                None => format!(
                    "{SELECT_BUCKET} WHERE stream_id = ?1 AND \"partition\" = ?2 \
                     ORDER BY date_create DESC LIMIT ?3"
                ),
            };
            let mut stmt = conn.prepare_cached(&sql).map_err(query_err)?;
            let rows = match before_ts {
                Some(before) => stmt.query_map(
                    params![stream_id, partition, ms_i64(before), ms_i64(limit)],
                    read_bucket_record,
                ),
                None => stmt.query_map(
                    params![stream_id, partition, ms_i64(limit)],
                    read_bucket_record,
                ),
            }
            .map_err(query_err)?;
            collect_bucket_rows(rows)
        })
        .await
    }

    async fn bucket_covering(
        &self,
        stream_id: &str,
        partition: u32,
        ts: u64,
    ) -> Result<Option<BucketRecord>, DbError> {
        let stream_id = stream_id.to_string();
        self.call(move |conn| {
            let sql = format!(
                "{SELECT_BUCKET} WHERE stream_id = ?1 AND \"partition\" = ?2 \
                 AND date_create <= ?3 ORDER BY date_create DESC LIMIT 1"
            );
            let mut stmt = conn.prepare_cached(&sql).map_err(query_err)?;
            let mut rows = stmt
                .query_map(params![stream_id, partition, ms_i64(ts)], read_bucket_record)
                .map_err(query_err)?;
            match rows.next() {
                Some(row) => Ok(Some(row.map_err(query_err)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn buckets_after(
        &self,
        stream_id: &str,
        partition: u32,
        from_ts: u64,
        to_ts: Option<u64>,
    ) -> Result<Vec<BucketRecord>, DbError> {
        let stream_id = stream_id.to_string();
        self.call(move |conn| {
            let sql = match to_ts {
                Some(_) => format!(
                    "{SELECT_BUCKET} WHERE stream_id = ?1 AND \"partition\" = ?2 \
                     AND date_create > ?3 AND date_create <= ?4 ORDER BY date_create DESC"
                ),
                None => format!(
                    "{SELECT_BUCKET} WHERE stream_id = ?1 AND \"partition\" = ?2 \
                     AND date_create > ?3 ORDER BY date_create DESC"
                ),
            };
            let mut stmt = conn.prepare_cached(&sql).map_err(query_err)?;
            let rows = match to_ts {
                Some(to) => stmt.query_map(
                    params![stream_id, partition, ms_i64(from_ts), ms_i64(to)],
                    read_bucket_record,
                ),
                None => stmt.query_map(
                    params![stream_id, partition, ms_i64(from_ts)],
                    read_bucket_record,
                ),
            }
            .map_err(query_err)?;
            collect_bucket_rows(rows)
        })
        .await
    }

    async fn buckets_until(
        &self,
        stream_id: &str,
        partition: u32,
        to_ts: u64,
    ) -> Result<Vec<BucketRecord>, DbError> {
        let stream_id = stream_id.to_string();
        self.call(move |conn| {
            let sql = format!(
                "{SELECT_BUCKET} WHERE stream_id = ?1 AND \"partition\" = ?2 \
                 AND date_create <= ?3 ORDER BY date_create DESC"
            );
            let mut stmt = conn.prepare_cached(&sql).map_err(query_err)?;
            let rows = stmt
                .query_map(
                    params![stream_id, partition, ms_i64(to_ts)],
                    read_bucket_record,
                )
                .map_err(query_err)?;
            collect_bucket_rows(rows)
        })
        .await
    }

    async fn count_bucket_rows(
        &self,
        stream_id: &str,
        partition: u32,
        bucket_id: BucketId,
    ) -> Result<u64, DbError> {
        let stream_id = stream_id.to_string();
        let now = current_time_ms();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT COUNT(*) FROM stream_data \
                     WHERE stream_id = ?1 AND \"partition\" = ?2 AND bucket_id = ?3 \
                     AND (expire_at IS NULL OR expire_at > ?4)",
                )
                .map_err(query_err)?;
            let count: i64 = stmt
                .query_row(params![stream_id, partition, bucket_id, ms_i64(now)], |r| {
                    r.get(0)
                })
                .map_err(query_err)?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    fn stream_message_rows(&self, query: MessageQuery) -> mpsc::Receiver<Result<MessageRow, DbError>> {
        let (tx, rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        if query.bucket_ids.is_empty() {
            return rx;
        }
        let path = self.path.clone();
        let now = current_time_ms();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = pump_rows(&path, &query, now, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
        });
        rx
    }

    async fn first_message_ts(&self, stream_id: &str, partition: u32) -> Result<Option<u64>, DbError> {
        self.scalar_ts("SELECT MIN(ts) FROM stream_data", stream_id, partition)
            .await
    }

    async fn last_message_ts(&self, stream_id: &str, partition: u32) -> Result<Option<u64>, DbError> {
        self.scalar_ts("SELECT MAX(ts) FROM stream_data", stream_id, partition)
            .await
    }

    async fn count_messages(&self, stream_id: &str, partition: u32) -> Result<u64, DbError> {
        let stream_id = stream_id.to_string();
        let now = current_time_ms();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT COUNT(*) FROM stream_data \
                     WHERE stream_id = ?1 AND \"partition\" = ?2 \
                     AND (expire_at IS NULL OR expire_at > ?3)",
                )
                .map_err(query_err)?;
            let count: i64 = stmt
                .query_row(params![stream_id, partition, ms_i64(now)], |r| r.get(0))
                .map_err(query_err)?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn total_payload_bytes(&self, stream_id: &str, partition: u32) -> Result<u128, DbError> {
        let stream_id = stream_id.to_string();
        let now = current_time_ms();
        self.call(move |conn| {
            let aggregate: Result<Option<i64>, rusqlite::Error> = conn
                .query_row(
                    "SELECT SUM(LENGTH(payload)) FROM stream_data \
                     WHERE stream_id = ?1 AND \"partition\" = ?2 \
                     AND (expire_at IS NULL OR expire_at > ?3)",
                    params![stream_id, partition, ms_i64(now)],
                    |r| r.get(0),
                );
            match aggregate {
                Ok(total) => Ok(total.unwrap_or(0).max(0) as u128),
                Err(e) => {
                    // the aggregate overflows a signed 64-bit counter on very
                    // large partitions; fall back to a row-by-row sum
                    warn!("aggregate byte sum failed ({}), falling back to row scan", e);
                    let mut stmt = conn
                        .prepare_cached(
                            "SELECT LENGTH(payload) FROM stream_data \
                             WHERE stream_id = ?1 AND \"partition\" = ?2 \
                             AND (expire_at IS NULL OR expire_at > ?3)",
                        )
                        .map_err(query_err)?;
                    let rows = stmt
                        .query_map(params![stream_id, partition, ms_i64(now)], |r| {
                            r.get::<_, Option<i64>>(0)
                        })
                        .map_err(query_err)?;
                    let mut total: u128 = 0;
                    for len in rows {
                        total += len.map_err(query_err)?.unwrap_or(0).max(0) as u128;
                    }
                    Ok(total)
                }
            }
        })
        .await
    }
}

impl SqliteDatabase {
    async fn scalar_ts(
        &self,
        select: &'static str,
        stream_id: &str,
        partition: u32,
    ) -> Result<Option<u64>, DbError> {
        let stream_id = stream_id.to_string();
        let now = current_time_ms();
        self.call(move |conn| {
            let sql = format!(
                "{select} WHERE stream_id = ?1 AND \"partition\" = ?2 \
                 AND (expire_at IS NULL OR expire_at > ?3)"
            );
            let mut stmt = conn.prepare_cached(&sql).map_err(query_err)?;
            let ts: Option<i64> = stmt
                .query_row(params![stream_id, partition, ms_i64(now)], |r| r.get(0))
                .map_err(query_err)?;
            Ok(ts.map(|v| v.max(0) as u64))
        })
        .await
    }
}

fn init_db(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;
         PRAGMA temp_store = MEMORY;",
    )
    .map_err(unavailable)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bucket (
            stream_id TEXT NOT NULL,
            \"partition\" INTEGER NOT NULL,
            date_create INTEGER NOT NULL,
            id BLOB NOT NULL,
            records INTEGER NOT NULL,
            size INTEGER NOT NULL,
            PRIMARY KEY (stream_id, \"partition\", date_create)
        )",
        [],
    )
    .map_err(unavailable)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS stream_data (
            stream_id TEXT NOT NULL,
            \"partition\" INTEGER NOT NULL,
            bucket_id BLOB NOT NULL,
            ts INTEGER NOT NULL,
            sequence_no INTEGER NOT NULL,
            publisher_id TEXT NOT NULL,
            msg_chain_id TEXT NOT NULL,
            payload BLOB,
            expire_at INTEGER,
            PRIMARY KEY (stream_id, \"partition\", bucket_id, ts, sequence_no, publisher_id, msg_chain_id)
        )",
        [],
    )
    .map_err(unavailable)?;

    // serves the clustering-ordered range scans of the resend queries
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_stream_data_ts \
         ON stream_data (stream_id, \"partition\", ts, sequence_no)",
        [],
    )
    .map_err(unavailable)?;

    Ok(())
}

/// Stream query rows into `tx` until exhaustion or consumer cancellation.
fn pump_rows(
    path: &Path,
    query: &MessageQuery,
    now_ms: u64,
    tx: &mpsc::Sender<Result<MessageRow, DbError>>,
) -> Result<(), DbError> {
    let conn = Connection::open(path).map_err(unavailable)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(unavailable)?;
    let (sql, values) = build_row_query(query, now_ms);
    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let mut rows = stmt.query(params_from_iter(values)).map_err(query_err)?;
    loop {
        match rows.next() {
            Ok(Some(row)) => {
                let decoded = read_message_row(row).map_err(query_err)?;
                if tx.blocking_send(Ok(decoded)).is_err() {
                    // consumer destroyed the stream; drop the cursor
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => return Err(query_err(e)),
        }
    }
    Ok(())
}

fn build_row_query(q: &MessageQuery, now_ms: u64) -> (String, Vec<Value>) {
    let mut sql = String::from(
        "SELECT stream_id, \"partition\", bucket_id, ts, sequence_no, publisher_id, msg_chain_id, payload \
         FROM stream_data WHERE stream_id = ? AND \"partition\" = ?",
    );
    let mut values: Vec<Value> = vec![
        Value::Text(q.stream_id.clone()),
        Value::Integer(q.partition as i64),
    ];

    let placeholders = vec!["?"; q.bucket_ids.len()].join(", ");
    sql.push_str(&format!(" AND bucket_id IN ({placeholders})"));
    for id in &q.bucket_ids {
        values.push(Value::Blob(id.as_bytes().to_vec()));
    }

    match q.filter {
        RowFilter::All => {}
        RowFilter::TsAtLeast { from_ts } => {
            sql.push_str(" AND ts >= ?");
            values.push(Value::Integer(ms_i64(from_ts)));
        }
        RowFilter::TsAfter { from_ts } => {
            sql.push_str(" AND ts > ?");
            values.push(Value::Integer(ms_i64(from_ts)));
        }
        RowFilter::TsBetweenExclusive { from_ts, to_ts } => {
            sql.push_str(" AND ts > ? AND ts < ?");
            values.push(Value::Integer(ms_i64(from_ts)));
            values.push(Value::Integer(ms_i64(to_ts)));
        }
        RowFilter::TsEqSeqAtLeast { ts, sequence_no } => {
            sql.push_str(" AND ts = ? AND sequence_no >= ?");
            values.push(Value::Integer(ms_i64(ts)));
            values.push(Value::Integer(ms_i64(sequence_no)));
        }
        RowFilter::TsEqSeqAtMost { ts, sequence_no } => {
            sql.push_str(" AND ts = ? AND sequence_no <= ?");
            values.push(Value::Integer(ms_i64(ts)));
            values.push(Value::Integer(ms_i64(sequence_no)));
        }
        RowFilter::TsEqSeqBetween {
            ts,
            from_sequence_no,
            to_sequence_no,
        } => {
            sql.push_str(" AND ts = ? AND sequence_no >= ? AND sequence_no <= ?");
            values.push(Value::Integer(ms_i64(ts)));
            values.push(Value::Integer(ms_i64(from_sequence_no)));
            values.push(Value::Integer(ms_i64(to_sequence_no)));
        }
    }

    if let Some(publisher) = &q.publisher_id {
        sql.push_str(" AND publisher_id = ?");
        values.push(Value::Text(publisher.clone()));
    }
    if let Some(chain) = &q.msg_chain_id {
        sql.push_str(" AND msg_chain_id = ?");
        values.push(Value::Text(chain.clone()));
    }

    sql.push_str(" AND (expire_at IS NULL OR expire_at > ?)");
    values.push(Value::Integer(ms_i64(now_ms)));

    match q.order {
        RowOrder::Asc => sql.push_str(" ORDER BY ts ASC, sequence_no ASC"),
        RowOrder::Desc => sql.push_str(" ORDER BY ts DESC, sequence_no DESC"),
    }
    if let Some(limit) = q.limit {
        sql.push_str(" LIMIT ?");
        values.push(Value::Integer(ms_i64(limit)));
    }

    (sql, values)
}

fn read_bucket_record(row: &rusqlite::Row) -> rusqlite::Result<BucketRecord> {
    Ok(BucketRecord {
        id: row.get::<_, Uuid>(0)?,
        stream_id: row.get(1)?,
        partition: row.get(2)?,
        date_create: row.get::<_, i64>(3)?.max(0) as u64,
        records: row.get::<_, i64>(4)?.max(0) as u64,
        size: row.get::<_, i64>(5)?.max(0) as u64,
    })
}

fn read_message_row(row: &rusqlite::Row) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        stream_id: row.get(0)?,
        partition: row.get(1)?,
        bucket_id: row.get::<_, Uuid>(2)?,
        ts: row.get::<_, i64>(3)?.max(0) as u64,
        sequence_no: row.get::<_, i64>(4)?.max(0) as u64,
        publisher_id: row.get(5)?,
        msg_chain_id: row.get(6)?,
        payload: row.get(7)?,
    })
}

fn collect_bucket_rows<F>(rows: rusqlite::MappedRows<'_, F>) -> Result<Vec<BucketRecord>, DbError>
where
    F: FnMut(&rusqlite::Row) -> rusqlite::Result<BucketRecord>,
{
    let mut records = Vec::new();
    for row in rows {
        records.push(row.map_err(query_err)?);
    }
    Ok(records)
}

/// Clamp into the store's signed 64-bit integer domain.
fn ms_i64(v: u64) -> i64 {
    v.min(i64::MAX as u64) as i64
}

fn unavailable(e: rusqlite::Error) -> DbError {
    DbError::Unavailable(e.to_string())
}

fn query_err(e: rusqlite::Error) -> DbError {
    DbError::Query(e.to_string())
}
