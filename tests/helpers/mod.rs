#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc;

use brook::config::{Config, StorageConfig};
use brook::storage::bucket::BucketId;
use brook::storage::db::{BucketRecord, Database, MessageQuery, MessageRow, SqliteDatabase};
use brook::{DbError, Storage, StreamMessage};

/// Global config with fast timings and a database inside `dir`.
pub fn test_config(dir: &TempDir) -> StorageConfig {
    let mut config = Config::global().storage.clone();
    config.db_path = dir
        .path()
        .join("brook.db")
        .to_str()
        .expect("tempdir path is valid utf-8")
        .to_string();
    config.check_full_buckets_interval_ms = 50;
    config.store_buckets_interval_ms = 25;
    config.batch_close_timeout_ms = 50;
    config.retries_interval_ms = 25;
    config
}

pub async fn start_storage(dir: &TempDir) -> Arc<Storage> {
    brook::init_tracing();
    Storage::start(test_config(dir)).await.unwrap()
}

pub fn msg(stream_id: &str, partition: u32, ts: u64, seq: u64) -> StreamMessage {
    msg_from("publisher-1", "chain-1", stream_id, partition, ts, seq)
}

pub fn msg_from(
    publisher_id: &str,
    msg_chain_id: &str,
    stream_id: &str,
    partition: u32,
    ts: u64,
    seq: u64,
) -> StreamMessage {
    StreamMessage {
        stream_id: stream_id.to_string(),
        partition,
        timestamp: ts,
        sequence_no: seq,
        publisher_id: publisher_id.to_string(),
        msg_chain_id: msg_chain_id.to_string(),
        payload: Bytes::from(format!("payload-{ts}-{seq}")),
    }
}

// ==========================================
// FAULT-INJECTING DATABASE
// ==========================================

/// Wraps the sqlite adapter and fails the first `fail_inserts` message-batch
/// inserts, counting every attempt.
pub struct FlakyDb {
    inner: SqliteDatabase,
    remaining_failures: AtomicU32,
    insert_attempts: AtomicU32,
}

impl FlakyDb {
    pub fn new(inner: SqliteDatabase, fail_inserts: u32) -> Self {
        Self {
            inner,
            remaining_failures: AtomicU32::new(fail_inserts),
            insert_attempts: AtomicU32::new(0),
        }
    }

    pub fn insert_attempts(&self) -> u32 {
        self.insert_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Database for FlakyDb {
    async fn ping(&self) -> Result<(), DbError> {
        self.inner.ping().await
    }

    async fn insert_message_rows(&self, rows: Vec<MessageRow>) -> Result<(), DbError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DbError::Unavailable("injected insert failure".into()));
        }
        self.inner.insert_message_rows(rows).await
    }

    async fn upsert_bucket(&self, bucket: &BucketRecord) -> Result<(), DbError> {
        self.inner.upsert_bucket(bucket).await
    }

    async fn last_buckets(
        &self,
        stream_id: &str,
        partition: u32,
        limit: u64,
        before_ts: Option<u64>,
    ) -> Result<Vec<BucketRecord>, DbError> {
        self.inner.last_buckets(stream_id, partition, limit, before_ts).await
    }

    async fn bucket_covering(
        &self,
        stream_id: &str,
        partition: u32,
        ts: u64,
    ) -> Result<Option<BucketRecord>, DbError> {
        self.inner.bucket_covering(stream_id, partition, ts).await
    }

    async fn buckets_after(
        &self,
        stream_id: &str,
        partition: u32,
        from_ts: u64,
        to_ts: Option<u64>,
    ) -> Result<Vec<BucketRecord>, DbError> {
        self.inner.buckets_after(stream_id, partition, from_ts, to_ts).await
    }

    async fn buckets_until(
        &self,
        stream_id: &str,
        partition: u32,
        to_ts: u64,
    ) -> Result<Vec<BucketRecord>, DbError> {
        self.inner.buckets_until(stream_id, partition, to_ts).await
    }

    async fn count_bucket_rows(
        &self,
        stream_id: &str,
        partition: u32,
        bucket_id: BucketId,
    ) -> Result<u64, DbError> {
        self.inner.count_bucket_rows(stream_id, partition, bucket_id).await
    }

    fn stream_message_rows(&self, query: MessageQuery) -> mpsc::Receiver<Result<MessageRow, DbError>> {
        self.inner.stream_message_rows(query)
    }

    async fn first_message_ts(&self, stream_id: &str, partition: u32) -> Result<Option<u64>, DbError> {
        self.inner.first_message_ts(stream_id, partition).await
    }

    async fn last_message_ts(&self, stream_id: &str, partition: u32) -> Result<Option<u64>, DbError> {
        self.inner.last_message_ts(stream_id, partition).await
    }

    async fn count_messages(&self, stream_id: &str, partition: u32) -> Result<u64, DbError> {
        self.inner.count_messages(stream_id, partition).await
    }

    async fn total_payload_bytes(&self, stream_id: &str, partition: u32) -> Result<u128, DbError> {
        self.inner.total_payload_bytes(stream_id, partition).await
    }
}
