//! Database seam: the engine talks to the column store through this trait.
//!
//! The contract mirrors what a column-family store offers: atomic
//! single-partition batch writes, clustering-ordered range scans, and
//! streaming row iteration. Everything is parameterized so adapters can use
//! prepared statements throughout.

pub mod sqlite;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::storage::bucket::BucketId;
use crate::storage::errors::DbError;

pub use sqlite::SqliteDatabase;

/// One row of the `bucket` table.
#[derive(Debug, Clone)]
pub struct BucketRecord {
    pub id: BucketId,
    pub stream_id: String,
    pub partition: u32,
    pub date_create: u64,
    pub records: u64,
    pub size: u64,
}

/// One row of the `stream_data` table.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub stream_id: String,
    pub partition: u32,
    pub bucket_id: BucketId,
    pub ts: u64,
    pub sequence_no: u64,
    pub publisher_id: String,
    pub msg_chain_id: String,
    /// Serialized message envelope. Absent payloads are a known upstream
    /// anomaly tolerated on read.
    pub payload: Option<Vec<u8>>,
}

/// Timestamp/sequence predicate of one range sub-query.
#[derive(Debug, Clone, Copy)]
pub enum RowFilter {
    /// No timestamp constraint.
    All,
    /// ts >= from_ts
    TsAtLeast { from_ts: u64 },
    /// ts > from_ts
    TsAfter { from_ts: u64 },
    /// from_ts < ts < to_ts
    TsBetweenExclusive { from_ts: u64, to_ts: u64 },
    /// ts == ts AND sequence_no >= sequence_no
    TsEqSeqAtLeast { ts: u64, sequence_no: u64 },
    /// ts == ts AND sequence_no <= sequence_no
    TsEqSeqAtMost { ts: u64, sequence_no: u64 },
    /// ts == ts AND from_sequence_no <= sequence_no <= to_sequence_no
    TsEqSeqBetween {
        ts: u64,
        from_sequence_no: u64,
        to_sequence_no: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOrder {
    Asc,
    Desc,
}

/// A fully-parameterized row query over an explicit set of buckets. Rows come
/// back in clustering order `(ts, sequence_no)` following `order`.
#[derive(Debug, Clone)]
pub struct MessageQuery {
    pub stream_id: String,
    pub partition: u32,
    pub bucket_ids: Vec<BucketId>,
    pub filter: RowFilter,
    pub publisher_id: Option<String>,
    pub msg_chain_id: Option<String>,
    pub order: RowOrder,
    pub limit: Option<u64>,
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Cheap connectivity probe used by the bounded-retry startup.
    async fn ping(&self) -> Result<(), DbError>;

    /// Atomically persist a batch of message rows: all land or none do.
    async fn insert_message_rows(&self, rows: Vec<MessageRow>) -> Result<(), DbError>;

    /// Insert or update a bucket row with its current counters.
    async fn upsert_bucket(&self, bucket: &BucketRecord) -> Result<(), DbError>;

    /// Most recent buckets of a stream partition, newest first, optionally
    /// only those created at or before `before_ts`.
    async fn last_buckets(
        &self,
        stream_id: &str,
        partition: u32,
        limit: u64,
        before_ts: Option<u64>,
    ) -> Result<Vec<BucketRecord>, DbError>;

    /// The one bucket created at or before `ts`, if any.
    async fn bucket_covering(
        &self,
        stream_id: &str,
        partition: u32,
        ts: u64,
    ) -> Result<Option<BucketRecord>, DbError>;

    /// Buckets with `date_create` in `(from_ts, to_ts]`, newest first. An
    /// absent `to_ts` leaves the range open-ended.
    async fn buckets_after(
        &self,
        stream_id: &str,
        partition: u32,
        from_ts: u64,
        to_ts: Option<u64>,
    ) -> Result<Vec<BucketRecord>, DbError>;

    /// All buckets with `date_create <= to_ts`, newest first.
    async fn buckets_until(
        &self,
        stream_id: &str,
        partition: u32,
        to_ts: u64,
    ) -> Result<Vec<BucketRecord>, DbError>;

    /// Number of message rows stored in one bucket.
    async fn count_bucket_rows(
        &self,
        stream_id: &str,
        partition: u32,
        bucket_id: BucketId,
    ) -> Result<u64, DbError>;

    /// Ordered row streaming. Rows arrive in the query's clustering order;
    /// dropping the receiver cancels the underlying cursor.
    fn stream_message_rows(&self, query: MessageQuery) -> mpsc::Receiver<Result<MessageRow, DbError>>;

    async fn first_message_ts(&self, stream_id: &str, partition: u32) -> Result<Option<u64>, DbError>;

    async fn last_message_ts(&self, stream_id: &str, partition: u32) -> Result<Option<u64>, DbError>;

    async fn count_messages(&self, stream_id: &str, partition: u32) -> Result<u64, DbError>;

    /// Total payload bytes of a stream partition. Adapters fall back to a
    /// row-by-row sum when the store's aggregate overflows.
    async fn total_payload_bytes(&self, stream_id: &str, partition: u32) -> Result<u128, DbError>;
}
