//! Storage: the engine façade.
//!
//! Write path: resolve a bucket for each incoming message, account it, and
//! hand it to the batch writer; an unresolved bucket parks the write and
//! retries after the reconciliation loop has had a chance to run.
//! Read path: resend queries delegated to the stream drivers, plus a few
//! scalar statistics.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::storage::batch_manager::BatchManager;
use crate::storage::bucket_manager::BucketManager;
use crate::storage::db::{Database, SqliteDatabase};
use crate::storage::errors::StorageError;
use crate::storage::message::StreamMessage;
use crate::storage::resend::{self, MessageStream};

/// A write parked while its partition has no bucket yet.
struct PendingWrite {
    stream_id: String,
    partition: u32,
    timestamp: u64,
}

pub struct Storage {
    db: Arc<dyn Database>,
    buckets: Arc<BucketManager>,
    batches: BatchManager,
    /// Parked writes waiting on bucket resolution, keyed by a fresh token.
    pending_writes: DashMap<Uuid, PendingWrite>,
    retries_interval_ms: u64,
    max_resend_last: u64,
    shutdown: CancellationToken,
}

impl Storage {
    /// Open the database with bounded retry and start the engine. Exhausting
    /// the attempts is fatal to startup.
    pub async fn start(config: StorageConfig) -> Result<Arc<Self>, StorageError> {
        let ttl = config.use_row_ttl.then_some(config.row_ttl_ms);
        let mut attempt: u32 = 0;
        let db: Arc<dyn Database> = loop {
            attempt += 1;
            let opened = match SqliteDatabase::open(&config.db_path, ttl) {
                Ok(db) => match db.ping().await {
                    Ok(()) => Ok(db),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            match opened {
                Ok(db) => break Arc::new(db),
                Err(e) if attempt < config.connect_attempts => {
                    warn!(
                        attempt,
                        "database connection failed, retrying in {} ms: {}",
                        config.connect_retry_ms, e
                    );
                    sleep(Duration::from_millis(config.connect_retry_ms)).await;
                }
                Err(e) => {
                    error!("could not reach database after {} attempts: {}", attempt, e);
                    return Err(e.into());
                }
            }
        };
        Self::with_database(db, config)
    }

    /// Assemble the engine over an already-connected database client.
    pub fn with_database(
        db: Arc<dyn Database>,
        config: StorageConfig,
    ) -> Result<Arc<Self>, StorageError> {
        if config.retries_interval_ms == 0 {
            return Err(StorageError::InvalidConfig(
                "retries interval must be positive".into(),
            ));
        }
        let buckets = BucketManager::new(db.clone(), &config)?;
        let batches = BatchManager::new(db.clone(), &config)?;
        info!("storage engine started");
        Ok(Arc::new(Self {
            db,
            buckets,
            batches,
            pending_writes: DashMap::new(),
            retries_interval_ms: config.retries_interval_ms,
            max_resend_last: config.max_resend_last,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Durably store one message. Resolves once the owning batch has been
    /// persisted; bucket resolution is awaited without bound (it eventually
    /// succeeds once the reconciliation loop runs).
    pub async fn store(&self, message: StreamMessage) -> Result<(), StorageError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(StorageError::Closed);
            }
            let bucket_id =
                self.buckets
                    .get_bucket_id(&message.stream_id, message.partition, message.timestamp);
            match bucket_id {
                Some(bucket_id) => {
                    self.buckets
                        .increment_bucket(&bucket_id, message.payload_size() as u64);
                    let (done, outcome) = oneshot::channel();
                    self.batches.store(bucket_id, message, Some(done)).await?;
                    return match outcome.await {
                        Ok(result) => result,
                        // the batch was dropped after exhausting its retries
                        Err(_) => Err(StorageError::WriteDropped),
                    };
                }
                None => {
                    let token = Uuid::new_v4();
                    self.pending_writes.insert(
                        token,
                        PendingWrite {
                            stream_id: message.stream_id.clone(),
                            partition: message.partition,
                            timestamp: message.timestamp,
                        },
                    );
                    tokio::select! {
                        _ = sleep(Duration::from_millis(self.retries_interval_ms)) => {}
                        _ = self.shutdown.cancelled() => {
                            self.pending_writes.remove(&token);
                            return Err(StorageError::Closed);
                        }
                    }
                    self.pending_writes.remove(&token);
                }
            }
        }
    }

    // ==========================================
    // RESEND QUERIES
    // ==========================================

    /// The `limit` most recent messages of a stream partition, oldest first.
    /// `limit` is capped at the configured hard maximum.
    pub fn request_last(&self, stream_id: &str, partition: u32, limit: u64) -> MessageStream {
        let limit = limit.min(self.max_resend_last);
        resend::request_last(
            self.db.clone(),
            self.buckets.clone(),
            stream_id.to_string(),
            partition,
            limit,
        )
    }

    /// Everything from `(from_ts, from_sequence_no)` onwards, optionally
    /// narrowed to one publisher.
    pub fn request_from(
        &self,
        stream_id: &str,
        partition: u32,
        from_ts: u64,
        from_sequence_no: u64,
        publisher_id: Option<&str>,
    ) -> MessageStream {
        resend::request_from(
            self.db.clone(),
            self.buckets.clone(),
            stream_id.to_string(),
            partition,
            from_ts,
            from_sequence_no,
            publisher_id.map(str::to_string),
        )
    }

    /// Everything between `(from_ts, from_sequence_no)` and
    /// `(to_ts, to_sequence_no)` inclusive. `publisher_id` and
    /// `msg_chain_id` must be given together or not at all.
    #[allow(clippy::too_many_arguments)]
    pub fn request_range(
        &self,
        stream_id: &str,
        partition: u32,
        from_ts: u64,
        from_sequence_no: u64,
        to_ts: u64,
        to_sequence_no: u64,
        publisher_id: Option<&str>,
        msg_chain_id: Option<&str>,
    ) -> MessageStream {
        resend::request_range(
            self.db.clone(),
            self.buckets.clone(),
            stream_id.to_string(),
            partition,
            from_ts,
            from_sequence_no,
            to_ts,
            to_sequence_no,
            publisher_id.map(str::to_string),
            msg_chain_id.map(str::to_string),
        )
    }

    // ==========================================
    // STREAM STATISTICS
    // ==========================================

    pub async fn get_first_message_timestamp_in_stream(
        &self,
        stream_id: &str,
        partition: u32,
    ) -> Result<Option<u64>, StorageError> {
        Ok(self.db.first_message_ts(stream_id, partition).await?)
    }

    pub async fn get_last_message_timestamp_in_stream(
        &self,
        stream_id: &str,
        partition: u32,
    ) -> Result<Option<u64>, StorageError> {
        Ok(self.db.last_message_ts(stream_id, partition).await?)
    }

    pub async fn get_number_of_messages_in_stream(
        &self,
        stream_id: &str,
        partition: u32,
    ) -> Result<u64, StorageError> {
        Ok(self.db.count_messages(stream_id, partition).await?)
    }

    pub async fn get_total_bytes_in_stream(
        &self,
        stream_id: &str,
        partition: u32,
    ) -> Result<u64, StorageError> {
        let total = self.db.total_payload_bytes(stream_id, partition).await?;
        Ok(total.min(u64::MAX as u128) as u64)
    }

    /// Writes currently parked on bucket resolution.
    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.len()
    }

    /// Stop the engine: cancels write-side timers and loops, discards
    /// unflushed batches, and lets in-flight queries fail naturally.
    pub async fn close(&self) {
        info!("storage engine stopping");
        self.shutdown.cancel();
        self.batches.stop().await;
        self.buckets.stop();
    }
}
