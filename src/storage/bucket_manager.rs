//! BucketManager: owns the mapping from (stream id, partition, timestamp) to
//! bucket ids.
//!
//! Responsibilities:
//! - Resolve the target bucket for every incoming message (in-order fast
//!   path, out-of-order linear scan, not-found signalling).
//! - Reconciliation loop: adopt buckets from the database or create fresh
//!   ones for partitions still waiting on a bucket.
//! - Persistence sweep: upsert dirty bucket counters and evict buckets that
//!   are stored and past their keep-alive window.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::storage::bucket::{new_bucket_id, Bucket, BucketId};
use crate::storage::db::{BucketRecord, Database};
use crate::storage::errors::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PartitionKey {
    stream_id: String,
    partition: u32,
}

/// Recently known buckets of one stream partition, newest first, plus the
/// earliest timestamp still waiting for a bucket.
#[derive(Default)]
struct StreamPartitionState {
    /// `(date_create, id)`, sorted by `date_create` descending.
    buckets: Vec<(u64, BucketId)>,
    min_timestamp: Option<u64>,
}

impl StreamPartitionState {
    fn insert(&mut self, date_create: u64, id: BucketId) {
        if self.buckets.iter().any(|(_, existing)| *existing == id) {
            return;
        }
        let at = self.buckets.partition_point(|(dc, _)| *dc > date_create);
        self.buckets.insert(at, (date_create, id));
    }

    fn remove(&mut self, id: BucketId) {
        self.buckets.retain(|(_, b)| *b != id);
    }
}

pub struct BucketManager {
    db: Arc<dyn Database>,
    /// Hot-path registry, mutated on every write.
    buckets: DashMap<BucketId, Bucket>,
    /// Lock order: `partitions` first, then `buckets`; database calls never
    /// run under either.
    partitions: Mutex<HashMap<PartitionKey, StreamPartitionState>>,
    max_bucket_size: u64,
    max_bucket_records: u64,
    keep_alive_secs: u64,
    shutdown: CancellationToken,
}

impl BucketManager {
    pub fn new(db: Arc<dyn Database>, config: &StorageConfig) -> Result<Arc<Self>, StorageError> {
        if config.max_bucket_size == 0
            || config.max_bucket_records == 0
            || config.bucket_keep_alive_secs == 0
        {
            return Err(StorageError::InvalidConfig(
                "bucket limits and keep-alive must be positive".into(),
            ));
        }
        if config.check_full_buckets_interval_ms == 0 || config.store_buckets_interval_ms == 0 {
            return Err(StorageError::InvalidConfig(
                "bucket sweep intervals must be positive".into(),
            ));
        }

        let manager = Arc::new(Self {
            db,
            buckets: DashMap::new(),
            partitions: Mutex::new(HashMap::new()),
            max_bucket_size: config.max_bucket_size,
            max_bucket_records: config.max_bucket_records,
            keep_alive_secs: config.bucket_keep_alive_secs,
            shutdown: CancellationToken::new(),
        });

        let reconciler = manager.clone();
        let reconcile_every = config.check_full_buckets_interval_ms;
        tokio::spawn(async move { reconciler.run_reconciliation(reconcile_every).await });

        let sweeper = manager.clone();
        let sweep_every = config.store_buckets_interval_ms;
        tokio::spawn(async move { sweeper.run_persistence_sweep(sweep_every).await });

        Ok(manager)
    }

    /// Resolve the bucket for one message. `None` means no bucket covers the
    /// timestamp yet: the caller should retry once the reconciliation loop
    /// has run, it is not an error.
    pub fn get_bucket_id(&self, stream_id: &str, partition: u32, timestamp: u64) -> Option<BucketId> {
        let key = PartitionKey {
            stream_id: stream_id.to_string(),
            partition,
        };
        let mut partitions = self.partitions.lock();
        let state = match partitions.get_mut(&key) {
            Some(state) => state,
            None => {
                debug!(stream_id, partition, timestamp, "first message for partition, waiting for bucket");
                partitions.insert(
                    key,
                    StreamPartitionState {
                        buckets: Vec::new(),
                        min_timestamp: Some(timestamp),
                    },
                );
                return None;
            }
        };
        if let Some(id) = self.find_bucket_id(state, timestamp) {
            return Some(id);
        }
        state.min_timestamp = Some(match state.min_timestamp {
            Some(min) => min.min(timestamp),
            None => timestamp,
        });
        None
    }

    /// The in-memory scan: the newest bucket serves in-order traffic unless
    /// it is almost full; an older timestamp falls back to the first bucket
    /// created at or before it.
    fn find_bucket_id(&self, state: &StreamPartitionState, timestamp: u64) -> Option<BucketId> {
        let (newest_dc, newest_id) = *state.buckets.first()?;
        if newest_dc <= timestamp {
            let almost_full = self
                .buckets
                .get(&newest_id)
                .map(|b| b.is_almost_full())
                .unwrap_or(true);
            if !almost_full {
                return Some(newest_id);
            }
            None
        } else {
            state
                .buckets
                .iter()
                .skip(1)
                .find(|(dc, _)| *dc <= timestamp)
                .map(|(_, id)| *id)
        }
    }

    /// Account a write against its bucket. Unknown ids are ignored (the
    /// bucket may have been evicted between resolution and accounting).
    pub fn increment_bucket(&self, bucket_id: &BucketId, size: u64) {
        match self.buckets.get_mut(bucket_id) {
            Some(mut bucket) => bucket.increment(size),
            None => warn!(%bucket_id, "increment for unknown bucket, ignoring"),
        }
    }

    /// Buckets whose time range can overlap `[from_ts, to_ts]`, resolved from
    /// the database, newest first. The bucket created at or before `from_ts`
    /// is always included: rows with ts >= its `date_create` live there.
    pub async fn get_buckets_by_timestamp(
        &self,
        stream_id: &str,
        partition: u32,
        from_ts: Option<u64>,
        to_ts: Option<u64>,
    ) -> Result<Vec<BucketRecord>, StorageError> {
        match from_ts {
            Some(from) => {
                let mut records = self.db.buckets_after(stream_id, partition, from, to_ts).await?;
                if let Some(boundary) = self.db.bucket_covering(stream_id, partition, from).await? {
                    if !records.iter().any(|r| r.id == boundary.id) {
                        records.push(boundary);
                    }
                }
                Ok(records)
            }
            None => {
                let to = to_ts.unwrap_or(u64::MAX);
                Ok(self.db.buckets_until(stream_id, partition, to).await?)
            }
        }
    }

    /// Most recent `limit` buckets, optionally only those created at or
    /// before `before_ts`, newest first.
    pub async fn get_last_buckets(
        &self,
        stream_id: &str,
        partition: u32,
        limit: u64,
        before_ts: Option<u64>,
    ) -> Result<Vec<BucketRecord>, StorageError> {
        Ok(self.db.last_buckets(stream_id, partition, limit, before_ts).await?)
    }

    /// Number of buckets currently tracked in memory.
    pub fn tracked_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Halt both background loops. Tracked state stays in memory; the
    /// database remains the source of truth.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    // ==========================================
    // RECONCILIATION LOOP
    // ==========================================

    async fn run_reconciliation(self: Arc<Self>, period_ms: u64) {
        let mut ticker = interval(Duration::from_millis(period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.reconcile_pending_partitions().await,
            }
        }
        debug!("bucket reconciliation loop stopped");
    }

    async fn reconcile_pending_partitions(&self) {
        let pending: Vec<(PartitionKey, u64)> = {
            let partitions = self.partitions.lock();
            partitions
                .iter()
                .filter_map(|(key, state)| state.min_timestamp.map(|min| (key.clone(), min)))
                .collect()
        };
        for (key, min_ts) in pending {
            if let Err(e) = self.reconcile_partition(&key, min_ts).await {
                // retried on the next tick; never fatal
                warn!(
                    stream_id = %key.stream_id,
                    partition = key.partition,
                    "bucket reconciliation failed: {}", e
                );
            }
        }
    }

    async fn reconcile_partition(&self, key: &PartitionKey, min_ts: u64) -> Result<(), StorageError> {
        // (1) when memory has no usable newest bucket, adopt the latest
        // stored one
        let need_latest = {
            let partitions = self.partitions.lock();
            match partitions.get(key).and_then(|s| s.buckets.first().copied()) {
                None => true,
                Some((_, newest_id)) => self
                    .buckets
                    .get(&newest_id)
                    .map(|b| b.is_almost_full())
                    .unwrap_or(true),
            }
        };
        if need_latest {
            let latest = self.db.last_buckets(&key.stream_id, key.partition, 1, None).await?;
            if let Some(record) = latest.into_iter().next() {
                self.adopt(record);
            }
        }
        if self.try_resolve(key, min_ts) {
            return Ok(());
        }

        // (2) an older stored bucket may cover the waiting timestamp
        if let Some(record) = self.db.bucket_covering(&key.stream_id, key.partition, min_ts).await? {
            self.adopt(record);
        }
        if self.try_resolve(key, min_ts) {
            return Ok(());
        }

        // (3) create a fresh in-memory bucket anchored at the waiting
        // timestamp; its row is written lazily by the persistence sweep
        let id = new_bucket_id(min_ts);
        let bucket = Bucket::new(
            id,
            &key.stream_id,
            key.partition,
            min_ts,
            self.max_bucket_size,
            self.max_bucket_records,
            self.keep_alive_secs,
        );
        info!(
            stream_id = %key.stream_id,
            partition = key.partition,
            bucket_id = %id,
            date_create = min_ts,
            "created bucket"
        );
        self.buckets.insert(id, bucket);
        let mut partitions = self.partitions.lock();
        if let Some(state) = partitions.get_mut(key) {
            state.insert(min_ts, id);
            state.min_timestamp = None;
        }
        Ok(())
    }

    /// Clear `min_timestamp` if the in-memory scan can now place it.
    fn try_resolve(&self, key: &PartitionKey, min_ts: u64) -> bool {
        let mut partitions = self.partitions.lock();
        let state = match partitions.get_mut(key) {
            Some(state) => state,
            None => return true,
        };
        if self.find_bucket_id(state, min_ts).is_some() {
            state.min_timestamp = None;
            true
        } else {
            false
        }
    }

    /// Track a bucket reconstructed from its database row.
    fn adopt(&self, record: BucketRecord) {
        if self.buckets.contains_key(&record.id) {
            return;
        }
        let bucket = Bucket::restore(
            record.id,
            &record.stream_id,
            record.partition,
            record.date_create,
            record.size,
            record.records,
            self.max_bucket_size,
            self.max_bucket_records,
            self.keep_alive_secs,
        );
        debug!(bucket_id = %record.id, date_create = record.date_create, "adopted bucket from database");
        self.buckets.insert(record.id, bucket);
        let key = PartitionKey {
            stream_id: record.stream_id,
            partition: record.partition,
        };
        let mut partitions = self.partitions.lock();
        partitions
            .entry(key)
            .or_default()
            .insert(record.date_create, record.id);
    }

    // ==========================================
    // PERSISTENCE SWEEP
    // ==========================================

    async fn run_persistence_sweep(self: Arc<Self>, period_ms: u64) {
        let mut ticker = interval(Duration::from_millis(period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.store_dirty_buckets().await,
            }
        }
        debug!("bucket persistence sweep stopped");
    }

    async fn store_dirty_buckets(&self) {
        let dirty: Vec<BucketRecord> = self
            .buckets
            .iter()
            .filter(|b| !b.is_stored())
            .map(|b| BucketRecord {
                id: b.id,
                stream_id: b.stream_id.clone(),
                partition: b.partition,
                date_create: b.date_create(),
                records: b.records(),
                size: b.size(),
            })
            .collect();

        for record in dirty {
            match self.db.upsert_bucket(&record).await {
                Ok(()) => {
                    if let Some(mut bucket) = self.buckets.get_mut(&record.id) {
                        // a concurrent increment may have raced the upsert;
                        // only matching counters mark the row as current
                        if bucket.records() == record.records {
                            bucket.set_stored();
                        }
                    }
                }
                Err(e) => {
                    warn!(bucket_id = %record.id, "bucket upsert failed, will retry next sweep: {}", e);
                }
            }
        }

        self.evict_dead_buckets();
    }

    fn evict_dead_buckets(&self) {
        let dead: Vec<(BucketId, PartitionKey)> = self
            .buckets
            .iter()
            .filter(|b| b.is_stored() && !b.is_alive())
            .map(|b| {
                (
                    b.id,
                    PartitionKey {
                        stream_id: b.stream_id.clone(),
                        partition: b.partition,
                    },
                )
            })
            .collect();
        if dead.is_empty() {
            return;
        }
        {
            let mut partitions = self.partitions.lock();
            for (id, key) in &dead {
                if let Some(state) = partitions.get_mut(key) {
                    state.remove(*id);
                }
            }
        }
        for (id, _) in &dead {
            self.buckets.remove(id);
        }
        debug!(count = dead.len(), "evicted dead buckets from memory");
    }
}
