use uuid::{NoContext, Timestamp, Uuid};

use crate::utils::utils_time::current_time_ms;

/// Fraction of the size/record capacity after which a successor bucket is
/// prepared, before the hard limit is hit under concurrent writers.
const ALMOST_FULL_RATIO: f64 = 0.85;

pub type BucketId = Uuid;

/// Derive a time-sortable bucket id from the bucket start instant.
pub fn new_bucket_id(date_create_ms: u64) -> BucketId {
    let secs = date_create_ms / 1000;
    let nanos = ((date_create_ms % 1000) * 1_000_000) as u32;
    Uuid::new_v7(Timestamp::from_unix(NoContext, secs, nanos))
}

/// One time-partitioned shard of a stream partition's persisted data,
/// bounded by size, record and age limits. Pure value object: all mutation
/// is serialized by the owning manager.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub id: BucketId,
    pub stream_id: String,
    pub partition: u32,
    /// Bucket start instant (ms). Never changes.
    date_create: u64,
    size: u64,
    records: u64,
    max_size: u64,
    max_records: u64,
    keep_alive_secs: u64,
    stored: bool,
}

impl Bucket {
    /// A bucket created speculatively in memory, ahead of any database row.
    pub fn new(
        id: BucketId,
        stream_id: &str,
        partition: u32,
        date_create: u64,
        max_size: u64,
        max_records: u64,
        keep_alive_secs: u64,
    ) -> Self {
        Self {
            id,
            stream_id: stream_id.to_string(),
            partition,
            date_create,
            size: 0,
            records: 0,
            max_size,
            max_records,
            keep_alive_secs,
            stored: false,
        }
    }

    /// A bucket reconstructed from its database row.
    pub fn restore(
        id: BucketId,
        stream_id: &str,
        partition: u32,
        date_create: u64,
        size: u64,
        records: u64,
        max_size: u64,
        max_records: u64,
        keep_alive_secs: u64,
    ) -> Self {
        Self {
            id,
            stream_id: stream_id.to_string(),
            partition,
            date_create,
            size,
            records,
            max_size,
            max_records,
            keep_alive_secs,
            stored: true,
        }
    }

    pub fn date_create(&self) -> u64 {
        self.date_create
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Account one stored message. Counters only ever grow; the database row
    /// is stale until the next persistence sweep.
    pub fn increment(&mut self, size: u64) {
        self.size += size;
        self.records += 1;
        self.stored = false;
    }

    pub fn is_almost_full(&self) -> bool {
        self.size as f64 >= self.max_size as f64 * ALMOST_FULL_RATIO
            || self.records as f64 >= self.max_records as f64 * ALMOST_FULL_RATIO
    }

    /// Alive while the keep-alive window since `date_create` has not passed.
    /// A bucket that is stored and no longer alive is evictable from memory.
    pub fn is_alive(&self) -> bool {
        current_time_ms() < self.date_create + self.keep_alive_secs * 1000
    }

    pub fn is_stored(&self) -> bool {
        self.stored
    }

    pub fn set_stored(&mut self) {
        self.stored = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(max_size: u64, max_records: u64, keep_alive_secs: u64) -> Bucket {
        let now = current_time_ms();
        Bucket::new(new_bucket_id(now), "stream", 0, now, max_size, max_records, keep_alive_secs)
    }

    #[test]
    fn increment_grows_counters_and_dirties() {
        let mut b = bucket(1000, 10, 60);
        assert!(!b.is_stored());
        b.set_stored();
        b.increment(100);
        b.increment(50);
        assert_eq!(b.size(), 150);
        assert_eq!(b.records(), 2);
        assert!(!b.is_stored());
    }

    #[test]
    fn almost_full_at_85_percent_of_records() {
        let mut b = bucket(1_000_000, 20, 60);
        for _ in 0..16 {
            b.increment(1);
        }
        assert!(!b.is_almost_full());
        b.increment(1); // 17 of 20
        assert!(b.is_almost_full());
    }

    #[test]
    fn almost_full_at_85_percent_of_size() {
        let mut b = bucket(100, 1_000_000, 60);
        b.increment(84);
        assert!(!b.is_almost_full());
        b.increment(1);
        assert!(b.is_almost_full());
    }

    #[test]
    fn alive_follows_keep_alive_window() {
        let b = bucket(1000, 10, 60);
        assert!(b.is_alive());
        let dead = bucket(1000, 10, 0);
        assert!(!dead.is_alive());
    }

    #[test]
    fn restored_bucket_is_stored() {
        let now = current_time_ms();
        let b = Bucket::restore(new_bucket_id(now), "stream", 0, now, 10, 2, 1000, 10, 60);
        assert!(b.is_stored());
        assert_eq!(b.records(), 2);
    }

    #[test]
    fn bucket_ids_sort_by_start_instant() {
        let a = new_bucket_id(1_000);
        let b = new_bucket_id(2_000);
        assert!(a < b);
    }
}
