use std::sync::Arc;
use std::time::Duration;

use brook::config::StorageConfig;
use brook::storage::bucket::new_bucket_id;
use brook::storage::bucket_manager::BucketManager;
use brook::storage::db::{BucketRecord, Database, SqliteDatabase};
use brook::utils::utils_time::current_time_ms;

mod helpers;
use helpers::test_config;

fn open_db(config: &StorageConfig) -> Arc<SqliteDatabase> {
    Arc::new(SqliteDatabase::open(&config.db_path, None).unwrap())
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

mod resolution {
    use super::*;

    #[tokio::test]
    async fn first_message_returns_not_found_then_reconciliation_creates_bucket() {
        brook::init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let db = open_db(&config);
        let manager = BucketManager::new(db.clone(), &config).unwrap();

        let ts = current_time_ms();
        assert!(manager.get_bucket_id("stream-a", 0, ts).is_none());

        // the loop must create a bucket anchored at the waiting timestamp
        wait_for("bucket creation", || {
            manager.get_bucket_id("stream-a", 0, ts).is_some()
        })
        .await;

        manager.stop();
    }

    #[tokio::test]
    async fn later_timestamps_keep_resolving_to_the_same_bucket() {
        brook::init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let db = open_db(&config);
        let manager = BucketManager::new(db.clone(), &config).unwrap();

        let ts = current_time_ms();
        manager.get_bucket_id("stream-b", 0, ts);
        wait_for("bucket creation", || {
            manager.get_bucket_id("stream-b", 0, ts).is_some()
        })
        .await;

        let id = manager.get_bucket_id("stream-b", 0, ts).unwrap();
        // monotonicity: a later timestamp resolves to the same bucket while
        // it has capacity
        assert_eq!(manager.get_bucket_id("stream-b", 0, ts + 500), Some(id));
        assert_eq!(manager.get_bucket_id("stream-b", 0, ts + 5_000), Some(id));

        manager.stop();
    }

    #[tokio::test]
    async fn almost_full_bucket_triggers_a_successor() {
        brook::init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.max_bucket_records = 10; // almost full at 9 records
        let db = open_db(&config);
        let manager = BucketManager::new(db.clone(), &config).unwrap();

        let ts = current_time_ms();
        manager.get_bucket_id("stream-c", 0, ts);
        wait_for("first bucket", || {
            manager.get_bucket_id("stream-c", 0, ts).is_some()
        })
        .await;
        let first = manager.get_bucket_id("stream-c", 0, ts).unwrap();

        for _ in 0..9 {
            manager.increment_bucket(&first, 10);
        }

        // the almost-full bucket no longer accepts new timestamps
        let later = ts + 1_000;
        assert!(manager.get_bucket_id("stream-c", 0, later).is_none());

        wait_for("successor bucket", || {
            manager.get_bucket_id("stream-c", 0, later).is_some()
        })
        .await;
        let second = manager.get_bucket_id("stream-c", 0, later).unwrap();
        assert_ne!(first, second);

        // out-of-order arrival older than the successor still lands in the
        // first bucket
        assert_eq!(manager.get_bucket_id("stream-c", 0, ts + 100), Some(first));

        manager.stop();
    }

    #[tokio::test]
    async fn increment_of_unknown_bucket_is_ignored() {
        brook::init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let db = open_db(&config);
        let manager = BucketManager::new(db.clone(), &config).unwrap();

        manager.increment_bucket(&new_bucket_id(current_time_ms()), 100);
        assert_eq!(manager.tracked_buckets(), 0);

        manager.stop();
    }
}

mod persistence {
    use super::*;

    #[tokio::test]
    async fn sweep_persists_bucket_counters() {
        brook::init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let db = open_db(&config);
        let manager = BucketManager::new(db.clone(), &config).unwrap();

        let ts = current_time_ms();
        manager.get_bucket_id("stream-d", 0, ts);
        wait_for("bucket creation", || {
            manager.get_bucket_id("stream-d", 0, ts).is_some()
        })
        .await;
        let id = manager.get_bucket_id("stream-d", 0, ts).unwrap();
        manager.increment_bucket(&id, 128);
        manager.increment_bucket(&id, 64);

        tokio::time::sleep(Duration::from_millis(200)).await;

        let stored = db.last_buckets("stream-d", 0, 10, None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].records, 2);
        assert_eq!(stored[0].size, 192);

        manager.stop();
    }

    #[tokio::test]
    async fn dead_stored_buckets_are_evicted_from_memory() {
        brook::init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let db = open_db(&config);
        let manager = BucketManager::new(db.clone(), &config).unwrap();

        // a timestamp far in the past creates a bucket already outside its
        // keep-alive window
        let old_ts = current_time_ms() - 10 * 60 * 1000;
        manager.get_bucket_id("stream-e", 0, old_ts);
        wait_for("bucket creation", || manager.tracked_buckets() > 0).await;

        // stored by the sweep, then evicted; the database keeps the row
        wait_for("eviction", || manager.tracked_buckets() == 0).await;
        let stored = db.last_buckets("stream-e", 0, 10, None).await.unwrap();
        assert_eq!(stored.len(), 1);

        manager.stop();
    }

    #[tokio::test]
    async fn buckets_by_timestamp_includes_the_boundary_bucket() {
        brook::init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let db = open_db(&config);
        let manager = BucketManager::new(db.clone(), &config).unwrap();

        for date_create in [1_000u64, 2_000, 3_000] {
            db.upsert_bucket(&BucketRecord {
                id: new_bucket_id(date_create),
                stream_id: "stream-f".into(),
                partition: 0,
                date_create,
                records: 1,
                size: 10,
            })
            .await
            .unwrap();
        }

        // range starting inside bucket@1000: the boundary bucket is included
        let records = manager
            .get_buckets_by_timestamp("stream-f", 0, Some(1_500), Some(2_500))
            .await
            .unwrap();
        let mut dates: Vec<u64> = records.iter().map(|r| r.date_create).collect();
        dates.sort();
        assert_eq!(dates, vec![1_000, 2_000]);

        // open start: everything created at or before the end
        let records = manager
            .get_buckets_by_timestamp("stream-f", 0, None, Some(2_000))
            .await
            .unwrap();
        let mut dates: Vec<u64> = records.iter().map(|r| r.date_create).collect();
        dates.sort();
        assert_eq!(dates, vec![1_000, 2_000]);

        manager.stop();
    }

    #[tokio::test]
    async fn last_buckets_honours_limit_and_before() {
        brook::init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let db = open_db(&config);
        let manager = BucketManager::new(db.clone(), &config).unwrap();

        for date_create in [1_000u64, 2_000, 3_000] {
            db.upsert_bucket(&BucketRecord {
                id: new_bucket_id(date_create),
                stream_id: "stream-g".into(),
                partition: 0,
                date_create,
                records: 0,
                size: 0,
            })
            .await
            .unwrap();
        }

        let records = manager.get_last_buckets("stream-g", 0, 2, None).await.unwrap();
        let dates: Vec<u64> = records.iter().map(|r| r.date_create).collect();
        assert_eq!(dates, vec![3_000, 2_000]);

        let records = manager
            .get_last_buckets("stream-g", 0, 10, Some(2_000))
            .await
            .unwrap();
        let dates: Vec<u64> = records.iter().map(|r| r.date_create).collect();
        assert_eq!(dates, vec![2_000, 1_000]);

        manager.stop();
    }
}
