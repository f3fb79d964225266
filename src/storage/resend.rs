//! Resend queries: historical reads served as lazy, cancellable,
//! backpressured message streams.
//!
//! Each request spawns a driver task that resolves candidate buckets, runs
//! the range sub-queries in order, and forwards decoded messages through a
//! bounded channel. A full channel suspends the driver (backpressure),
//! dropping the stream aborts it (closing the database cursors), and the
//! driver yields to the scheduler during long synchronous stretches so one
//! slow consumer cannot starve the process.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::storage::bucket::BucketId;
use crate::storage::bucket_manager::BucketManager;
use crate::storage::db::{Database, MessageQuery, MessageRow, RowFilter, RowOrder};
use crate::storage::errors::StorageError;
use crate::storage::message::StreamMessage;

/// Capacity of the channel feeding a `MessageStream`; bounds rows buffered
/// ahead of a slow consumer.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Page size used when walking buckets newest-first for `request_last`.
const BUCKET_SCAN_PAGE: u64 = 10;

/// Drivers yield to the scheduler after this much continuous work.
const YIELD_EVERY: Duration = Duration::from_millis(100);

/// A lazy, ordered sequence of historical messages. Not restartable: every
/// request issues fresh queries.
pub struct MessageStream {
    rx: mpsc::Receiver<Result<StreamMessage, StorageError>>,
    driver: JoinHandle<()>,
}

impl MessageStream {
    fn spawn<F, Fut>(make: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Result<StreamMessage, StorageError>>) -> Fut,
        Fut: Future<Output = Result<(), StorageError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let fut = make(tx.clone());
        let driver = tokio::spawn(async move {
            if let Err(e) = fut.await {
                // a failed driver terminates this one sequence only
                let _ = tx.send(Err(e)).await;
            }
        });
        Self { rx, driver }
    }

    /// Tear the sequence down without consuming the rest of it.
    pub fn destroy(mut self) {
        self.rx.close();
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl Stream for MessageStream {
    type Item = Result<StreamMessage, StorageError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ==========================================
// REQUEST DRIVERS
// ==========================================

/// The `limit` most recent messages, emitted in chronological order.
pub(crate) fn request_last(
    db: Arc<dyn Database>,
    buckets: Arc<BucketManager>,
    stream_id: String,
    partition: u32,
    limit: u64,
) -> MessageStream {
    MessageStream::spawn(move |tx| async move {
        // walk buckets newest-first, accumulating stored-row counts until
        // they cover the requested limit
        let mut bucket_ids: Vec<BucketId> = Vec::new();
        let mut counted: u64 = 0;
        let mut window = BUCKET_SCAN_PAGE;
        loop {
            let records = buckets.get_last_buckets(&stream_id, partition, window, None).await?;
            let mut exhausted = (records.len() as u64) < window;
            let mut progressed = false;
            for record in records {
                if bucket_ids.contains(&record.id) {
                    continue;
                }
                progressed = true;
                counted += db.count_bucket_rows(&stream_id, partition, record.id).await?;
                bucket_ids.push(record.id);
                if counted >= limit {
                    exhausted = true;
                    break;
                }
            }
            if exhausted || !progressed {
                break;
            }
            window += BUCKET_SCAN_PAGE;
        }
        if bucket_ids.is_empty() {
            return Ok(());
        }
        debug!(
            stream_id = %stream_id,
            partition,
            buckets = bucket_ids.len(),
            counted,
            "resolved buckets for last-n resend"
        );

        // one descending, limited fetch across the collected buckets,
        // reversed so the output is chronological
        let query = MessageQuery {
            stream_id,
            partition,
            bucket_ids,
            filter: RowFilter::All,
            publisher_id: None,
            msg_chain_id: None,
            order: RowOrder::Desc,
            limit: Some(limit),
        };
        let mut rows = db.stream_message_rows(query);
        let mut collected = Vec::new();
        while let Some(row) = rows.recv().await {
            if let Some(message) = decode_row(row?) {
                collected.push(message);
            }
        }
        for message in collected.into_iter().rev() {
            if tx.send(Ok(message)).await.is_err() {
                break;
            }
        }
        Ok(())
    })
}

/// Everything from `(from_ts, from_seq)` onwards. Without a publisher id the
/// sequence number is intentionally not applied: consumers rely on the
/// lenient timestamp-only filter.
pub(crate) fn request_from(
    db: Arc<dyn Database>,
    buckets: Arc<BucketManager>,
    stream_id: String,
    partition: u32,
    from_ts: u64,
    from_sequence_no: u64,
    publisher_id: Option<String>,
) -> MessageStream {
    MessageStream::spawn(move |tx| async move {
        let records = buckets
            .get_buckets_by_timestamp(&stream_id, partition, Some(from_ts), None)
            .await?;
        let bucket_ids: Vec<BucketId> = records.iter().map(|r| r.id).collect();
        if bucket_ids.is_empty() {
            return Ok(());
        }

        let filters = match publisher_id {
            Some(_) => vec![
                RowFilter::TsEqSeqAtLeast {
                    ts: from_ts,
                    sequence_no: from_sequence_no,
                },
                RowFilter::TsAfter { from_ts },
            ],
            None => vec![RowFilter::TsAtLeast { from_ts }],
        };
        run_sub_queries(
            &db,
            &tx,
            stream_id,
            partition,
            bucket_ids,
            publisher_id,
            None,
            filters,
        )
        .await
    })
}

/// Everything between `(from_ts, from_seq)` and `(to_ts, to_seq)` inclusive,
/// optionally narrowed to one publisher and message chain.
pub(crate) fn request_range(
    db: Arc<dyn Database>,
    buckets: Arc<BucketManager>,
    stream_id: String,
    partition: u32,
    from_ts: u64,
    from_sequence_no: u64,
    to_ts: u64,
    to_sequence_no: u64,
    publisher_id: Option<String>,
    msg_chain_id: Option<String>,
) -> MessageStream {
    MessageStream::spawn(move |tx| async move {
        if publisher_id.is_some() != msg_chain_id.is_some() {
            return Err(StorageError::InvalidRequest(
                "publisher id and message chain id must be given together".into(),
            ));
        }

        let records = buckets
            .get_buckets_by_timestamp(&stream_id, partition, Some(from_ts), Some(to_ts))
            .await?;
        let bucket_ids: Vec<BucketId> = records.iter().map(|r| r.id).collect();
        if bucket_ids.is_empty() {
            return Ok(());
        }

        let filters = if from_ts == to_ts {
            // collapsed plan: the generic three queries would return rows
            // outside the sequence window at the shared timestamp
            vec![RowFilter::TsEqSeqBetween {
                ts: from_ts,
                from_sequence_no,
                to_sequence_no,
            }]
        } else {
            vec![
                RowFilter::TsEqSeqAtLeast {
                    ts: from_ts,
                    sequence_no: from_sequence_no,
                },
                RowFilter::TsBetweenExclusive { from_ts, to_ts },
                RowFilter::TsEqSeqAtMost {
                    ts: to_ts,
                    sequence_no: to_sequence_no,
                },
            ]
        };
        run_sub_queries(
            &db,
            &tx,
            stream_id,
            partition,
            bucket_ids,
            publisher_id,
            msg_chain_id,
            filters,
        )
        .await
    })
}

/// Run the sub-queries in order, forwarding each query's rows downstream in
/// the order the database returns them.
#[allow(clippy::too_many_arguments)]
async fn run_sub_queries(
    db: &Arc<dyn Database>,
    tx: &mpsc::Sender<Result<StreamMessage, StorageError>>,
    stream_id: String,
    partition: u32,
    bucket_ids: Vec<BucketId>,
    publisher_id: Option<String>,
    msg_chain_id: Option<String>,
    filters: Vec<RowFilter>,
) -> Result<(), StorageError> {
    let mut last_yield = Instant::now();
    for filter in filters {
        let query = MessageQuery {
            stream_id: stream_id.clone(),
            partition,
            bucket_ids: bucket_ids.clone(),
            filter,
            publisher_id: publisher_id.clone(),
            msg_chain_id: msg_chain_id.clone(),
            order: RowOrder::Asc,
            limit: None,
        };
        let mut rows = db.stream_message_rows(query);
        while let Some(row) = rows.recv().await {
            if let Some(message) = decode_row(row?) {
                if tx.send(Ok(message)).await.is_err() {
                    // consumer destroyed the stream
                    return Ok(());
                }
            }
            if last_yield.elapsed() >= YIELD_EVERY {
                tokio::task::yield_now().await;
                last_yield = Instant::now();
            }
        }
    }
    Ok(())
}

/// Decode one row into a message. Rows with an absent or undecodable payload
/// are a tolerated upstream anomaly: logged and skipped, never fatal to the
/// sequence.
fn decode_row(row: MessageRow) -> Option<StreamMessage> {
    let payload = match row.payload {
        Some(payload) => payload,
        None => {
            warn!(
                stream_id = %row.stream_id,
                partition = row.partition,
                ts = row.ts,
                sequence_no = row.sequence_no,
                "skipping row with missing payload"
            );
            return None;
        }
    };
    match StreamMessage::from_row_payload(&payload) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(
                stream_id = %row.stream_id,
                partition = row.partition,
                ts = row.ts,
                sequence_no = row.sequence_no,
                "skipping undecodable row: {}", e
            );
            None
        }
    }
}
