//! BatchManager: single actor task owning the open batch of each bucket and
//! the pending/retry lifecycle.
//!
//! Batch state transitions are explicit messages on the actor channel, so a
//! transition handler never re-enters another. Timers (close timeout, retry
//! delay) are single-owner task handles, re-armed by cancel-then-create.
//! Each insert attempt is one atomic multi-row write; retries for a given
//! batch are strictly sequential.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::storage::batch::{Batch, DoneCallback};
use crate::storage::bucket::BucketId;
use crate::storage::db::{Database, MessageRow};
use crate::storage::errors::{DbError, StorageError};
use crate::storage::message::StreamMessage;

// ==========================================
// COMMANDS (The Internal Protocol)
// ==========================================

enum BatchCommand {
    Store {
        bucket_id: BucketId,
        message: StreamMessage,
        done: Option<DoneCallback>,
    },
    /// A batch's close timer elapsed.
    CloseTimeout { batch_id: Uuid },
    /// A pending batch's insert delay elapsed.
    ExecuteInsert { batch_id: Uuid },
    /// An insert attempt settled.
    InsertDone {
        batch_id: Uuid,
        result: Result<(), DbError>,
    },
    Stop { reply: oneshot::Sender<()> },
}

// ==========================================
// PUBLIC HANDLE
// ==========================================

#[derive(Clone)]
pub struct BatchManager {
    tx: mpsc::Sender<BatchCommand>,
}

impl BatchManager {
    pub fn new(db: Arc<dyn Database>, config: &StorageConfig) -> Result<Self, StorageError> {
        if config.max_batch_size == 0
            || config.max_batch_records == 0
            || config.batch_close_timeout_ms == 0
            || config.batch_max_retries == 0
        {
            return Err(StorageError::InvalidConfig(
                "batch limits, close timeout and max retries must be positive".into(),
            ));
        }

        let (tx, rx) = mpsc::channel(config.batch_channel_capacity);
        let actor = BatchActor {
            id: Uuid::new_v4(),
            db,
            tx: tx.clone(),
            open: HashMap::new(),
            pending: HashMap::new(),
            timers: HashMap::new(),
            max_batch_size: config.max_batch_size,
            max_batch_records: config.max_batch_records,
            close_timeout_ms: config.batch_close_timeout_ms,
            max_retries: config.batch_max_retries,
        };
        tokio::spawn(actor.run(rx));

        Ok(Self { tx })
    }

    /// Queue one message for durable insertion into `bucket_id`. The
    /// callback resolves when the owning batch settles.
    pub async fn store(
        &self,
        bucket_id: BucketId,
        message: StreamMessage,
        done: Option<DoneCallback>,
    ) -> Result<(), StorageError> {
        self.tx
            .send(BatchCommand::Store {
                bucket_id,
                message,
                done,
            })
            .await
            .map_err(|_| StorageError::Closed)
    }

    /// Discard open and pending batches without flushing them. Messages
    /// queued at shutdown are lost; data already written is unaffected.
    pub async fn stop(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(BatchCommand::Stop { reply }).await.is_ok() {
            let _ = done.await;
        }
    }
}

// ==========================================
// ACTOR
// ==========================================

struct BatchActor {
    /// Correlation id for log lines.
    id: Uuid,
    db: Arc<dyn Database>,
    /// Self-sender used by timers and insert tasks.
    tx: mpsc::Sender<BatchCommand>,
    /// At most one open batch per bucket.
    open: HashMap<BucketId, Batch>,
    /// Locked batches waiting on (or retrying) their insert.
    pending: HashMap<Uuid, Batch>,
    /// Live close/retry timer per batch; always aborted before replacement.
    timers: HashMap<Uuid, JoinHandle<()>>,
    max_batch_size: u64,
    max_batch_records: u64,
    close_timeout_ms: u64,
    max_retries: u32,
}

impl BatchActor {
    async fn run(mut self, mut rx: mpsc::Receiver<BatchCommand>) {
        debug!(manager_id = %self.id, "batch manager started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                BatchCommand::Store {
                    bucket_id,
                    message,
                    done,
                } => self.handle_store(bucket_id, message, done),
                BatchCommand::CloseTimeout { batch_id } => self.handle_close_timeout(batch_id),
                BatchCommand::ExecuteInsert { batch_id } => self.handle_execute_insert(batch_id),
                BatchCommand::InsertDone { batch_id, result } => {
                    self.handle_insert_done(batch_id, result)
                }
                BatchCommand::Stop { reply } => {
                    self.handle_stop();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!(manager_id = %self.id, "batch manager stopped");
    }

    fn handle_store(&mut self, bucket_id: BucketId, message: StreamMessage, done: Option<DoneCallback>) {
        if let Some(open) = self.open.get(&bucket_id) {
            if open.is_full() {
                // Eager lock: a full batch must not keep accepting messages
                // between the fullness check and its close timer firing.
                let batch = self.open.remove(&bucket_id).unwrap();
                debug!(batch_id = %batch.id, records = batch.message_count(), "batch full, locking");
                self.lock_batch(batch);
            }
        }
        if !self.open.contains_key(&bucket_id) {
            let batch = Batch::new(
                bucket_id,
                self.max_batch_size,
                self.max_batch_records,
                self.close_timeout_ms,
                self.max_retries,
            );
            debug!(batch_id = %batch.id, %bucket_id, "opened batch");
            self.arm_close_timer(batch.id);
            self.open.insert(bucket_id, batch);
        }
        let batch = self.open.get_mut(&bucket_id).unwrap();
        batch.push(message, done);
    }

    /// Arm the close timer of a freshly opened batch.
    fn arm_close_timer(&mut self, batch_id: Uuid) {
        let delay = Duration::from_millis(self.close_timeout_ms);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(BatchCommand::CloseTimeout { batch_id }).await;
        });
        if let Some(old) = self.timers.insert(batch_id, handle) {
            old.abort();
        }
    }

    fn handle_close_timeout(&mut self, batch_id: Uuid) {
        // the batch may already have been locked eagerly; match by id
        let bucket_id = self
            .open
            .iter()
            .find(|(_, b)| b.id == batch_id)
            .map(|(k, _)| *k);
        if let Some(bucket_id) = bucket_id {
            let batch = self.open.remove(&bucket_id).unwrap();
            debug!(batch_id = %batch_id, records = batch.message_count(), "batch close timeout elapsed");
            self.lock_batch(batch);
        }
    }

    /// OPENED -> LOCKED -> PENDING: out of the open map, into the pending
    /// set, insert scheduled. No interval exists where the batch is in both.
    fn lock_batch(&mut self, mut batch: Batch) {
        if let Some(timer) = self.timers.remove(&batch.id) {
            timer.abort();
        }
        batch.lock();
        batch.mark_pending();
        self.schedule_insert(batch);
    }

    /// Arm the insert timer: zero delay on the first attempt, then the
    /// arithmetic retry series.
    fn schedule_insert(&mut self, batch: Batch) {
        let batch_id = batch.id;
        let delay = Duration::from_millis(batch.insert_delay_ms());
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(BatchCommand::ExecuteInsert { batch_id }).await;
        });
        if let Some(old) = self.timers.insert(batch_id, handle) {
            old.abort();
        }
        self.pending.insert(batch_id, batch);
    }

    fn handle_execute_insert(&mut self, batch_id: Uuid) {
        self.timers.remove(&batch_id);
        let batch = match self.pending.get(&batch_id) {
            Some(batch) => batch,
            None => return,
        };
        let rows: Vec<MessageRow> = batch
            .messages()
            .iter()
            .map(|m| to_row(m, batch.bucket_id))
            .collect();
        debug!(batch_id = %batch_id, records = rows.len(), retries = batch.retries(), "insert attempt");
        let db = self.db.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = db.insert_message_rows(rows).await;
            let _ = tx.send(BatchCommand::InsertDone { batch_id, result }).await;
        });
    }

    fn handle_insert_done(&mut self, batch_id: Uuid, result: Result<(), DbError>) {
        let mut batch = match self.pending.remove(&batch_id) {
            Some(batch) => batch,
            None => return,
        };
        match result {
            Ok(()) => {
                debug!(
                    batch_id = %batch_id,
                    records = batch.message_count(),
                    retries = batch.retries(),
                    "batch inserted"
                );
                batch.done();
                batch.clear();
            }
            Err(e) if batch.reached_max_retries() => {
                // availability over durability: after the retry ceiling the
                // messages are discarded and the loss is only observable to
                // callers through their dropped callbacks
                error!(
                    manager_id = %self.id,
                    batch_id = %batch_id,
                    retries = batch.retries(),
                    records = batch.message_count(),
                    "dropping batch after exhausting retries: {}", e
                );
                batch.clear();
            }
            Err(e) => {
                batch.register_retry();
                warn!(
                    batch_id = %batch_id,
                    retries = batch.retries(),
                    "batch insert failed, retrying: {}", e
                );
                self.schedule_insert(batch);
            }
        }
    }

    fn handle_stop(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        let queued: usize = self
            .open
            .values()
            .chain(self.pending.values())
            .map(|b| b.message_count())
            .sum();
        if queued > 0 {
            warn!(
                manager_id = %self.id,
                messages = queued,
                "discarding unflushed batches at shutdown"
            );
        }
        self.open.clear();
        self.pending.clear();
    }
}

fn to_row(message: &StreamMessage, bucket_id: BucketId) -> MessageRow {
    let payload = match message.to_row_payload() {
        Ok(raw) => Some(raw),
        Err(e) => {
            // should be unreachable for this type; the row is still written
            // so the counters stay consistent, readers skip it
            warn!("failed to serialize message payload: {}", e);
            None
        }
    };
    MessageRow {
        stream_id: message.stream_id.clone(),
        partition: message.partition,
        bucket_id,
        ts: message.timestamp,
        sequence_no: message.sequence_no,
        publisher_id: message.publisher_id.clone(),
        msg_chain_id: message.msg_chain_id.clone(),
        payload,
    }
}
