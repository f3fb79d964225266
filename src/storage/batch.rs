use tokio::sync::oneshot;
use uuid::Uuid;

use crate::storage::bucket::BucketId;
use crate::storage::errors::StorageError;
use crate::storage::message::StreamMessage;

/// Resolves the caller's `store()` outcome once the batch settles.
pub type DoneCallback = oneshot::Sender<Result<(), StorageError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Accepting messages.
    Opened,
    /// Full or timed out; no longer accepts messages.
    Locked,
    /// In the pending set with an insert attempt scheduled or in flight.
    Pending,
    /// Terminal: persisted, or dropped after exhausting retries.
    Inserted,
}

/// An in-memory, not-yet-durable group of messages bound for one bucket.
///
/// The batch holds no timers of its own: close and retry timers are owned by
/// the manager, which drives the state machine through explicit transitions.
pub struct Batch {
    pub id: Uuid,
    pub bucket_id: BucketId,
    messages: Vec<StreamMessage>,
    callbacks: Vec<DoneCallback>,
    size: u64,
    retries: u32,
    state: BatchState,
    max_size: u64,
    max_records: u64,
    close_timeout_ms: u64,
    max_retries: u32,
}

impl Batch {
    /// Limits must be validated positive by the owning manager before any
    /// batch is constructed.
    pub fn new(
        bucket_id: BucketId,
        max_size: u64,
        max_records: u64,
        close_timeout_ms: u64,
        max_retries: u32,
    ) -> Self {
        debug_assert!(max_size > 0 && max_records > 0 && close_timeout_ms > 0 && max_retries > 0);
        Self {
            id: Uuid::new_v4(),
            bucket_id,
            messages: Vec::new(),
            callbacks: Vec::new(),
            size: 0,
            retries: 0,
            state: BatchState::Opened,
            max_size,
            max_records,
            close_timeout_ms,
            max_retries,
        }
    }

    /// Messages keep push order. The batch itself never refuses a push;
    /// fullness is checked by the owner before calling.
    pub fn push(&mut self, message: StreamMessage, done: Option<DoneCallback>) {
        self.size += message.payload_size() as u64;
        self.messages.push(message);
        if let Some(done) = done {
            self.callbacks.push(done);
        }
    }

    pub fn is_full(&self) -> bool {
        self.size >= self.max_size || self.messages.len() as u64 >= self.max_records
    }

    pub fn lock(&mut self) {
        self.state = BatchState::Locked;
    }

    pub fn mark_pending(&mut self) {
        self.state = BatchState::Pending;
    }

    /// Delay before the next insert attempt: zero on the first, then an
    /// arithmetic series growing with each failure.
    pub fn insert_delay_ms(&self) -> u64 {
        self.close_timeout_ms * self.retries as u64
    }

    /// Count a failed attempt. `retries` is clamped at `max_retries`.
    pub fn register_retry(&mut self) {
        if self.retries < self.max_retries {
            self.retries += 1;
        }
    }

    pub fn reached_max_retries(&self) -> bool {
        self.retries == self.max_retries
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn messages(&self) -> &[StreamMessage] {
        &self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fire and clear all completion callbacks.
    pub fn done(&mut self) {
        for cb in self.callbacks.drain(..) {
            let _ = cb.send(Ok(()));
        }
    }

    /// Drop queued messages and callbacks; terminal state. Unfired callbacks
    /// resolve their receivers with a drop error.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.callbacks.clear();
        self.size = 0;
        self.state = BatchState::Inserted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::storage::bucket::new_bucket_id;

    fn msg(ts: u64, payload: &str) -> StreamMessage {
        StreamMessage {
            stream_id: "s".into(),
            partition: 0,
            timestamp: ts,
            sequence_no: 0,
            publisher_id: "p".into(),
            msg_chain_id: "c".into(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }

    #[test]
    fn push_preserves_order_and_accumulates_size() {
        let mut batch = Batch::new(new_bucket_id(0), 1000, 10, 100, 3);
        batch.push(msg(1, "aa"), None);
        batch.push(msg(2, "bbbb"), None);
        assert_eq!(batch.message_count(), 2);
        assert_eq!(batch.size(), 6);
        assert_eq!(batch.messages()[0].timestamp, 1);
        assert_eq!(batch.messages()[1].timestamp, 2);
    }

    #[test]
    fn full_by_record_count() {
        let mut batch = Batch::new(new_bucket_id(0), 1_000_000, 2, 100, 3);
        batch.push(msg(1, "x"), None);
        assert!(!batch.is_full());
        batch.push(msg(2, "x"), None);
        assert!(batch.is_full());
    }

    #[test]
    fn full_by_byte_size() {
        let mut batch = Batch::new(new_bucket_id(0), 4, 100, 100, 3);
        batch.push(msg(1, "ab"), None);
        assert!(!batch.is_full());
        batch.push(msg(2, "cd"), None);
        assert!(batch.is_full());
    }

    #[test]
    fn retry_delay_grows_and_clamps() {
        let mut batch = Batch::new(new_bucket_id(0), 1000, 10, 100, 2);
        assert_eq!(batch.insert_delay_ms(), 0);
        batch.register_retry();
        assert_eq!(batch.insert_delay_ms(), 100);
        batch.register_retry();
        assert_eq!(batch.insert_delay_ms(), 200);
        assert!(batch.reached_max_retries());
        batch.register_retry();
        assert_eq!(batch.retries(), 2);
    }

    #[test]
    fn state_transitions() {
        let mut batch = Batch::new(new_bucket_id(0), 1000, 10, 100, 3);
        assert_eq!(batch.state(), BatchState::Opened);
        batch.lock();
        assert_eq!(batch.state(), BatchState::Locked);
        batch.mark_pending();
        assert_eq!(batch.state(), BatchState::Pending);
        batch.clear();
        assert_eq!(batch.state(), BatchState::Inserted);
        assert_eq!(batch.message_count(), 0);
    }

    #[tokio::test]
    async fn done_fires_every_callback_once() {
        let mut batch = Batch::new(new_bucket_id(0), 1000, 10, 100, 3);
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        batch.push(msg(1, "x"), Some(tx1));
        batch.push(msg(2, "x"), Some(tx2));
        batch.done();
        assert!(rx1.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn clear_drops_callbacks_unfired() {
        let mut batch = Batch::new(new_bucket_id(0), 1000, 10, 100, 3);
        let (tx, rx) = oneshot::channel();
        batch.push(msg(1, "x"), Some(tx));
        batch.clear();
        assert!(rx.await.is_err());
    }
}
