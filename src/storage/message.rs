use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One message of a stream partition, already deserialized by the protocol
/// layer. The engine never inspects the payload; it only accounts its size
/// and persists the serialized envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub stream_id: String,
    pub partition: u32,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub sequence_no: u64,
    pub publisher_id: String,
    pub msg_chain_id: String,
    pub payload: Bytes,
}

impl StreamMessage {
    /// Payload byte length, used for all bucket and batch size accounting.
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Serialize the full message into the row payload envelope.
    pub fn to_row_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a message from a row payload envelope.
    pub fn from_row_payload(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}
