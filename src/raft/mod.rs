pub mod inbound;
pub mod message;

/// Calls allowed to await a response on one append pipeline.
pub const MAX_PIPELINE: usize = 20;
/// Bytes per InstallSnapshot data frame.
pub const SNAPSHOT_CHUNK_SIZE: usize = 4096;
/// Capacity of the shared inbound channel; a full channel blocks the dispatcher.
pub const INBOUND_QUEUE_CAPACITY: usize = 1;

/// Tunables shared by the outbound and inbound halves of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub max_pipeline: usize,
    pub snapshot_chunk_size: usize,
    pub inbound_queue_capacity: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_pipeline: MAX_PIPELINE,
            snapshot_chunk_size: SNAPSHOT_CHUNK_SIZE,
            inbound_queue_capacity: INBOUND_QUEUE_CAPACITY,
        }
    }
}
