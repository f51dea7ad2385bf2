//! Error taxonomy for the mesh transport core.
//!
//! Local-recovery kinds (stale sequence, malformed fragment, unknown codec,
//! signature failure) are typically logged and dropped by the caller rather
//! than propagated; back-pressure and queue-full are meant to reach the
//! caller of `send`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("duty cycle exceeded, retry after {wait_ms} ms")]
    DutyCycleExceeded { wait_ms: u64 },

    #[error("transmission denied: {reason}")]
    TransmissionDenied { reason: String },

    #[error("payload of {size} bytes requires fragmentation (max fragment size {max})")]
    FragmentationRequired { size: usize, max: usize },

    #[error("checksum mismatch for fragment {index} of session {session_id}")]
    ReassemblyChecksumMismatch { session_id: u64, index: u16 },

    #[error("reassembly session {session_id} timed out with {received}/{total} fragments")]
    ReassemblyTimeout {
        session_id: u64,
        received: u16,
        total: u16,
    },

    #[error("decompression would expand {compressed} bytes into more than {limit}x ({original} declared)")]
    DecompressionExpansionExceeded {
        compressed: usize,
        original: u32,
        limit: u32,
    },

    #[error("decompressed size {actual} does not match declared original size {expected}")]
    DecompressionSizeMismatch { expected: u32, actual: u32 },

    #[error("signature verification failed for message from {originator}")]
    SignatureInvalid { originator: u64 },

    #[error("sequence {sequence} is not newer than last seen {last_seen} for originator {originator}")]
    SequenceStale {
        originator: u64,
        sequence: u64,
        last_seen: u64,
    },

    #[error("neighbor table at capacity ({max_neighbors})")]
    NeighborCapacityReached { max_neighbors: usize },

    #[error("queue full at priority {priority:?} (capacity {capacity})")]
    QueueFull {
        priority: crate::envelope::Priority,
        capacity: usize,
    },

    #[error("back-pressure: {pending}/{max_pending} confirmed messages pending")]
    BackPressure { pending: usize, max_pending: usize },

    #[error("delivery timed out for message {message_id:?}")]
    DeliveryTimeout { message_id: crate::reliability::MessageId },

    #[error("message {message_id:?} exceeded {max_attempts} attempts")]
    MaxRetriesExceeded {
        message_id: crate::reliability::MessageId,
        max_attempts: u32,
    },

    #[error("unknown compression codec tag {tag}")]
    UnknownCodec { tag: u8 },

    #[error("malformed fragment: {reason}")]
    MalformedFragment { reason: String },

    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },
}

pub type MeshResult<T> = Result<T, MeshError>;
