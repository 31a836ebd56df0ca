//! HaloSyncError: unified error type for halo-sync public APIs.
//!
//! Build-time inconsistencies surface as [`TopologyMismatch`](HaloSyncError::TopologyMismatch),
//! failed exchanges as [`CommunicationError`](HaloSyncError::CommunicationError);
//! both are raised on every rank of the collective call that observed them.
//! Contract violations (out-of-range positions, variable-size layout
//! disagreement between ranks) are diagnosed by debug/`check-invariants`
//! assertions rather than error values.

use thiserror::Error;

use crate::index::index_set::GlobalId;

/// Unified error type for halo-sync operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HaloSyncError {
    /// Inconsistent inputs were detected during a collective rebuild of the
    /// remote-index bookkeeping. Fatal for the instance under construction.
    #[error("topology mismatch while rebuilding remote indices: {0}")]
    TopologyMismatch(String),
    /// The transport reported a failed transfer, or the success reduction
    /// discovered one on a peer. The exchange plan should be discarded via
    /// `free()`.
    #[error("a communication error occurred during the exchange")]
    CommunicationError,
    /// An index set was used before `finalize()` was called on it.
    #[error("index set must be finalized before use")]
    UnfinalizedIndexSet,
    /// `add` was called on an index set that is already finalized.
    #[error("index set is already finalized")]
    AlreadyFinalized,
    /// Two entries of one index set carry the same global id.
    #[error("duplicate global index {0:?} in index set")]
    DuplicateGlobalIndex(GlobalId),
    /// The local positions of an index set do not cover `0..len` exactly once.
    #[error("local positions are not dense: position {position} out of range or repeated (set has {len} entries)")]
    NonDenseLocalIndices { position: u32, len: usize },
    /// `forward`/`backward` was called before `build`, or after `free`.
    #[error("no exchange plan: build() must be called first")]
    PlanMissing,
    /// The container handed to an exchange has a different primitive element
    /// size than the one the plan was built for.
    #[error("container item size {got} does not match the built plan ({expected})")]
    ItemSizeMismatch { expected: usize, got: usize },
    /// A message had the wrong length for its slot in the plan.
    #[error("message from rank {peer}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        peer: usize,
        expected: usize,
        got: usize,
    },
    /// An attribute code received on the wire does not decode.
    #[error("attribute code {0} is not valid on the wire")]
    InvalidAttribute(u32),
    /// Attempt to append a zero-length block to a block vector.
    #[error("zero-length block is not allowed")]
    ZeroLengthBlock,
}
