//! Index bookkeeping: who holds which global index, and under which attribute.
//!
//! The types in this module are built once per topology and stay immutable
//! while exchanges run:
//! - [`index_set::ParallelIndexSet`]: this rank's `local position -> (global, attribute)` map,
//! - [`remote::RemoteIndices`]: the peer <-> local-index correspondence derived collectively,
//! - [`interface::Interface`]: the attribute-filtered send/receive plan.

pub mod attribute;
pub mod index_set;
pub mod interface;
pub mod remote;
