//! # halo-sync
//!
//! halo-sync is a small Rust library for keeping distributed indexed data
//! structures in sync on message-passing clusters. Each process owns a slice of
//! a globally indexed container (a vector or block vector over a partitioned
//! mesh or matrix); some indices are shared with peer processes under
//! attributes such as owner, ghost or overlap. The library derives, once per
//! topology, which local indices are mirrored where, filters that bookkeeping
//! into a communication plan, and then executes forward/backward exchanges of
//! the values at the shared indices.
//!
//! ## Features
//! - `ParallelIndexSet`: the per-process `local position -> (global id, attribute)`
//!   mapping, sorted by global id
//! - `RemoteIndices`: collective discovery of the peer <-> local-index
//!   correspondence
//! - `Interface`: attribute-filtered send/receive plans, identical in order on
//!   both endpoints
//! - `BufferedCommunicator` and `DatatypeCommunicator`: staging-buffer and
//!   span-descriptor exchange strategies over one contract
//! - Pluggable communication backends (serial, in-process threads, MPI) behind
//!   one `Communicator` trait
//! - Scalar and variable-size per-index payloads through a single
//!   `CommPolicy`/`GatherScatter` code path
//!
//! ## Usage
//! Add `halo-sync` as a dependency in your `Cargo.toml` and enable features as
//! needed:
//!
//! ```toml
//! [dependencies]
//! halo-sync = "0.2"
//! # Optional features:
//! # features = ["mpi-support", "check-invariants"]
//! ```
//!
//! The lifecycle is: finalize an index set, `RemoteIndices::rebuild` it across
//! the peer group, project an [`Interface`](crate::index::interface::Interface)
//! through two attribute predicates, build a communicator on the interface,
//! then call `forward`/`backward` as often as the data changes. All build-time
//! operations and every exchange are collective.

pub mod comm;
pub mod data;
pub mod error;
pub mod exchange;
pub mod index;
pub mod wire;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::comm::{CommTag, Communicator, NoComm, PollWait, ThreadComm, Wait};
    pub use crate::data::block_vec::BlockVec;
    pub use crate::error::HaloSyncError;
    pub use crate::exchange::buffered::BufferedCommunicator;
    pub use crate::exchange::datatype::DatatypeCommunicator;
    pub use crate::exchange::gather::{
        AddGatherScatter, CopyGatherScatter, GatherScatter, MaxGatherScatter, MinGatherScatter,
    };
    pub use crate::exchange::policy::{CommPolicy, SizeFlag, SizeOne, VariableSize};
    pub use crate::index::attribute::{Attribute, AttributeSet, Only, Ownership};
    pub use crate::index::index_set::{GlobalId, LocalIndex, ParallelIndexSet};
    pub use crate::index::interface::{Interface, InterfaceInformation};
    pub use crate::index::remote::{RemoteIndex, RemoteIndices};
}
