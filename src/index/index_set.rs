//! ParallelIndexSet: this rank's ordered `(global id, local index)` map.
//!
//! # Invariants
//!
//! - Global ids are unique within one set.
//! - Local positions are dense: every position in `0..len` appears exactly
//!   once.
//! - After [`finalize`](ParallelIndexSet::finalize), entries are stored and
//!   iterated in ascending global order. That order is what lets two ranks
//!   agree on the meaning of the i-th exchanged slot without ever
//!   transmitting positions.
//!
//! These invariants are validated by `finalize` and re-checked in debug
//! builds and when the `check-invariants` feature is enabled.

use crate::error::HaloSyncError;
use crate::index::attribute::Attribute;

/// Cluster-wide unique identifier of a logical entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GlobalId(u64);

impl GlobalId {
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for GlobalId {
    #[inline]
    fn from(id: u64) -> Self {
        GlobalId(id)
    }
}

/// A position in this rank's containers, together with its attribute and
/// whether peers may learn about it at all.
///
/// Non-public entries are purely process-local: the rebuild neither
/// advertises them to peers nor matches them against peer streams, so no
/// interface can ever select them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LocalIndex<A> {
    local: u32,
    attribute: A,
    public: bool,
}

impl<A: Attribute> LocalIndex<A> {
    /// A public entry at position `local`.
    #[inline]
    pub fn new(local: u32, attribute: A) -> Self {
        Self {
            local,
            attribute,
            public: true,
        }
    }

    /// An entry peers never learn about.
    #[inline]
    pub fn non_public(local: u32, attribute: A) -> Self {
        Self {
            local,
            attribute,
            public: false,
        }
    }

    #[inline]
    pub fn local(&self) -> u32 {
        self.local
    }

    #[inline]
    pub fn attribute(&self) -> A {
        self.attribute
    }

    #[inline]
    pub fn is_public(&self) -> bool {
        self.public
    }
}

/// One `(global, local)` pair of a [`ParallelIndexSet`].
#[derive(Copy, Clone, Debug)]
pub struct IndexEntry<A> {
    pub global: GlobalId,
    pub local: LocalIndex<A>,
}

/// The per-rank slice of a globally indexed structure.
///
/// Build it by [`add`](Self::add)ing entries in any order, then call
/// [`finalize`](Self::finalize) once. Derived structures record
/// [`version`](Self::version) so staleness is detectable.
#[derive(Clone, Debug)]
pub struct ParallelIndexSet<A> {
    entries: Vec<IndexEntry<A>>,
    finalized: bool,
    version: u64,
}

impl<A: Attribute> Default for ParallelIndexSet<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Attribute> ParallelIndexSet<A> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            finalized: false,
            version: 0,
        }
    }

    /// Append an entry.
    ///
    /// # Errors
    /// Returns `Err(AlreadyFinalized)` after `finalize`.
    pub fn add(&mut self, global: GlobalId, local: LocalIndex<A>) -> Result<(), HaloSyncError> {
        if self.finalized {
            return Err(HaloSyncError::AlreadyFinalized);
        }
        self.entries.push(IndexEntry { global, local });
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    /// Sort by global id and validate the set invariants.
    ///
    /// # Errors
    /// `DuplicateGlobalIndex` if two entries share a global id,
    /// `NonDenseLocalIndices` if the positions do not cover `0..len` exactly
    /// once.
    pub fn finalize(&mut self) -> Result<(), HaloSyncError> {
        if self.finalized {
            return Err(HaloSyncError::AlreadyFinalized);
        }
        self.entries.sort_by_key(|e| e.global);
        for pair in self.entries.windows(2) {
            if pair[0].global == pair[1].global {
                return Err(HaloSyncError::DuplicateGlobalIndex(pair[1].global));
            }
        }
        let len = self.entries.len();
        let mut seen = vec![false; len];
        for e in &self.entries {
            let p = e.local.local() as usize;
            if p >= len || seen[p] {
                return Err(HaloSyncError::NonDenseLocalIndices {
                    position: e.local.local(),
                    len,
                });
            }
            seen[p] = true;
        }
        self.finalized = true;
        self.version = self.version.wrapping_add(1);
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        self.debug_assert_invariants();
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Monotonic version that changes on any structural modification.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Iterate entries in ascending global order (finalized sets only).
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry<A>> {
        debug_assert!(self.finalized, "iterating an unfinalized index set");
        self.entries.iter()
    }

    /// Entries in ascending global order, as a slice.
    pub fn as_slice(&self) -> &[IndexEntry<A>] {
        debug_assert!(self.finalized, "reading an unfinalized index set");
        &self.entries
    }

    #[cfg(any(debug_assertions, feature = "check-invariants"))]
    fn debug_assert_invariants(&self) {
        assert!(
            self.entries.windows(2).all(|w| w[0].global < w[1].global),
            "index set entries must be strictly ascending by global id"
        );
    }
}
