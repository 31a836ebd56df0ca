//! Attributes: the role a local index plays, and predicates over roles.
//!
//! Every index-set entry carries a small enumerated attribute (owner, ghost,
//! overlap, ...). Interfaces are carved out of the remote-index bookkeeping by
//! two attribute predicates; see [`crate::index::interface`].

use crate::error::HaloSyncError;

/// A domain-defined index attribute.
///
/// Implementors supply a stable `u32` encoding so attributes can travel in
/// rebuild records. Decoding is fallible: a peer running incompatible code
/// must be detected, not misread.
pub trait Attribute: Copy + Eq + Ord + std::fmt::Debug + Send + Sync + 'static {
    /// Encode for the wire.
    fn to_wire(self) -> u32;
    /// Decode from the wire.
    fn from_wire(code: u32) -> Result<Self, HaloSyncError>;
}

/// A set of attributes, used to filter remote-index entries.
///
/// Closures `Fn(A) -> bool` implement this directly; [`Only`] covers the
/// single-attribute case.
pub trait AttributeSet<A> {
    fn contains(&self, attribute: A) -> bool;
}

impl<A, F: Fn(A) -> bool> AttributeSet<A> for F {
    #[inline]
    fn contains(&self, attribute: A) -> bool {
        self(attribute)
    }
}

/// The attribute set holding exactly one attribute.
#[derive(Copy, Clone, Debug)]
pub struct Only<A>(pub A);

impl<A: PartialEq + Copy> AttributeSet<A> for Only<A> {
    #[inline]
    fn contains(&self, attribute: A) -> bool {
        self.0 == attribute
    }
}

/// The standard ownership attribute for partitioned data: a position is either
/// owned here, a ghost copy of a peer's owned position, or part of a genuine
/// overlap region.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Ownership {
    Owner,
    Ghost,
    Overlap,
}

const ATTR_OWNER: u32 = 1;
const ATTR_GHOST: u32 = 2;
const ATTR_OVERLAP: u32 = 3;

impl Attribute for Ownership {
    #[inline]
    fn to_wire(self) -> u32 {
        match self {
            Ownership::Owner => ATTR_OWNER,
            Ownership::Ghost => ATTR_GHOST,
            Ownership::Overlap => ATTR_OVERLAP,
        }
    }

    #[inline]
    fn from_wire(code: u32) -> Result<Self, HaloSyncError> {
        match code {
            ATTR_OWNER => Ok(Ownership::Owner),
            ATTR_GHOST => Ok(Ownership::Ghost),
            ATTR_OVERLAP => Ok(Ownership::Overlap),
            other => Err(HaloSyncError::InvalidAttribute(other)),
        }
    }
}
