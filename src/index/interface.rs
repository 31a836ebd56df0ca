//! Interface: the attribute-filtered communication plan.
//!
//! Projecting [`RemoteIndices`] through a *source* and a *destination*
//! attribute set yields, per peer, the ordered local positions to send and to
//! receive. Both endpoints project the same global-ascending universe with
//! the same predicates, so the k-th slot of a message means the same index on
//! both sides; no positions are ever transmitted.
//!
//! An interface with zero peers is valid and describes a no-op exchange.

use std::collections::BTreeMap;

use crate::index::attribute::{Attribute, AttributeSet};
use crate::index::remote::RemoteIndices;

/// Ordered list of local positions taking part in one direction of the
/// exchange with one peer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterfaceInformation(Vec<u32>);

impl InterfaceInformation {
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &u32> {
        self.0.iter()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn from_positions(positions: Vec<u32>) -> Self {
        Self(positions)
    }
}

/// The send and receive lists for one peer.
#[derive(Clone, Debug, Default)]
pub struct InterfacePair {
    pub send: InterfaceInformation,
    pub recv: InterfaceInformation,
}

/// The full plan: peer -> send/receive lists, ascending in rank.
#[derive(Clone, Debug, Default)]
pub struct Interface {
    peers: BTreeMap<usize, InterfacePair>,
}

impl Interface {
    /// Project `remote` through the two attribute sets.
    ///
    /// A sender-view entry `(p, a_local, a_remote)` contributes `p` to the
    /// send list when `a_local ∈ source_set` and `a_remote ∈ dest_set`; a
    /// receiver-view entry contributes to the receive list when
    /// `a_local ∈ dest_set` and `a_remote ∈ source_set`. Peers with both
    /// projections empty are omitted.
    pub fn build<A, S, D>(remote: &RemoteIndices<A>, source_set: S, dest_set: D) -> Self
    where
        A: Attribute,
        S: AttributeSet<A>,
        D: AttributeSet<A>,
    {
        let mut peers = BTreeMap::new();
        for (rank, rp) in remote.peers() {
            let mut send = Vec::new();
            let mut recv = Vec::new();
            for e in rp.send_view() {
                if source_set.contains(e.local_attribute()) && dest_set.contains(e.remote_attribute())
                {
                    send.push(e.local());
                }
            }
            for e in rp.recv_view() {
                if dest_set.contains(e.local_attribute()) && source_set.contains(e.remote_attribute())
                {
                    recv.push(e.local());
                }
            }
            if !send.is_empty() || !recv.is_empty() {
                peers.insert(
                    rank,
                    InterfacePair {
                        send: InterfaceInformation(send),
                        recv: InterfaceInformation(recv),
                    },
                );
            }
        }
        Self { peers }
    }

    /// Peers of the plan, ascending in rank. This iteration order *is* the
    /// slab layout of the buffered plans; it must match on all ranks.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &InterfacePair)> {
        self.peers.iter().map(|(&r, p)| (r, p))
    }

    #[inline]
    pub fn peer(&self, rank: usize) -> Option<&InterfacePair> {
        self.peers.get(&rank)
    }

    #[inline]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
