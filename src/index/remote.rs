//! RemoteIndices: which of my local indices does each peer also hold?
//!
//! Built collectively, once per topology. Pairwise with every other rank, the
//! rebuild exchanges a sizes frame and then a stream of
//! `(global id, attribute)` records for the public entries of both index
//! sets; the intersections are computed by linear merge against the local
//! sets, which are already sorted by global id.
//!
//! # Invariants
//!
//! - Symmetry: an entry here about peer `q` holding global `g` has a mirror
//!   entry on `q` about this rank holding `g` (both sides advertise and match
//!   public entries only).
//! - Per-peer lists are ascending in global id; peer iteration is ascending
//!   in rank. Both orders are load-bearing: they are what downstream
//!   interfaces and exchange plans rely on to agree across ranks without
//!   transmitting positions.
//! - Immutable once built, until the topology changes and `rebuild` runs
//!   again.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::comm::{CommTag, Communicator, RebuildTags, Wait};
use crate::error::HaloSyncError;
use crate::index::attribute::Attribute;
use crate::index::index_set::{GlobalId, IndexEntry, ParallelIndexSet};
use crate::wire::{self, WireCounts, WireIndexRecord, COUNTS_SIZE, INDEX_RECORD_SIZE};

const REBUILD_TAG_BASE: CommTag = CommTag::new(16);

/// One local index a peer also holds: the local position and attribute, plus
/// the attribute the peer assigns to the same global id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RemoteIndex<A> {
    global: GlobalId,
    local: u32,
    local_attribute: A,
    remote_attribute: A,
}

impl<A: Attribute> RemoteIndex<A> {
    #[inline]
    pub fn global(&self) -> GlobalId {
        self.global
    }

    #[inline]
    pub fn local(&self) -> u32 {
        self.local
    }

    #[inline]
    pub fn local_attribute(&self) -> A {
        self.local_attribute
    }

    #[inline]
    pub fn remote_attribute(&self) -> A {
        self.remote_attribute
    }
}

/// Both views of the correspondence with one peer.
///
/// `send_view` pairs my *source* entries with the peer's *target* entries,
/// `recv_view` the other way around. With one aliased index set (the common
/// symmetric exchange) the two views are equal.
#[derive(Clone, Debug)]
pub struct RemotePeer<A> {
    send_view: Vec<RemoteIndex<A>>,
    recv_view: Vec<RemoteIndex<A>>,
}

impl<A: Attribute> RemotePeer<A> {
    #[inline]
    pub fn send_view(&self) -> &[RemoteIndex<A>] {
        &self.send_view
    }

    #[inline]
    pub fn recv_view(&self) -> &[RemoteIndex<A>] {
        &self.recv_view
    }
}

/// The peer -> shared-indices table of this rank.
#[derive(Clone, Debug)]
pub struct RemoteIndices<A> {
    rank: usize,
    peers: BTreeMap<usize, RemotePeer<A>>,
    source_version: u64,
    target_version: u64,
}

impl<A: Attribute> RemoteIndices<A> {
    /// Collectively derive the peer correspondence of `source`/`target`.
    ///
    /// Pass the same set twice for the usual symmetric exchange. Every rank
    /// of `comm` must call this with consistent inputs; inconsistencies are
    /// detected locally, reduced with MIN across the group, and surfaced as
    /// [`HaloSyncError::TopologyMismatch`] on every rank.
    pub fn rebuild<C: Communicator>(
        source: &ParallelIndexSet<A>,
        target: &ParallelIndexSet<A>,
        comm: &C,
    ) -> Result<Self, HaloSyncError> {
        if !source.is_finalized() || !target.is_finalized() {
            return Err(HaloSyncError::UnfinalizedIndexSet);
        }
        let aliased = std::ptr::eq(source, target);
        let rank = comm.rank();
        let size = comm.size();
        let tags = RebuildTags::from_base(REBUILD_TAG_BASE);

        let src_public: Vec<IndexEntry<A>> = source
            .iter()
            .filter(|e| e.local.is_public())
            .copied()
            .collect();
        let tgt_public: Vec<IndexEntry<A>> = if aliased {
            src_public.clone()
        } else {
            target
                .iter()
                .filter(|e| e.local.is_public())
                .copied()
                .collect()
        };

        let source_stream: Vec<WireIndexRecord> = src_public
            .iter()
            .map(|e| WireIndexRecord::new(e.global.get(), e.local.attribute().to_wire()))
            .collect();
        let target_stream: Vec<WireIndexRecord> = if aliased {
            source_stream.clone()
        } else {
            tgt_public
                .iter()
                .map(|e| WireIndexRecord::new(e.global.get(), e.local.attribute().to_wire()))
                .collect()
        };

        let counts = WireCounts::new(source_stream.len(), target_stream.len());
        let mut payload =
            Vec::with_capacity((source_stream.len() + target_stream.len()) * INDEX_RECORD_SIZE);
        payload.extend_from_slice(wire::cast_slice(&source_stream));
        payload.extend_from_slice(wire::cast_slice(&target_stream));

        let mut ok = true;
        let mut first_err: Option<HaloSyncError> = None;
        let mut note = |err: HaloSyncError, ok: &mut bool| {
            *ok = false;
            if first_err.is_none() {
                first_err = Some(err);
            }
        };

        // Sizes phase: post all receives, then send to everyone.
        let mut scratch = [0u8; COUNTS_SIZE];
        let mut pending_counts: Vec<(usize, C::RecvHandle)> =
            Vec::with_capacity(size.saturating_sub(1));
        for peer in (0..size).filter(|&p| p != rank) {
            let h = comm.irecv(peer, tags.sizes.as_u16(), &mut scratch);
            pending_counts.push((peer, h));
        }
        for peer in (0..size).filter(|&p| p != rank) {
            let _ = comm.isend(peer, tags.sizes.as_u16(), bytemuck::bytes_of(&counts));
        }
        let mut peer_counts: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
        for (peer, h) in pending_counts {
            match h.wait() {
                Some(raw) if raw.len() == COUNTS_SIZE => {
                    let c: WireCounts = wire::read_pod(&raw);
                    peer_counts.insert(peer, (c.source(), c.target()));
                }
                Some(raw) => note(
                    HaloSyncError::TopologyMismatch(format!(
                        "rank {peer}: size frame had {} bytes, expected {COUNTS_SIZE}",
                        raw.len()
                    )),
                    &mut ok,
                ),
                None => note(
                    HaloSyncError::TopologyMismatch(format!("rank {peer}: no size frame received")),
                    &mut ok,
                ),
            }
        }

        // Record phase. Receives are only posted for peers whose sizes
        // arrived; everyone still gets our records so their receives match.
        let mut pending_data: Vec<(usize, C::RecvHandle, usize)> =
            Vec::with_capacity(peer_counts.len());
        for (&peer, &(ns, nt)) in &peer_counts {
            let expect = (ns + nt) * INDEX_RECORD_SIZE;
            let mut buf = vec![0u8; expect];
            let h = comm.irecv(peer, tags.data.as_u16(), &mut buf);
            pending_data.push((peer, h, expect));
        }
        for peer in (0..size).filter(|&p| p != rank) {
            let _ = comm.isend(peer, tags.data.as_u16(), &payload);
        }

        let mut peers = BTreeMap::new();
        for (peer, h, expect) in pending_data {
            let (ns, _) = peer_counts[&peer];
            let raw = match h.wait() {
                Some(raw) => raw,
                None => {
                    note(
                        HaloSyncError::TopologyMismatch(format!(
                            "rank {peer}: no record frame received"
                        )),
                        &mut ok,
                    );
                    continue;
                }
            };
            if raw.len() != expect {
                note(
                    HaloSyncError::TopologyMismatch(format!(
                        "rank {peer}: record frame had {} bytes, expected {expect}",
                        raw.len()
                    )),
                    &mut ok,
                );
                continue;
            }
            let (source_bytes, target_bytes) = raw.split_at(ns * INDEX_RECORD_SIZE);
            let peer_source = match decode_records::<A>(peer, source_bytes) {
                Ok(d) => d,
                Err(e) => {
                    note(e, &mut ok);
                    continue;
                }
            };
            let peer_target = match decode_records::<A>(peer, target_bytes) {
                Ok(d) => d,
                Err(e) => {
                    note(e, &mut ok);
                    continue;
                }
            };

            let send_view = merge_views(&src_public, &peer_target);
            let recv_view = merge_views(&tgt_public, &peer_source);
            if !(send_view.is_empty() && recv_view.is_empty()) {
                peers.insert(
                    peer,
                    RemotePeer {
                        send_view,
                        recv_view,
                    },
                );
            }
        }

        let global = comm.all_reduce_min(if ok { 1 } else { 0 });
        if global != 1 {
            return Err(first_err.unwrap_or_else(|| {
                HaloSyncError::TopologyMismatch(
                    "a peer failed during the collective rebuild".into(),
                )
            }));
        }

        Ok(Self {
            rank,
            peers,
            source_version: source.version(),
            target_version: target.version(),
        })
    }

    /// Rank this table was built on.
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Peers with a non-empty correspondence, ascending in rank.
    pub fn peers(&self) -> impl Iterator<Item = (usize, &RemotePeer<A>)> {
        self.peers.iter().map(|(&r, p)| (r, p))
    }

    #[inline]
    pub fn peer(&self, rank: usize) -> Option<&RemotePeer<A>> {
        self.peers.get(&rank)
    }

    #[inline]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// True while the index sets this table was built from are unchanged.
    pub fn is_current(&self, source: &ParallelIndexSet<A>, target: &ParallelIndexSet<A>) -> bool {
        self.source_version == source.version() && self.target_version == target.version()
    }

    #[cfg(test)]
    pub(crate) fn from_parts(rank: usize, peers: BTreeMap<usize, RemotePeer<A>>) -> Self {
        Self {
            rank,
            peers,
            source_version: 0,
            target_version: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn symmetric_peer(entries: Vec<RemoteIndex<A>>) -> RemotePeer<A> {
        RemotePeer {
            recv_view: entries.clone(),
            send_view: entries,
        }
    }

    #[cfg(test)]
    pub(crate) fn remote_index(global: u64, local: u32, local_attribute: A, remote_attribute: A) -> RemoteIndex<A> {
        RemoteIndex {
            global: GlobalId::new(global),
            local,
            local_attribute,
            remote_attribute,
        }
    }
}

fn decode_records<A: Attribute>(
    peer: usize,
    bytes: &[u8],
) -> Result<Vec<(GlobalId, A)>, HaloSyncError> {
    let mut out = Vec::with_capacity(bytes.len() / INDEX_RECORD_SIZE);
    let mut last: Option<u64> = None;
    for chunk in bytes.chunks_exact(INDEX_RECORD_SIZE) {
        let rec: WireIndexRecord = wire::read_pod(chunk);
        if last.is_some_and(|l| l >= rec.global()) {
            return Err(HaloSyncError::TopologyMismatch(format!(
                "rank {peer}: record stream not strictly ascending at global {}",
                rec.global()
            )));
        }
        last = Some(rec.global());
        let attribute = A::from_wire(rec.attribute()).map_err(|_| {
            HaloSyncError::TopologyMismatch(format!(
                "rank {peer}: invalid attribute code {}",
                rec.attribute()
            ))
        })?;
        out.push((GlobalId::new(rec.global()), attribute));
    }
    Ok(out)
}

/// Linear merge of two global-ascending sequences; emits one entry per
/// common global id.
fn merge_views<A: Attribute>(
    local: &[IndexEntry<A>],
    remote: &[(GlobalId, A)],
) -> Vec<RemoteIndex<A>> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < local.len() && j < remote.len() {
        let (rg, ra) = remote[j];
        match local[i].global.cmp(&rg) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                out.push(RemoteIndex {
                    global: local[i].global,
                    local: local[i].local.local(),
                    local_attribute: local[i].local.attribute(),
                    remote_attribute: ra,
                });
                i += 1;
                j += 1;
            }
        }
    }
    out
}
