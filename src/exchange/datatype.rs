//! DatatypeCommunicator: span-descriptor exchange.
//!
//! Instead of gathering through a policy, this communicator commits, once at
//! build time, a descriptor per peer and direction listing the
//! displacement and length of every exchanged index block inside the
//! container's flat storage. An exchange replays the descriptors: outgoing
//! messages are assembled span by span, incoming ones are written back span
//! by span. That makes every exchange a straight copy of whole index blocks
//! (non-contiguous MPI datatypes in spirit, minus the datatype engine), with
//! the plan shared across unlimited forward/backward rounds.
//!
//! Containers handed to an exchange must have the layout of the
//! representatives given to `build`.

use std::collections::BTreeMap;
use std::mem::size_of;

use crate::comm::{CommTag, Communicator, Wait};
use crate::error::HaloSyncError;
use crate::exchange::policy::CommPolicy;
use crate::index::interface::{Interface, InterfaceInformation};
use crate::wire;

const EXCHANGE_TAG: CommTag = CommTag::new(234);

/// Non-contiguous memory footprint of one message: parallel displacement and
/// length lists, in primitive elements.
#[derive(Clone, Debug, Default)]
struct SpanSet {
    offsets: Vec<usize>,
    lengths: Vec<usize>,
    items: usize,
}

impl SpanSet {
    fn from_list<V: CommPolicy>(data: &V, info: &InterfaceInformation) -> Self {
        let mut offsets = Vec::with_capacity(info.len());
        let mut lengths = Vec::with_capacity(info.len());
        let mut items = 0usize;
        for &p in info.iter() {
            let p = p as usize;
            offsets.push(data.offset(p));
            lengths.push(data.count(p));
            items += data.count(p);
        }
        Self {
            offsets,
            lengths,
            items,
        }
    }

    /// Copy the described spans out of `data`, in descriptor order.
    fn assemble<V: CommPolicy>(&self, data: &V) -> Vec<u8> {
        let item = size_of::<V::Item>();
        let flat = wire::cast_slice(data.flat());
        let mut out = Vec::with_capacity(self.items * item);
        for (&off, &len) in self.offsets.iter().zip(&self.lengths) {
            out.extend_from_slice(&flat[off * item..(off + len) * item]);
        }
        out
    }

    /// Write a received message back through the descriptor. `raw` must hold
    /// exactly `items` elements; the caller validates that.
    fn scatter<V: CommPolicy>(&self, data: &mut V, raw: &[u8]) {
        let item = size_of::<V::Item>();
        let flat = wire::cast_slice_mut(data.flat_mut());
        let mut cursor = 0usize;
        for (&off, &len) in self.offsets.iter().zip(&self.lengths) {
            let bytes = len * item;
            flat[off * item..(off + len) * item].copy_from_slice(&raw[cursor..cursor + bytes]);
            cursor += bytes;
        }
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        assert_eq!(cursor, raw.len(), "descriptor must consume the whole message");
    }
}

struct DatatypePlan {
    /// Descriptors over the source layout, one per peer, for the send lists.
    send: BTreeMap<usize, SpanSet>,
    /// Descriptors over the destination layout, for the receive lists.
    recv: BTreeMap<usize, SpanSet>,
    item_size: usize,
}

/// Exchanges whole index blocks through precomputed span descriptors.
#[derive(Default)]
pub struct DatatypeCommunicator {
    plan: Option<DatatypePlan>,
}

impl DatatypeCommunicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit the descriptors for `interface` against the layout of the two
    /// representatives. Replaces any previous plan.
    pub fn build<V: CommPolicy>(&mut self, source: &V, dest: &V, interface: &Interface) {
        let mut send = BTreeMap::new();
        let mut recv = BTreeMap::new();
        for (rank, pair) in interface.iter() {
            send.insert(rank, SpanSet::from_list(source, &pair.send));
            recv.insert(rank, SpanSet::from_list(dest, &pair.recv));
        }
        self.plan = Some(DatatypePlan {
            send,
            recv,
            item_size: size_of::<V::Item>(),
        });
    }

    /// Copy the send-listed blocks of `source` into the receive-listed
    /// blocks of the peers' `dest` containers. Collective.
    pub fn forward<V, C>(&self, comm: &C, source: &V, dest: &mut V) -> Result<(), HaloSyncError>
    where
        V: CommPolicy,
        C: Communicator,
    {
        let plan = self.plan.as_ref().ok_or(HaloSyncError::PlanMissing)?;
        Self::check_item_size::<V>(plan)?;
        Self::send_recv(comm, plan.item_size, &plan.send, source, &plan.recv, dest)
    }

    /// The reverse direction: receive-listed blocks of `dest` travel back
    /// into the peers' send-listed blocks of `source`. Collective.
    pub fn backward<V, C>(&self, comm: &C, source: &mut V, dest: &V) -> Result<(), HaloSyncError>
    where
        V: CommPolicy,
        C: Communicator,
    {
        let plan = self.plan.as_ref().ok_or(HaloSyncError::PlanMissing)?;
        Self::check_item_size::<V>(plan)?;
        Self::send_recv(comm, plan.item_size, &plan.recv, dest, &plan.send, source)
    }

    /// Release the descriptors.
    pub fn free(&mut self) {
        self.plan = None;
    }

    pub fn is_built(&self) -> bool {
        self.plan.is_some()
    }

    fn check_item_size<V: CommPolicy>(plan: &DatatypePlan) -> Result<(), HaloSyncError> {
        if size_of::<V::Item>() != plan.item_size {
            return Err(HaloSyncError::ItemSizeMismatch {
                expected: plan.item_size,
                got: size_of::<V::Item>(),
            });
        }
        Ok(())
    }

    fn send_recv<V, C>(
        comm: &C,
        item: usize,
        gather_spans: &BTreeMap<usize, SpanSet>,
        gather_data: &V,
        scatter_spans: &BTreeMap<usize, SpanSet>,
        scatter_data: &mut V,
    ) -> Result<(), HaloSyncError>
    where
        V: CommPolicy,
        C: Communicator,
    {
        // Start the receives first, then the sends.
        let mut recvs = Vec::with_capacity(scatter_spans.len());
        for (&rank, span) in scatter_spans.iter() {
            let mut buf = vec![0u8; span.items * item];
            let h = comm.irecv(rank, EXCHANGE_TAG.as_u16(), &mut buf);
            recvs.push((rank, h, span));
        }
        let mut sends = Vec::with_capacity(gather_spans.len());
        for (&rank, span) in gather_spans.iter() {
            let message = span.assemble(gather_data);
            sends.push(comm.isend(rank, EXCHANGE_TAG.as_u16(), &message));
        }

        // Wait for the sends first, then drain the receives.
        for send in sends {
            let _ = send.wait();
        }
        let mut success = true;
        for (_rank, h, span) in recvs {
            match h.wait() {
                Some(raw) if raw.len() == span.items * item => span.scatter(scatter_data, &raw),
                _ => success = false,
            }
        }

        let global = comm.all_reduce_min(if success { 1 } else { 0 });
        if global != 1 {
            return Err(HaloSyncError::CommunicationError);
        }
        Ok(())
    }
}
