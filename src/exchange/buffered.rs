//! BufferedCommunicator: staging-buffer exchange.
//!
//! The plan is two contiguous byte buffers partitioned into per-peer slabs in
//! interface order. Every exchange gathers into the send buffer, posts
//! byte-typed receives and sends with one fixed tag, scatters each peer's
//! slab as its receive completes, waits for the sends, and finally reduces a
//! success flag with MIN over the whole peer group so a failure anywhere
//! surfaces everywhere.
//!
//! Both endpoints iterate their interfaces in ascending-rank order over
//! global-ascending lists, so the k-th value gathered for a peer is the k-th
//! value that peer scatters; no index metadata travels with the payload.

use std::collections::BTreeMap;
use std::mem::size_of;
use std::sync::Arc;

use crate::comm::{CommTag, Communicator, PollWait, Wait};
use crate::error::HaloSyncError;
use crate::exchange::gather::GatherScatter;
use crate::exchange::policy::{CommPolicy, SizeOne};
use crate::index::interface::{Interface, InterfaceInformation, InterfacePair};
use crate::wire;

const EXCHANGE_TAG: CommTag = CommTag::new(233);

/// Start and length, in bytes, of one peer's slab in a staging buffer.
#[derive(Copy, Clone, Debug, Default)]
struct MessageInformation {
    start: usize,
    bytes: usize,
}

struct BufferedPlan {
    interface: Arc<Interface>,
    /// Per peer: (send slab, recv slab), accumulated in interface order.
    messages: BTreeMap<usize, (MessageInformation, MessageInformation)>,
    send_buf: Vec<u8>,
    recv_buf: Vec<u8>,
    item_size: usize,
}

#[derive(Copy, Clone, Debug)]
enum Direction {
    Forward,
    Backward,
}

impl Direction {
    /// The list gathered from (and the slab sent) in this direction.
    fn gather_list(self, pair: &InterfacePair) -> &InterfaceInformation {
        match self {
            Direction::Forward => &pair.send,
            Direction::Backward => &pair.recv,
        }
    }

    fn scatter_list(self, pair: &InterfacePair) -> &InterfaceInformation {
        match self {
            Direction::Forward => &pair.recv,
            Direction::Backward => &pair.send,
        }
    }

    fn gather_info(self, info: &(MessageInformation, MessageInformation)) -> MessageInformation {
        match self {
            Direction::Forward => info.0,
            Direction::Backward => info.1,
        }
    }

    fn scatter_info(self, info: &(MessageInformation, MessageInformation)) -> MessageInformation {
        match self {
            Direction::Forward => info.1,
            Direction::Backward => info.0,
        }
    }
}

/// Source/destination of one exchange; `Aliased` is the same-container
/// variant.
enum ExchangeIo<'a, V> {
    Pair { gather: &'a V, scatter: &'a mut V },
    Aliased(&'a mut V),
}

impl<V> ExchangeIo<'_, V> {
    fn gather_side(&self) -> &V {
        match self {
            ExchangeIo::Pair { gather, .. } => gather,
            ExchangeIo::Aliased(data) => data,
        }
    }

    fn scatter_side(&mut self) -> &mut V {
        match self {
            ExchangeIo::Pair { scatter, .. } => scatter,
            ExchangeIo::Aliased(data) => data,
        }
    }
}

/// Gathers values into contiguous buffers and exchanges those.
///
/// Build once per interface, exchange any number of times, `free` (or drop)
/// when the interface is rebuilt.
#[derive(Default)]
pub struct BufferedCommunicator {
    plan: Option<BufferedPlan>,
}

impl BufferedCommunicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the plan for containers with one element per index. Replaces
    /// any previous plan.
    pub fn build<V>(&mut self, interface: Arc<Interface>)
    where
        V: CommPolicy<Flag = SizeOne>,
    {
        let item = size_of::<V::Item>();
        let mut messages = BTreeMap::new();
        let (mut send_total, mut recv_total) = (0usize, 0usize);
        for (rank, pair) in interface.iter() {
            let send_items = pair.send.len();
            let recv_items = pair.recv.len();
            messages.insert(
                rank,
                (
                    MessageInformation {
                        start: send_total * item,
                        bytes: send_items * item,
                    },
                    MessageInformation {
                        start: recv_total * item,
                        bytes: recv_items * item,
                    },
                ),
            );
            send_total += send_items;
            recv_total += recv_items;
        }
        self.plan = Some(BufferedPlan {
            interface,
            messages,
            send_buf: vec![0u8; send_total * item],
            recv_buf: vec![0u8; recv_total * item],
            item_size: item,
        });
    }

    /// Build the plan using representative containers to size the slabs.
    ///
    /// Required for `VariableSize` containers; `source` sizes the send side,
    /// `dest` the receive side. Every container later passed to an exchange
    /// must have the same layout as the representatives.
    pub fn build_with<V: CommPolicy>(&mut self, source: &V, dest: &V, interface: Arc<Interface>) {
        let item = size_of::<V::Item>();
        let mut messages = BTreeMap::new();
        let (mut send_total, mut recv_total) = (0usize, 0usize);
        for (rank, pair) in interface.iter() {
            let send_items: usize = pair.send.iter().map(|&p| source.count(p as usize)).sum();
            let recv_items: usize = pair.recv.iter().map(|&p| dest.count(p as usize)).sum();
            messages.insert(
                rank,
                (
                    MessageInformation {
                        start: send_total * item,
                        bytes: send_items * item,
                    },
                    MessageInformation {
                        start: recv_total * item,
                        bytes: recv_items * item,
                    },
                ),
            );
            send_total += send_items;
            recv_total += recv_items;
        }
        self.plan = Some(BufferedPlan {
            interface,
            messages,
            send_buf: vec![0u8; send_total * item],
            recv_buf: vec![0u8; recv_total * item],
            item_size: item,
        });
    }

    /// Send the interface's send lists from `source`, combine what arrives
    /// into `dest`'s receive lists. Collective.
    pub fn forward<G, V, C>(
        &mut self,
        comm: &C,
        source: &V,
        dest: &mut V,
    ) -> Result<(), HaloSyncError>
    where
        G: GatherScatter<V>,
        V: CommPolicy,
        C: Communicator,
    {
        self.exchange::<G, V, C>(
            comm,
            ExchangeIo::Pair {
                gather: source,
                scatter: dest,
            },
            Direction::Forward,
        )
    }

    /// The reverse direction: send the receive lists from `dest`, combine
    /// into `source`'s send lists. Collective.
    pub fn backward<G, V, C>(
        &mut self,
        comm: &C,
        source: &mut V,
        dest: &V,
    ) -> Result<(), HaloSyncError>
    where
        G: GatherScatter<V>,
        V: CommPolicy,
        C: Communicator,
    {
        self.exchange::<G, V, C>(
            comm,
            ExchangeIo::Pair {
                gather: dest,
                scatter: source,
            },
            Direction::Backward,
        )
    }

    /// Forward exchange where source and destination are the same container.
    ///
    /// The caller must ensure the send and receive index sets are disjoint,
    /// or that overwriting freshly received values on gather-after-scatter
    /// positions is intended under the chosen policy. (Gather completes
    /// before any scatter runs, so received values never leak into the
    /// outgoing message of the same exchange.)
    pub fn forward_inplace<G, V, C>(&mut self, comm: &C, data: &mut V) -> Result<(), HaloSyncError>
    where
        G: GatherScatter<V>,
        V: CommPolicy,
        C: Communicator,
    {
        self.exchange::<G, V, C>(comm, ExchangeIo::Aliased(data), Direction::Forward)
    }

    /// Backward exchange where source and destination are the same container.
    /// Same aliasing contract as [`forward_inplace`](Self::forward_inplace).
    pub fn backward_inplace<G, V, C>(&mut self, comm: &C, data: &mut V) -> Result<(), HaloSyncError>
    where
        G: GatherScatter<V>,
        V: CommPolicy,
        C: Communicator,
    {
        self.exchange::<G, V, C>(comm, ExchangeIo::Aliased(data), Direction::Backward)
    }

    /// Release the plan (buffers and slab table).
    pub fn free(&mut self) {
        self.plan = None;
    }

    pub fn is_built(&self) -> bool {
        self.plan.is_some()
    }

    fn exchange<G, V, C>(
        &mut self,
        comm: &C,
        mut io: ExchangeIo<'_, V>,
        dir: Direction,
    ) -> Result<(), HaloSyncError>
    where
        G: GatherScatter<V>,
        V: CommPolicy,
        C: Communicator,
    {
        let plan = self.plan.as_mut().ok_or(HaloSyncError::PlanMissing)?;
        if size_of::<V::Item>() != plan.item_size {
            return Err(HaloSyncError::ItemSizeMismatch {
                expected: plan.item_size,
                got: size_of::<V::Item>(),
            });
        }
        let item = plan.item_size;
        let BufferedPlan {
            interface,
            messages,
            send_buf,
            recv_buf,
            ..
        } = plan;
        let (gather_buf, scatter_buf) = match dir {
            Direction::Forward => (&mut *send_buf, &mut *recv_buf),
            Direction::Backward => (&mut *recv_buf, &mut *send_buf),
        };

        // Gather. Interface order matches the slab layout recorded at build.
        {
            let source = io.gather_side();
            let mut cursor = 0usize;
            for (_rank, pair) in interface.iter() {
                #[cfg(any(debug_assertions, feature = "check-invariants"))]
                assert_eq!(
                    cursor,
                    dir.gather_info(&messages[&_rank]).start,
                    "gather cursor out of step with the slab table"
                );
                for &p in dir.gather_list(pair).iter() {
                    let p = p as usize;
                    for sub in 0..source.count(p) {
                        let value = G::gather(source, p, sub);
                        wire::write_pod(&mut gather_buf[cursor..cursor + item], &value);
                        cursor += item;
                    }
                }
            }
            #[cfg(any(debug_assertions, feature = "check-invariants"))]
            assert_eq!(
                cursor,
                gather_buf.len(),
                "gathered element counts disagree with the built plan"
            );
        }

        // Post receives first, then sends.
        let mut pending: Vec<Option<(usize, C::RecvHandle, MessageInformation)>> =
            Vec::with_capacity(messages.len());
        for (&rank, info) in messages.iter() {
            let ri = dir.scatter_info(info);
            let h = comm.irecv(
                rank,
                EXCHANGE_TAG.as_u16(),
                &mut scatter_buf[ri.start..ri.start + ri.bytes],
            );
            pending.push(Some((rank, h, ri)));
        }
        let mut sends = Vec::with_capacity(messages.len());
        for (&rank, info) in messages.iter() {
            let si = dir.gather_info(info);
            sends.push(comm.isend(
                rank,
                EXCHANGE_TAG.as_u16(),
                &gather_buf[si.start..si.start + si.bytes],
            ));
        }

        // Scatter each peer's slab as soon as its receive completes;
        // cross-peer completion order is deliberately unconstrained.
        let mut success = true;
        let mut remaining = pending.len();
        while remaining > 0 {
            let mut progressed = false;
            for slot in pending.iter_mut() {
                let ready = match slot {
                    Some((_, handle, _)) => handle.try_wait(),
                    None => None,
                };
                let Some(raw) = ready else { continue };
                let (rank, _handle, ri) = slot.take().expect("slot was checked non-empty");
                remaining -= 1;
                progressed = true;
                if raw.len() != ri.bytes {
                    success = false;
                    continue;
                }
                scatter_buf[ri.start..ri.start + ri.bytes].copy_from_slice(&raw);
                let Some(pair) = interface.peer(rank) else {
                    debug_assert!(false, "slab table peer missing from interface");
                    success = false;
                    continue;
                };
                let dest = io.scatter_side();
                let mut cursor = ri.start;
                for &p in dir.scatter_list(pair).iter() {
                    let p = p as usize;
                    for sub in 0..dest.count(p) {
                        let value = wire::read_pod::<V::Item>(&scatter_buf[cursor..cursor + item]);
                        G::scatter(dest, value, p, sub);
                        cursor += item;
                    }
                }
                #[cfg(any(debug_assertions, feature = "check-invariants"))]
                assert_eq!(
                    cursor,
                    ri.start + ri.bytes,
                    "scatter must consume exactly its slab"
                );
            }
            if remaining > 0 && !progressed {
                std::thread::yield_now();
            }
        }

        for send in sends {
            let _ = send.wait();
        }

        let global = comm.all_reduce_min(if success { 1 } else { 0 });
        if global != 1 {
            return Err(HaloSyncError::CommunicationError);
        }
        Ok(())
    }
}
