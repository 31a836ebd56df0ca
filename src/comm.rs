//! Communication abstraction for intra-process (threaded) and inter-process
//! (MPI) message passing.
//!
//! Wire format conventions (for the protocols layered on top):
//! - All integers are LE fixed width (u32 counts/attribute codes, u64 ids).
//! - Payload records are #[repr(C)] and bytemuck::Pod-safe.
//! - Receivers may truncate to their provided buffer length; protocols must
//!   exchange sizes first if exact lengths are required.

use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking completion test.
pub trait PollWait {
    /// Return `Some(bytes)` if the operation has completed, otherwise `None`.
    fn try_wait(&mut self) -> Option<Vec<u8>>;
}

/// Non-blocking communication interface (minimal by design).
///
/// Implementors provide asynchronous send/receive operations, waitable
/// handles, and the one collective the exchange protocols need: a MIN
/// reduction of a small integer, used to surface per-rank failures on every
/// rank of a collective call.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait + Send;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait + PollWait + Send;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Rank of this process (0..size-1)
    fn rank(&self) -> usize;
    /// Total number of ranks
    fn size(&self) -> usize;

    /// MIN reduction of `value` over the whole peer group; every rank gets
    /// the result. Collective.
    fn all_reduce_min(&self, value: i32) -> i32;

    /// Synchronization barrier (default: no-op for serial comms)
    fn barrier(&self) {}

    /// Returns true if this communicator is NoComm (for test logic)
    fn is_no_comm(&self) -> bool {
        false
    }
}

/// Tag newtype for safer tag arithmetic.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommTag(u16);

impl CommTag {
    /// Create a new tag from a raw `u16`.
    #[inline]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    /// Return the underlying `u16` value.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Safely offset the tag by `dx`, wrapping on overflow.
    #[inline]
    pub const fn offset(self, dx: u16) -> Self {
        Self(self.0.wrapping_add(dx))
    }
}

impl From<u16> for CommTag {
    #[inline]
    fn from(x: u16) -> Self {
        CommTag::new(x)
    }
}

/// Convenience bundle of tags for the two-phase remote-index rebuild.
#[derive(Copy, Clone, Debug)]
pub struct RebuildTags {
    /// Tag used during the size-exchange phase.
    pub sizes: CommTag,
    /// Tag used during the record-exchange phase.
    pub data: CommTag,
}

impl RebuildTags {
    /// Construct tags from a base, assigning deterministic offsets per phase.
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            sizes: base,
            data: base.offset(1),
        }
    }
}

/// Tag reserved by [`ThreadComm`] for the internal MIN reduction.
const REDUCE_TAG: u16 = 0xFFF4;

/// Compile-time no-op comm for pure serial unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl PollWait for () {
    fn try_wait(&mut self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}

    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_min(&self, value: i32) -> i32 {
        value
    }

    fn is_no_comm(&self) -> bool {
        true
    }
}

// --- ThreadComm: intra-process / multi-thread ---

// Keys carry a universe id so independently created rank groups (e.g. tests
// running in parallel with fixed protocol tags) cannot observe each other's
// messages.
type Key = (u64, usize, usize, u16); // (universe, src, dst, tag)

#[derive(Default)]
struct Slot {
    q: VecDeque<Vec<u8>>,
}

struct Mailbox {
    map: Mutex<HashMap<Key, Arc<(Mutex<Slot>, Condvar)>>>,
}

static MAILBOX: Lazy<Mailbox> = Lazy::new(|| Mailbox {
    map: Mutex::new(HashMap::new()),
});

static NEXT_UNIVERSE: AtomicU64 = AtomicU64::new(1);

fn mailbox_entry(key: Key) -> Arc<(Mutex<Slot>, Condvar)> {
    let mut g = MAILBOX.map.lock().expect("MAILBOX poisoned");
    g.entry(key)
        .or_insert_with(|| Arc::new((Mutex::new(Slot::default()), Condvar::new())))
        .clone()
}

pub struct LocalSendHandle;

impl Wait for LocalSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl PollWait for LocalSendHandle {
    fn try_wait(&mut self) -> Option<Vec<u8>> {
        None
    }
}

pub struct LocalRecvHandle {
    cell: Arc<(Mutex<Slot>, Condvar)>,
    want_len: usize,
}

impl Wait for LocalRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let (lock, cv) = &*self.cell;
        let mut slot = lock.lock().expect("Slot poisoned");
        while slot.q.is_empty() {
            slot = cv.wait(slot).expect("Condvar poisoned");
        }
        let mut msg = slot.q.pop_front().expect("q non-empty");
        msg.truncate(self.want_len.min(msg.len()));
        Some(msg)
    }
}

impl PollWait for LocalRecvHandle {
    fn try_wait(&mut self) -> Option<Vec<u8>> {
        let (lock, _cv) = &*self.cell;
        let mut slot = lock.lock().expect("Slot poisoned");
        if slot.q.is_empty() {
            None
        } else {
            let mut msg = slot.q.pop_front().expect("q non-empty");
            msg.truncate(self.want_len.min(msg.len()));
            Some(msg)
        }
    }
}

/// One rank of an in-process peer group; ranks communicate through a shared
/// mailbox, one std thread per rank.
#[derive(Clone, Debug)]
pub struct ThreadComm {
    universe: u64,
    rank: usize,
    size: usize,
}

impl ThreadComm {
    /// Create a fresh peer group of `size` ranks. The returned communicators
    /// share a private message space; hand one to each rank thread.
    pub fn universe(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "a peer group needs at least one rank");
        let universe = NEXT_UNIVERSE.fetch_add(1, Ordering::Relaxed);
        (0..size)
            .map(|rank| ThreadComm {
                universe,
                rank,
                size,
            })
            .collect()
    }
}

impl Communicator for ThreadComm {
    type SendHandle = LocalSendHandle;
    type RecvHandle = LocalRecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.universe, self.rank, peer, tag);
        let entry = mailbox_entry(key);
        let (lock, cv) = &*entry;
        {
            let mut slot = lock.lock().expect("Slot poisoned");
            slot.q.push_back(buf.to_vec());
        }
        cv.notify_all();
        LocalSendHandle
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        let key = (self.universe, peer, self.rank, tag);
        LocalRecvHandle {
            cell: mailbox_entry(key),
            want_len: buf.len(),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    // Gather to rank 0, reduce, broadcast back. FIFO slot order keeps
    // successive reductions on the same group from interleaving.
    fn all_reduce_min(&self, value: i32) -> i32 {
        if self.size <= 1 {
            return value;
        }
        if self.rank == 0 {
            let mut acc = value;
            for peer in 1..self.size {
                let mut buf = [0u8; 4];
                let h = self.irecv(peer, REDUCE_TAG, &mut buf);
                let raw = h.wait().expect("reduction recv cannot fail");
                let frame: [u8; 4] = raw.try_into().expect("reduction frame is 4 bytes");
                acc = acc.min(i32::from_le_bytes(frame));
            }
            for peer in 1..self.size {
                let _ = self.isend(peer, REDUCE_TAG, &acc.to_le_bytes());
            }
            acc
        } else {
            let _ = self.isend(0, REDUCE_TAG, &value.to_le_bytes());
            let mut buf = [0u8; 4];
            let h = self.irecv(0, REDUCE_TAG, &mut buf);
            let raw = h.wait().expect("reduction recv cannot fail");
            let frame: [u8; 4] = raw.try_into().expect("reduction frame is 4 bytes");
            i32::from_le_bytes(frame)
        }
    }

    fn barrier(&self) {
        let _ = self.all_reduce_min(0);
    }
}

// --- MPI backend ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use core::ptr::NonNull;
    use mpi::collective::{CommunicatorCollectives, SystemOperation};
    use mpi::environment::Universe;
    use mpi::point_to_point::{Destination, Source};
    use mpi::topology::{Communicator as _, SimpleCommunicator};

    pub struct MpiComm {
        _universe: Universe,
        pub world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl Default for MpiComm {
        fn default() -> Self {
            let uni = mpi::initialize().expect("MPI initialization failed");
            let world = uni.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                _universe: uni,
                world,
                rank,
                size,
            }
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
            use mpi::request::StaticScope;
            let boxed = buf.to_vec().into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice: &[u8] = unsafe { &*raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, slice, tag as i32);
            MpiSendHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
            }
        }

        fn irecv(&self, peer: usize, tag: u16, template: &mut [u8]) -> Self::RecvHandle {
            use mpi::request::StaticScope;
            let len = template.len();
            let boxed = vec![0u8; len].into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice_mut: &mut [u8] = unsafe { &mut *raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, slice_mut, tag as i32);
            MpiRecvHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
                len,
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }

        fn all_reduce_min(&self, value: i32) -> i32 {
            let mut out = 0i32;
            self.world
                .all_reduce_into(&value, &mut out, SystemOperation::min());
            out
        }

        fn barrier(&self) {
            self.world.barrier();
        }
    }

    pub struct MpiSendHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<NonNull<[u8]>>,
    }

    unsafe impl Send for MpiSendHandle {}

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
            None
        }
    }

    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            if let Some(r) = self.req.take() {
                let _ = r.test();
                #[cfg(debug_assertions)]
                eprintln!("[MpiSendHandle::drop] send not explicitly waited");
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
        }
    }

    pub struct MpiRecvHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<NonNull<[u8]>>,
        len: usize,
    }

    unsafe impl Send for MpiRecvHandle {}

    impl MpiRecvHandle {
        fn take_buffer(&mut self) -> Option<Vec<u8>> {
            let ptr = self.buf.take()?;
            let boxed: Box<[u8]> = unsafe { Box::from_raw(ptr.as_ptr()) };
            let mut v = Vec::from(boxed);
            v.truncate(self.len);
            Some(v)
        }
    }

    impl Wait for MpiRecvHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            self.take_buffer()
        }
    }

    impl PollWait for MpiRecvHandle {
        fn try_wait(&mut self) -> Option<Vec<u8>> {
            let req = self.req.take()?;
            match req.test() {
                Ok(_status) => self.take_buffer(),
                Err(req) => {
                    self.req = Some(req);
                    None
                }
            }
        }
    }

    impl Drop for MpiRecvHandle {
        fn drop(&mut self) {
            if let Some(r) = self.req.take() {
                let _ = r.test();
                #[cfg(debug_assertions)]
                eprintln!("[MpiRecvHandle::drop] recv not explicitly waited");
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_round_trip() {
        let comms = ThreadComm::universe(2);
        let msg = b"hello";
        let _s = comms[0].isend(1, 0x10, msg);

        let mut buf = [0u8; 5];
        let h = comms[1].irecv(0, 0x10, &mut buf);
        let got = h.wait().unwrap();
        assert_eq!(&got, msg);
    }

    #[test]
    fn thread_fifo_order() {
        let comms = ThreadComm::universe(2);
        for i in 0..10u8 {
            let _ = comms[0].isend(1, 0x11, &[i]);
        }
        let mut out = Vec::new();
        for _ in 0..10 {
            let mut b = [0u8; 1];
            let h = comms[1].irecv(0, 0x11, &mut b);
            out.push(h.wait().unwrap()[0]);
        }
        assert_eq!(out, (0u8..10u8).collect::<Vec<_>>());
    }

    #[test]
    fn universes_are_isolated() {
        let a = ThreadComm::universe(2);
        let b = ThreadComm::universe(2);
        let _ = a[0].isend(1, 0x12, &[0xAA]);
        let _ = b[0].isend(1, 0x12, &[0xBB]);
        let mut buf = [0u8; 1];
        let h = b[1].irecv(0, 0x12, &mut buf);
        assert_eq!(h.wait().unwrap(), vec![0xBB]);
    }

    #[test]
    fn min_reduction_across_ranks() {
        let comms = ThreadComm::universe(3);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| std::thread::spawn(move || c.all_reduce_min(5 - c.rank() as i32)))
            .collect();
        let results: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // values are 5, 4, 3 -> everyone sees 3
        assert!(results.iter().all(|&v| v == 3));
    }

    #[test]
    fn no_comm_is_identity() {
        let c = NoComm;
        assert_eq!(c.all_reduce_min(-7), -7);
        assert!(c.is_no_comm());
        assert_eq!(c.size(), 1);
    }
}
