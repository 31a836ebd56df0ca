//! Shared helpers for the multi-rank integration tests: one std thread per
//! rank over a private `ThreadComm` universe.
#![allow(dead_code)] // not every test crate uses every helper

use halo_sync::prelude::*;

/// Spawn `size` rank threads, run `f` on each with its communicator, and
/// return the per-rank results in rank order.
pub fn run_ranks<R>(
    size: usize,
    f: impl Fn(ThreadComm) -> R + Clone + Send + 'static,
) -> Vec<R>
where
    R: Send + 'static,
{
    let comms = ThreadComm::universe(size);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            let f = f.clone();
            std::thread::spawn(move || f(comm))
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect()
}

/// Build and finalize an index set from `(global, position, attribute)`
/// triples.
pub fn index_set(entries: &[(u64, u32, Ownership)]) -> ParallelIndexSet<Ownership> {
    let mut set = ParallelIndexSet::new();
    for &(global, position, attribute) in entries {
        set.add(GlobalId::new(global), LocalIndex::new(position, attribute))
            .expect("set not finalized yet");
    }
    set.finalize().expect("valid test index set");
    set
}

/// The global id stored at `position`.
pub fn global_at(set: &ParallelIndexSet<Ownership>, position: u32) -> u64 {
    set.iter()
        .find(|e| e.local.local() == position)
        .expect("position present")
        .global
        .get()
}
