//! Multi-rank exchanges through the buffered communicator.

mod common;

use common::{index_set, run_ranks};
use halo_sync::prelude::*;
use std::sync::Arc;

/// Two ranks over globals {0,1,2,3}: rank 0 owns 0,1 and ghosts 2; rank 1
/// owns 2,3 and ghosts 1.
fn owner_ghost_set(rank: usize) -> ParallelIndexSet<Ownership> {
    match rank {
        0 => index_set(&[
            (0, 0, Ownership::Owner),
            (1, 1, Ownership::Owner),
            (2, 2, Ownership::Ghost),
        ]),
        _ => index_set(&[
            (1, 0, Ownership::Ghost),
            (2, 1, Ownership::Owner),
            (3, 2, Ownership::Owner),
        ]),
    }
}

/// Owned slots get a value derived from rank and global id, ghosts -1.
fn fill(set: &ParallelIndexSet<Ownership>, rank: usize) -> Vec<i64> {
    let mut v = vec![-1i64; set.len()];
    for e in set.iter() {
        if e.local.attribute() == Ownership::Owner {
            v[e.local.local() as usize] = (e.global.get() as i64 + 1) * 100 + rank as i64;
        }
    }
    v
}

fn owner_to_ghost(set: &ParallelIndexSet<Ownership>, comm: &ThreadComm) -> BufferedCommunicator {
    let remote = RemoteIndices::rebuild(set, set, comm).expect("consistent rebuild");
    let iface = Arc::new(Interface::build(
        &remote,
        Only(Ownership::Owner),
        Only(Ownership::Ghost),
    ));
    let mut bc = BufferedCommunicator::new();
    bc.build::<Vec<i64>>(iface);
    bc
}

#[test]
fn owner_values_reach_ghosts() {
    let results = run_ranks(2, |comm| {
        let rank = comm.rank();
        let set = owner_ghost_set(rank);
        let mut bc = owner_to_ghost(&set, &comm);
        let src = fill(&set, rank);
        let mut dst = src.clone();
        bc.forward::<CopyGatherScatter, _, _>(&comm, &src, &mut dst)
            .unwrap();
        dst
    });
    // Owned slots untouched, ghost slots hold the owner's value.
    assert_eq!(results[0], vec![100, 200, 301]);
    assert_eq!(results[1], vec![200, 301, 401]);
}

#[test]
fn same_container_variant_matches_pair_variant() {
    let results = run_ranks(2, |comm| {
        let rank = comm.rank();
        let set = owner_ghost_set(rank);
        let mut bc = owner_to_ghost(&set, &comm);
        let mut data = fill(&set, rank);
        bc.forward_inplace::<CopyGatherScatter, _, _>(&comm, &mut data)
            .unwrap();
        data
    });
    assert_eq!(results[0], vec![100, 200, 301]);
    assert_eq!(results[1], vec![200, 301, 401]);
}

#[test]
fn forward_then_backward_restores_the_source() {
    let results = run_ranks(2, |comm| {
        let rank = comm.rank();
        let set = owner_ghost_set(rank);
        let mut bc = owner_to_ghost(&set, &comm);
        let original = fill(&set, rank);
        let mut src = original.clone();
        let mut dst = vec![0i64; set.len()];
        bc.forward::<CopyGatherScatter, _, _>(&comm, &src, &mut dst)
            .unwrap();
        bc.backward::<CopyGatherScatter, _, _>(&comm, &mut src, &dst)
            .unwrap();
        (original, src, dst)
    });
    for (original, src, dst) in results {
        // The backward leg writes back exactly what the forward leg took out.
        assert_eq!(src, original);
        // Positions outside the receive lists stay at their initial value.
        assert!(dst.iter().filter(|&&v| v == 0).count() >= 2);
    }
}

#[test]
fn repeated_forward_is_idempotent() {
    let results = run_ranks(2, |comm| {
        let rank = comm.rank();
        let set = owner_ghost_set(rank);
        let mut bc = owner_to_ghost(&set, &comm);
        let src = fill(&set, rank);
        let mut first = src.clone();
        bc.forward::<CopyGatherScatter, _, _>(&comm, &src, &mut first)
            .unwrap();
        let mut second = first.clone();
        bc.forward::<CopyGatherScatter, _, _>(&comm, &src, &mut second)
            .unwrap();
        (first, second)
    });
    for (first, second) in results {
        assert_eq!(first, second);
    }
}

/// Three ranks in a ring: rank r owns globals 4r..4r+4 and mirrors the first
/// owned global of each neighbour as overlap.
fn ring_set(rank: usize) -> ParallelIndexSet<Ownership> {
    let mut entries = Vec::new();
    let mut globals: Vec<(u64, Ownership)> = (0..4)
        .map(|k| (4 * rank as u64 + k, Ownership::Owner))
        .collect();
    globals.push((4 * ((rank as u64 + 1) % 3), Ownership::Overlap));
    globals.push((4 * ((rank as u64 + 2) % 3), Ownership::Overlap));
    globals.sort_by_key(|&(g, _)| g);
    for (position, &(g, a)) in globals.iter().enumerate() {
        entries.push((g, position as u32, a));
    }
    index_set(&entries)
}

#[test]
fn ring_overlaps_take_neighbour_owner_values() {
    let results = run_ranks(3, |comm| {
        let rank = comm.rank();
        let set = ring_set(rank);
        let remote = RemoteIndices::rebuild(&set, &set, &comm).unwrap();
        let iface = Arc::new(Interface::build(
            &remote,
            Only(Ownership::Owner),
            Only(Ownership::Overlap),
        ));
        let mut bc = BufferedCommunicator::new();
        bc.build::<Vec<f64>>(iface);
        let mut data = vec![-5.0f64; set.len()];
        for e in set.iter() {
            if e.local.attribute() == Ownership::Owner {
                data[e.local.local() as usize] = e.global.get() as f64 * 10.0;
            }
        }
        bc.forward_inplace::<CopyGatherScatter, _, _>(&comm, &mut data)
            .unwrap();
        data
    });
    assert_eq!(results[0], vec![0.0, 10.0, 20.0, 30.0, 40.0, 80.0]);
    assert_eq!(results[1], vec![0.0, 40.0, 50.0, 60.0, 70.0, 80.0]);
    assert_eq!(results[2], vec![0.0, 40.0, 80.0, 90.0, 100.0, 110.0]);
}

#[test]
fn a_slow_rank_does_not_change_the_outcome() {
    let results = run_ranks(3, |comm| {
        let rank = comm.rank();
        if rank == 1 {
            std::thread::sleep(std::time::Duration::from_millis(40));
        }
        let set = ring_set(rank);
        let remote = RemoteIndices::rebuild(&set, &set, &comm).unwrap();
        let iface = Arc::new(Interface::build(
            &remote,
            Only(Ownership::Owner),
            Only(Ownership::Overlap),
        ));
        let mut bc = BufferedCommunicator::new();
        bc.build::<Vec<f64>>(iface);
        let mut data = vec![-5.0f64; set.len()];
        for e in set.iter() {
            if e.local.attribute() == Ownership::Owner {
                data[e.local.local() as usize] = e.global.get() as f64 * 10.0;
            }
        }
        if rank == 1 {
            std::thread::sleep(std::time::Duration::from_millis(40));
        }
        bc.forward_inplace::<CopyGatherScatter, _, _>(&comm, &mut data)
            .unwrap();
        data
    });
    assert_eq!(results[0], vec![0.0, 10.0, 20.0, 30.0, 40.0, 80.0]);
    assert_eq!(results[1], vec![0.0, 40.0, 50.0, 60.0, 70.0, 80.0]);
    assert_eq!(results[2], vec![0.0, 40.0, 80.0, 90.0, 100.0, 110.0]);
}

#[test]
fn empty_projection_exchanges_nothing() {
    let results = run_ranks(2, |comm| {
        let rank = comm.rank();
        let set = owner_ghost_set(rank);
        let remote = RemoteIndices::rebuild(&set, &set, &comm).unwrap();
        // No entry carries Overlap in this topology.
        let iface = Arc::new(Interface::build(
            &remote,
            Only(Ownership::Overlap),
            Only(Ownership::Overlap),
        ));
        assert!(iface.is_empty());
        let mut bc = BufferedCommunicator::new();
        bc.build::<Vec<i64>>(iface);
        let src = fill(&set, rank);
        let mut dst = src.clone();
        bc.forward::<CopyGatherScatter, _, _>(&comm, &src, &mut dst)
            .unwrap();
        let mut src = src;
        bc.backward::<CopyGatherScatter, _, _>(&comm, &mut src, &dst)
            .unwrap();
        (src, dst)
    });
    for (rank, (src, dst)) in results.into_iter().enumerate() {
        let expected = fill(&owner_ghost_set(rank), rank);
        assert_eq!(src, expected);
        assert_eq!(dst, expected);
    }
}

#[test]
fn additive_policy_accumulates_into_ghosts() {
    let results = run_ranks(2, |comm| {
        let rank = comm.rank();
        let set = owner_ghost_set(rank);
        let mut bc = owner_to_ghost(&set, &comm);
        let mut data = fill(&set, rank);
        for v in data.iter_mut() {
            if *v == -1 {
                *v = 1000;
            }
        }
        bc.forward_inplace::<AddGatherScatter, _, _>(&comm, &mut data)
            .unwrap();
        data
    });
    assert_eq!(results[0], vec![100, 200, 1000 + 301]);
    assert_eq!(results[1], vec![1000 + 200, 301, 401]);
}

#[test]
fn plan_survives_reuse_and_rebuild() {
    let results = run_ranks(2, |comm| {
        let rank = comm.rank();
        let set = owner_ghost_set(rank);
        let remote = RemoteIndices::rebuild(&set, &set, &comm).unwrap();
        let owner_iface = Arc::new(Interface::build(
            &remote,
            Only(Ownership::Owner),
            Only(Ownership::Ghost),
        ));
        let mut bc = BufferedCommunicator::new();
        bc.build::<Vec<i64>>(owner_iface);
        let src = fill(&set, rank);
        let mut dst = src.clone();
        for _ in 0..3 {
            bc.forward::<CopyGatherScatter, _, _>(&comm, &src, &mut dst)
                .unwrap();
        }
        let mut back = src.clone();
        for _ in 0..3 {
            bc.backward::<CopyGatherScatter, _, _>(&comm, &mut back, &dst)
                .unwrap();
        }
        assert_eq!(back, src);

        // Release the plan and rebuild on the reversed projection.
        bc.free();
        assert!(!bc.is_built());
        let ghost_iface = Arc::new(Interface::build(
            &remote,
            Only(Ownership::Ghost),
            Only(Ownership::Owner),
        ));
        bc.build::<Vec<i64>>(ghost_iface);
        assert!(bc.is_built());
        let mut data = vec![0i64; set.len()];
        for e in set.iter() {
            if e.local.attribute() == Ownership::Ghost {
                data[e.local.local() as usize] = (e.global.get() as i64 + 1) * 7;
            }
        }
        bc.forward_inplace::<CopyGatherScatter, _, _>(&comm, &mut data)
            .unwrap();
        data
    });
    // Ghost values now flow back onto the owners.
    assert_eq!(results[0], vec![0, 14, 21]);
    assert_eq!(results[1], vec![14, 21, 0]);
}
