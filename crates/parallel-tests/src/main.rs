//! Collective tests, run with `mpirun -n <P> parallel-tests` for several `P`.
use std::sync::Arc;

use mpi::{
    topology::{Rank, SimpleCommunicator},
    traits::*,
};

use rand::prelude::*;
use rand::SeedableRng;

use rusty_forest::{
    checksum::adler32,
    comm::{ProcessGroup, SyncOp},
    constants::DEFAULT_TRANSFER_TAG,
    error::Result,
    forest::{Forest, LocalTree},
    transfer::{
        transfer_fixed, transfer_fixed_begin, transfer_variable, transfer_variable_begin,
        TransferComm, TransferState,
    },
    types::{
        connectivity::Connectivity,
        octant::{Octant, Position},
        Gloidx, TreeId,
    },
};

/// Every octant of a forest in global order.
type GlobalOctants = Vec<(TreeId, Octant)>;

fn uniform_fixture(num_trees: TreeId, level: i8) -> GlobalOctants {
    (0..num_trees)
        .flat_map(|tree| {
            (0..(1u64 << (3 * level)))
                .map(move |i| (tree, Octant::from_morton_index(i, level).unwrap()))
        })
        .collect()
}

/// Random local counts adding up to `total`, the same on every rank.
fn random_cut_fixture(total: usize, size: usize, seed: u64) -> Vec<Gloidx> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut marks: Vec<usize> = (0..size - 1).map(|_| rng.gen_range(0..=total)).collect();
    marks.sort_unstable();

    let mut counts = Vec::with_capacity(size);
    let mut previous = 0;
    for mark in marks {
        counts.push((mark - previous) as Gloidx);
        previous = mark;
    }
    counts.push((total - previous) as Gloidx);
    counts
}

fn forest_fixture<'c>(
    world: &'c SimpleCommunicator,
    connectivity: &Arc<Connectivity>,
    global: &GlobalOctants,
    local_counts: &[Gloidx],
) -> Forest<'c> {
    let rank = world.rank() as usize;
    let first: Gloidx = local_counts[..rank].iter().sum();
    let last = first + local_counts[rank];

    let mut trees: Vec<LocalTree> = Vec::new();
    for &(tree, octant) in &global[first as usize..last as usize] {
        match trees.last_mut() {
            Some(local) if local.id == tree => local.octants.push(octant),
            _ => trees.push(LocalTree::new(tree, vec![octant])),
        }
    }

    let group = ProcessGroup::borrowed(world);
    let mut forest = Forest::new(group, Arc::clone(connectivity), trees).unwrap_or_else(|err| {
        ProcessGroup::borrowed(world).abort(&err)
    });
    check(world, forest.update_partition());
    forest
}

/// Unwrap a collective result, taking the whole group down on failure.
fn check<T>(world: &SimpleCommunicator, result: Result<T>) -> T {
    result.unwrap_or_else(|err| ProcessGroup::borrowed(world).abort(&err))
}

/// Test that the counts and positions agree with the cut used to build the forest.
fn test_partition_tables(world: &SimpleCommunicator) {
    let size = world.size() as usize;
    let connectivity = Arc::new(Connectivity::brick(2, 1, 1, [false; 3]));
    let global = uniform_fixture(2, 2);
    let local_counts = random_cut_fixture(global.len(), size, 0);

    let forest = forest_fixture(world, &connectivity, &global, &local_counts);
    let partition = check(world, forest.partition()).clone();

    let mut expected = vec![0];
    for count in &local_counts {
        expected.push(expected.last().unwrap() + count);
    }
    assert_eq!(partition.global_first_count(), &expected[..]);
    assert_eq!(partition.global_count(), global.len() as Gloidx);

    for p in 0..size {
        let empty = local_counts[p] == 0;
        assert_eq!(check(world, partition.is_empty(p as Rank)), empty);
        if !empty {
            let (tree, octant) = global[expected[p] as usize];
            assert_eq!(partition.global_first_position()[p].tree, tree);
            assert_eq!(partition.global_first_position()[p].anchor(), octant.anchor());
        }
    }

    // Every octant is found on the rank it was assigned to, from every guess.
    for (index, (tree, octant)) in global.iter().enumerate() {
        // The last rank starting at or before `index` is never an empty one.
        let owner = (expected.partition_point(|&first| first <= index as Gloidx) - 1) as Rank;
        for guess in 0..size as Rank {
            assert_eq!(check(world, partition.find_owner(*tree, octant, guess)), owner);
            assert_eq!(
                check(world, partition.find_owner_index(index as Gloidx, guess)),
                owner
            );
        }
    }

    let pertree = check(world, forest.count_pertree());
    assert_eq!(pertree, vec![0, 64, 128]);
}

/// Test that a new epoch needs a new partition.
fn test_epochs(world: &SimpleCommunicator) {
    let size = world.size() as usize;
    let connectivity = Arc::new(Connectivity::unit_cube());
    let coarse = uniform_fixture(1, 1);
    let mut forest = forest_fixture(world, &connectivity, &coarse, &random_cut_fixture(8, size, 1));
    let before = Arc::clone(check(world, forest.partition()));

    let fine = uniform_fixture(1, 2);
    let local_counts = random_cut_fixture(64, size, 2);
    let rank = world.rank() as usize;
    let first: Gloidx = local_counts[..rank].iter().sum();
    let octants: Vec<Octant> = fine[first as usize..(first + local_counts[rank]) as usize]
        .iter()
        .map(|&(_, octant)| octant)
        .collect();
    let trees = if octants.is_empty() {
        vec![]
    } else {
        vec![LocalTree::new(0, octants)]
    };

    check(world, forest.replace_trees(trees));
    assert!(forest.partition().is_err());

    let after = check(world, forest.update_partition());
    assert_eq!(after.epoch(), before.epoch() + 1);
    assert_eq!(after.global_count(), 64);
    // Holders of the old partition still see the old tables.
    assert_eq!(before.global_count(), 8);
}

fn test_sync_flag(world: &SimpleCommunicator) {
    let group = ProcessGroup::borrowed(world);
    let rank = world.rank();
    let size = world.size();

    assert!(check(world, group.sync_flag(true, SyncOp::And)));
    assert!(!check(world, group.sync_flag(false, SyncOp::Or)));
    assert_eq!(check(world, group.sync_flag(rank == 0, SyncOp::And)), size == 1);
    assert!(check(world, group.sync_flag(rank == size - 1, SyncOp::Or)));
}

fn rank_bytes_fixture(rank: Rank) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(100 + rank as u64);
    let len = rng.gen_range(0..2000);
    (0..len).map(|_| rng.gen()).collect()
}

/// Test that the combined checksum equals the checksum of all ranks' bytes in order.
fn test_checksum(world: &SimpleCommunicator) {
    let group = ProcessGroup::borrowed(world);
    let rank = world.rank();

    let local = rank_bytes_fixture(rank);
    let combined = check(world, group.checksum(adler32(&local), local.len() as u64));

    if rank == 0 {
        let concatenated: Vec<u8> = (0..world.size()).flat_map(rank_bytes_fixture).collect();
        assert_eq!(combined, adler32(&concatenated));
    } else {
        assert_eq!(combined, 0);
    }
}

/// Data for the octant with global index `index`.
fn payload(index: Gloidx) -> [u8; 8] {
    (index as u64).to_le_bytes()
}

fn local_payload(forest: &Forest<'_>, rank: Rank) -> Vec<u8> {
    let (first, last) = forest.partition().unwrap().local_range(rank).unwrap();
    (first..last).flat_map(payload).collect()
}

/// Test fixed-size transfers between two cuts of the same forest, both ways.
fn test_transfer_fixed(world: &SimpleCommunicator) {
    let size = world.size() as usize;
    let rank = world.rank();
    let connectivity = Arc::new(Connectivity::brick(1, 2, 1, [false; 3]));
    let global = uniform_fixture(2, 2);

    let a = forest_fixture(world, &connectivity, &global, &random_cut_fixture(128, size, 3));
    let b = forest_fixture(world, &connectivity, &global, &random_cut_fixture(128, size, 4));

    let a_data = local_payload(&a, rank);
    let expected_b = local_payload(&b, rank);

    let mut b_data = vec![0u8; expected_b.len()];
    check(
        world,
        transfer_fixed(&b, &a, TransferComm::Source, DEFAULT_TRANSFER_TAG, &mut b_data, &a_data, 8),
    );
    assert_eq!(b_data, expected_b);

    // And back again over a private duplicate.
    let mut round_trip = vec![0u8; a_data.len()];
    check(
        world,
        transfer_fixed(&a, &b, TransferComm::SourceDup, DEFAULT_TRANSFER_TAG, &mut round_trip, &b_data, 8),
    );
    assert_eq!(round_trip, a_data);

    // The split form gives the same result as the blocking form, and hands both
    // buffers back.
    let context = check(
        world,
        transfer_fixed_begin(
            &b,
            &a,
            TransferComm::External(world),
            DEFAULT_TRANSFER_TAG + 1,
            vec![0u8; expected_b.len()],
            a_data.clone(),
            8,
        ),
    );
    assert_eq!(context.state(), TransferState::Posted);
    let buffers = check(world, context.end());
    assert_eq!(buffers.dest_data, expected_b);
    assert_eq!(buffers.src_data, a_data);

    // Waiting keeps the context until it is ended.
    let mut context = check(
        world,
        transfer_fixed_begin(
            &a,
            &b,
            TransferComm::DestinationDup,
            DEFAULT_TRANSFER_TAG,
            vec![0u8; a_data.len()],
            expected_b.clone(),
            8,
        ),
    );
    check(world, context.wait());
    assert_eq!(context.state(), TransferState::Completed);
    assert_eq!(check(world, context.end()).dest_data, a_data);

    // No data, no messages.
    let context = check(
        world,
        transfer_fixed_begin(&b, &a, TransferComm::Destination, DEFAULT_TRANSFER_TAG, vec![], vec![], 0),
    );
    assert_eq!(context.num_senders(), 0);
    assert_eq!(context.num_receivers(), 0);
    check(world, context.end());
}

/// Test that split transfers on distinct tags can be outstanding together and
/// ended in any order.
fn test_overlapping_transfers(world: &SimpleCommunicator) {
    let size = world.size() as usize;
    let rank = world.rank();
    let connectivity = Arc::new(Connectivity::brick(2, 1, 1, [false; 3]));
    let global = uniform_fixture(2, 2);

    let a = forest_fixture(world, &connectivity, &global, &random_cut_fixture(128, size, 8));
    let b = forest_fixture(world, &connectivity, &global, &random_cut_fixture(128, size, 9));

    let a_data = local_payload(&a, rank);
    let b_data = local_payload(&b, rank);

    let forth = check(
        world,
        transfer_fixed_begin(
            &b,
            &a,
            TransferComm::Source,
            DEFAULT_TRANSFER_TAG + 2,
            vec![0u8; b_data.len()],
            a_data.clone(),
            8,
        ),
    );
    let back = check(
        world,
        transfer_fixed_begin(
            &a,
            &b,
            TransferComm::Source,
            DEFAULT_TRANSFER_TAG + 3,
            vec![0u8; a_data.len()],
            b_data.clone(),
            8,
        ),
    );

    // Ended in the reverse order of posting.
    assert_eq!(check(world, back.end()).dest_data, a_data);
    assert_eq!(check(world, forth.end()).dest_data, b_data);
}

/// Test variable-size transfers, with the sizes exchanged on the way.
fn test_transfer_variable(world: &SimpleCommunicator) {
    let size = world.size() as usize;
    let rank = world.rank();
    let connectivity = Arc::new(Connectivity::unit_cube());
    let global = uniform_fixture(1, 2);

    let a = forest_fixture(world, &connectivity, &global, &random_cut_fixture(64, size, 5));
    let b = forest_fixture(world, &connectivity, &global, &random_cut_fixture(64, size, 6));

    let item = |index: Gloidx| vec![index as u8; (index % 4) as usize];

    let (a_first, a_last) = a.partition().unwrap().local_range(rank).unwrap();
    let a_sizes: Vec<usize> = (a_first..a_last).map(|i| item(i).len()).collect();
    let a_data: Vec<u8> = (a_first..a_last).flat_map(item).collect();

    let received = check(
        world,
        transfer_variable(&b, &a, TransferComm::DestinationDup, DEFAULT_TRANSFER_TAG, &a_data, &a_sizes),
    );

    let (b_first, b_last) = b.partition().unwrap().local_range(rank).unwrap();
    let expected_sizes: Vec<usize> = (b_first..b_last).map(|i| item(i).len()).collect();
    let expected_data: Vec<u8> = (b_first..b_last).flat_map(item).collect();

    assert_eq!(received.sizes, expected_sizes);
    assert_eq!(received.data, expected_data);

    // With the sizes known on both ends the exchange can be skipped.
    let context = check(
        world,
        transfer_variable_begin(
            &b,
            &a,
            TransferComm::Source,
            DEFAULT_TRANSFER_TAG + 1,
            vec![0u8; expected_data.len()],
            &expected_sizes,
            a_data.clone(),
            &a_sizes,
        ),
    );
    let buffers = check(world, context.end());
    assert_eq!(buffers.dest_data, expected_data);
    assert_eq!(buffers.src_data, a_data);
}

/// Test that a process can start its range before its first local octant.
fn test_first_quad_override(world: &SimpleCommunicator) {
    let size = world.size() as usize;
    let rank = world.rank();
    let connectivity = Arc::new(Connectivity::unit_cube());

    // Tree 0 without its first level 1 octant, rank 0 always holds something.
    let global: GlobalOctants = uniform_fixture(1, 1).into_iter().skip(1).collect();
    let mut local_counts = random_cut_fixture(6, size, 7);
    local_counts[0] += 1;

    let mut forest = forest_fixture(world, &connectivity, &global, &local_counts);
    let (_, first_held) = global[0];
    assert_eq!(
        check(world, forest.partition()).global_first_position()[0],
        Position::of(0, &first_held)
    );

    let counts = check(world, forest.count_quadrants());
    let first_quad = if rank == 0 { Some(Octant::root()) } else { None };
    let partition = check(world, forest.global_partition(counts, first_quad));

    assert_eq!(partition.global_first_position()[0], Position::of(0, &Octant::root()));
    assert_eq!(partition.global_count(), 7);

    // The gap in front of the first held octant now belongs to rank 0.
    let gap = Octant::from_morton_index(0, 1).unwrap();
    for guess in 0..size as i32 {
        assert_eq!(check(world, partition.find_owner(0, &gap, guess)), 0);
        assert_eq!(check(world, partition.find_owner(0, &first_held, guess)), 0);
    }
}

/// Three ranks cutting ten octants as 3, 4, 3.
fn test_three_rank_scenario(world: &SimpleCommunicator) {
    let connectivity = Arc::new(Connectivity::brick(3, 1, 1, [false; 3]));
    let mut global = uniform_fixture(1, 1);
    global.push((1, Octant::root()));
    global.push((2, Octant::root()));

    let forest = forest_fixture(world, &connectivity, &global, &[3, 4, 3]);
    let partition = check(world, forest.partition());

    assert_eq!(partition.global_first_count(), &[0, 3, 7, 10]);
    for guess in 0..3 {
        assert_eq!(check(world, partition.find_owner_index(5, guess)), 1);
    }
    assert_eq!(check(world, forest.count_pertree()), vec![0, 8, 9, 10]);

    // Rank 2 holds the end of tree 0 and all of trees 1 and 2.
    if world.rank() == 2 {
        let info = check(world, forest.tree_info(0));
        assert_eq!(info.full_tree, [false, true]);
        assert!(forest.tree_info(1).is_err());
        let full = check(world, forest.tree_info_any(2));
        assert_eq!(full.full_tree, [true, true]);
        assert_eq!(full.tree_contact, [true, false, false, false, false, false]);
    }
}

/// Four ranks cutting ten octants as 0, 5, 0, 5.
fn test_four_rank_scenario(world: &SimpleCommunicator) {
    let connectivity = Arc::new(Connectivity::brick(3, 1, 1, [false; 3]));
    let mut global = uniform_fixture(1, 1);
    global.push((1, Octant::root()));
    global.push((2, Octant::root()));

    let forest = forest_fixture(world, &connectivity, &global, &[0, 5, 0, 5]);
    let partition = check(world, forest.partition());

    let empty: Vec<bool> = (0..4).map(|p| check(world, partition.is_empty(p))).collect();
    assert_eq!(empty, vec![true, false, true, false]);

    for (tree, octant) in &global {
        for guess in 0..4 {
            let owner = check(world, partition.find_owner(*tree, octant, guess));
            assert!(owner == 1 || owner == 3);
        }
    }

    // An empty rank has no local trees to describe.
    if world.rank() % 2 == 0 {
        assert!(forest.tree_info(0).is_err());
    }
}

fn main() {
    env_logger::init();

    let universe = mpi::initialize().unwrap();
    let world = universe.world();

    test_partition_tables(&world);
    test_epochs(&world);
    test_sync_flag(&world);
    test_checksum(&world);
    test_transfer_fixed(&world);
    test_overlapping_transfers(&world);
    test_transfer_variable(&world);
    test_first_quad_override(&world);

    match world.size() {
        3 => test_three_rank_scenario(&world),
        4 => test_four_rank_scenario(&world),
        _ => (),
    }

    if world.rank() == 0 {
        log::info!("all parallel tests passed on {} processes", world.size());
    }
}
