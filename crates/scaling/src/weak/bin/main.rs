use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use mpi::collective::SystemOperation;
use mpi::{topology::SimpleCommunicator, traits::*};

use rand::prelude::*;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use rusty_forest::{
    comm::ProcessGroup,
    constants::DEFAULT_TRANSFER_TAG,
    error::ForestError,
    forest::{Forest, LocalTree},
    transfer::{transfer_fixed, TransferComm},
    types::{connectivity::Connectivity, octant::Octant, Gloidx},
};

pub type Times = HashMap<String, u128>;

/// Experiment parameters, read from the JSON file given as the first argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ScalingConfig {
    /// Uniform refinement level of every tree.
    level: i8,
    /// Trees per process.
    trees_per_rank: i32,
    /// Bytes of data per octant.
    data_size: usize,
    /// Largest relative shift of the second partition's cut points.
    jitter: f64,
    seed: u64,
    /// Tree topology, a row of `trees_per_rank * size` trees when absent.
    connectivity: Option<Connectivity>,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        ScalingConfig {
            level: 4,
            trees_per_rank: 1,
            data_size: 64,
            jitter: 0.5,
            seed: 0,
            connectivity: None,
        }
    }
}

fn config_fixture() -> ScalingConfig {
    match std::env::args().nth(1) {
        Some(path) => {
            let file = std::fs::File::open(&path)
                .unwrap_or_else(|err| panic!("cannot open config {}: {}", path, err));
            serde_json::from_reader(file)
                .unwrap_or_else(|err| panic!("cannot parse config {}: {}", path, err))
        }
        None => ScalingConfig::default(),
    }
}

/// A forest over `size * trees_per_rank` uniformly refined trees, cut into
/// contiguous ranges of `per_rank[p]` octants.
fn forest_fixture<'c>(
    world: &'c SimpleCommunicator,
    config: &ScalingConfig,
    per_rank: &[Gloidx],
) -> Forest<'c> {
    let rank = world.rank() as usize;
    let num_trees = config.trees_per_rank * world.size();
    let per_tree: Gloidx = 1 << (3 * config.level);

    let first: Gloidx = per_rank[..rank].iter().sum();
    let last = first + per_rank[rank];

    let mut trees: Vec<LocalTree> = Vec::new();
    for index in first..last {
        let tree = (index / per_tree) as i32;
        let octant = Octant::from_morton_index((index % per_tree) as u64, config.level)
            .unwrap_or_else(|err| ProcessGroup::borrowed(world).abort(&err));
        match trees.last_mut() {
            Some(local) if local.id == tree => local.octants.push(octant),
            _ => trees.push(LocalTree::new(tree, vec![octant])),
        }
    }

    let connectivity = match &config.connectivity {
        Some(connectivity) if connectivity.num_trees() != num_trees => {
            let err = ForestError::Precondition(format!(
                "configured topology has {} trees, {} processes need {}",
                connectivity.num_trees(),
                world.size(),
                num_trees
            ));
            ProcessGroup::borrowed(world).abort(&err)
        }
        Some(connectivity) => Arc::new(connectivity.clone()),
        None => Arc::new(Connectivity::brick(num_trees, 1, 1, [false; 3])),
    };
    let mut forest = Forest::new(ProcessGroup::borrowed(world), connectivity, trees)
        .unwrap_or_else(|err| ProcessGroup::borrowed(world).abort(&err));
    if let Err(err) = forest.update_partition() {
        ProcessGroup::borrowed(world).abort(&err)
    }
    forest
}

/// Even cut, and a cut whose boundaries are shifted at random.
fn cuts_fixture(config: &ScalingConfig, size: usize) -> (Vec<Gloidx>, Vec<Gloidx>) {
    let per_rank: Gloidx = config.trees_per_rank as Gloidx * (1 << (3 * config.level));
    let even = vec![per_rank; size];

    let mut rng = StdRng::seed_from_u64(config.seed);
    let total = size as Gloidx * per_rank;
    let mut bounds: Vec<Gloidx> = (0..=size as Gloidx).map(|p| p * per_rank).collect();
    for bound in bounds.iter_mut().take(size).skip(1) {
        let shift = (rng.gen_range(-config.jitter..=config.jitter) * per_rank as f64) as Gloidx;
        *bound = (*bound + shift).clamp(0, total);
    }
    bounds.sort_unstable();
    let shifted = bounds.windows(2).map(|w| w[1] - w[0]).collect();

    (even, shifted)
}

fn main() {
    env_logger::init();

    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank();
    let size = world.size();

    let config = config_fixture();
    let (even, shifted) = cuts_fixture(&config, size as usize);

    let mut times: Times = HashMap::new();

    let start = Instant::now();
    let src = forest_fixture(&world, &config, &even);
    let dest = forest_fixture(&world, &config, &shifted);
    times.insert("partition".to_string(), start.elapsed().as_millis());

    let src_data = vec![rank as u8; src.local_count() as usize * config.data_size];
    let mut dest_data = vec![0u8; dest.local_count() as usize * config.data_size];

    let start = Instant::now();
    transfer_fixed(
        &dest,
        &src,
        TransferComm::Source,
        DEFAULT_TRANSFER_TAG,
        &mut dest_data,
        &src_data,
        config.data_size,
    )
    .unwrap_or_else(|err| ProcessGroup::borrowed(&world).abort(&err));
    times.insert("transfer".to_string(), start.elapsed().as_millis());

    let root_rank = 0;
    let noctants = dest.local_count() as Gloidx;
    let mut sum: Gloidx = 0;

    // Print runtime to stdout
    if rank == root_rank {
        world
            .process_at_rank(root_rank)
            .reduce_into_root(&noctants, &mut sum, SystemOperation::sum());

        // universe size, number of octants, partition time, transfer time
        println!(
            "{:?}, {:?}, {:?}, {:?}",
            size,
            sum,
            times.get(&"partition".to_string()),
            times.get(&"transfer".to_string()),
        )
    } else {
        world
            .process_at_rank(root_rank)
            .reduce_into(&noctants, SystemOperation::sum())
    }
}
