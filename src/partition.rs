//! Partition counting and the replicated global position table.
//!
//! The pipeline runs once per refinement epoch:
//! 1. [`count_quadrants`] turns every process's local octant count into the
//!    replicated cumulative table `global_first_count`.
//! 2. [`global_partition`] gathers every process's first position into
//!    `global_first_position` and publishes both tables as one immutable
//!    [`Partition`].
//! 3. [`count_pertree`] derives cumulative per-tree counts from a published partition.

use itertools::Itertools;
use log::{debug, warn};
use mpi::{collective::SystemOperation, topology::Rank, traits::*};

use crate::{
    comm::ProcessGroup,
    error::{ForestError, Result},
    types::{octant::Position, Gloidx, Locidx, TreeId},
};

/// Exclusive prefix sum of per-process counts, with the grand total appended.
pub fn cumulative_counts(local_counts: &[Gloidx]) -> Vec<Gloidx> {
    let mut cumulative = Vec::with_capacity(local_counts.len() + 1);
    cumulative.push(0);
    let mut total = 0;
    for &count in local_counts {
        total += count;
        cumulative.push(total);
    }
    cumulative
}

/// Give every empty process (marked by [`Position::empty_marker`]) the position
/// of the next non-empty process, so that its range has zero width.
pub fn fill_empty_positions(positions: &mut [Position]) {
    for i in (0..positions.len().saturating_sub(1)).rev() {
        if positions[i].is_empty_marker() {
            positions[i] = positions[i + 1];
        }
    }
}

/// Cumulative octant counts per tree from per-tree totals.
///
/// Entry `t` is the number of octants in trees `0..t`; the last entry is the grand total.
pub fn pertree_offsets(per_tree_totals: &[Gloidx]) -> Vec<Gloidx> {
    cumulative_counts(per_tree_totals)
}

/// Replicated cumulative octant counts, `num_procs + 1` entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionCounts {
    global_first_count: Vec<Gloidx>,
}

impl PartitionCounts {
    /// Counts table from the local count of every process, in rank order.
    pub fn from_local_counts(local_counts: &[Gloidx]) -> Result<Self> {
        if let Some(bad) = local_counts.iter().find(|&&c| c < 0) {
            return Err(ForestError::precondition(format!(
                "negative local octant count {}",
                bad
            )));
        }
        Ok(PartitionCounts {
            global_first_count: cumulative_counts(local_counts),
        })
    }

    pub fn num_procs(&self) -> Rank {
        (self.global_first_count.len() - 1) as Rank
    }

    pub fn global_first_count(&self) -> &[Gloidx] {
        &self.global_first_count
    }

    /// Total number of octants in the forest.
    pub fn global_count(&self) -> Gloidx {
        self.global_first_count[self.global_first_count.len() - 1]
    }

    pub fn local_count(&self, rank: Rank) -> Result<Gloidx> {
        if rank < 0 || rank >= self.num_procs() {
            return Err(ForestError::precondition(format!(
                "rank {} outside 0..{}",
                rank,
                self.num_procs()
            )));
        }
        let p = rank as usize;
        Ok(self.global_first_count[p + 1] - self.global_first_count[p])
    }
}

/// Add up the local octant counts of all processes. Collective.
pub fn count_quadrants(group: &ProcessGroup<'_>, local_count: Locidx) -> Result<PartitionCounts> {
    let comm = group.comm()?;

    if local_count < 0 {
        return Err(ForestError::precondition(format!(
            "negative local octant count {}",
            local_count
        )));
    }

    let qlocal = local_count as Gloidx;
    let mut local_counts = vec![0 as Gloidx; comm.size() as usize];
    comm.all_gather_into(&qlocal, &mut local_counts[..]);

    let counts = PartitionCounts::from_local_counts(&local_counts)?;
    debug!(
        "counted {} octants over {} processes",
        counts.global_count(),
        counts.num_procs()
    );
    Ok(counts)
}

/// Immutable description of one partition epoch, replicated on every process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    epoch: u64,
    num_trees: TreeId,
    global_first_count: Vec<Gloidx>,
    global_first_position: Vec<Position>,
}

impl Partition {
    /// Assemble and validate a partition from its two replicated tables.
    pub fn new(
        epoch: u64,
        num_trees: TreeId,
        counts: PartitionCounts,
        global_first_position: Vec<Position>,
    ) -> Result<Self> {
        let partition = Partition {
            epoch,
            num_trees,
            global_first_count: counts.global_first_count,
            global_first_position,
        };
        partition.validate()?;
        Ok(partition)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn num_trees(&self) -> TreeId {
        self.num_trees
    }

    pub fn num_procs(&self) -> Rank {
        (self.global_first_count.len() - 1) as Rank
    }

    pub fn global_first_count(&self) -> &[Gloidx] {
        &self.global_first_count
    }

    pub fn global_first_position(&self) -> &[Position] {
        &self.global_first_position
    }

    /// Total number of octants in the forest.
    pub fn global_count(&self) -> Gloidx {
        self.global_first_count[self.global_first_count.len() - 1]
    }

    /// Global index range `[first, last)` owned by `rank`.
    pub fn local_range(&self, rank: Rank) -> Result<(Gloidx, Gloidx)> {
        self.check_rank(rank)?;
        let p = rank as usize;
        Ok((self.global_first_count[p], self.global_first_count[p + 1]))
    }

    pub fn local_count(&self, rank: Rank) -> Result<Gloidx> {
        let (first, last) = self.local_range(rank)?;
        Ok(last - first)
    }

    pub(crate) fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank < 0 || rank >= self.num_procs() {
            return Err(ForestError::precondition(format!(
                "rank {} outside 0..{}",
                rank,
                self.num_procs()
            )));
        }
        Ok(())
    }

    /// Check the replicated tables against each other.
    pub fn validate(&self) -> Result<()> {
        let gfc = &self.global_first_count;
        let gfp = &self.global_first_position;

        if gfc.len() < 2 {
            return Err(ForestError::invariant("partition over an empty process group"));
        }
        if gfp.len() != gfc.len() {
            return Err(ForestError::invariant(format!(
                "{} count entries but {} position entries",
                gfc.len(),
                gfp.len()
            )));
        }
        if gfc[0] != 0 {
            return Err(ForestError::invariant(format!(
                "global_first_count starts at {}",
                gfc[0]
            )));
        }
        if let Some((p, _)) = gfc.iter().tuple_windows().find_position(|(a, b)| a > b) {
            return Err(ForestError::invariant(format!(
                "global_first_count decreases after process {}",
                p
            )));
        }

        let sentinel = Position::sentinel(self.num_trees);
        if gfp[gfp.len() - 1] != sentinel {
            return Err(ForestError::invariant(format!(
                "last position {:?} is not the sentinel {:?}",
                gfp[gfp.len() - 1],
                sentinel
            )));
        }
        if let Some(bad) = gfp.iter().find(|pos| pos.tree < 0 || pos.tree > self.num_trees) {
            return Err(ForestError::invariant(format!(
                "position {:?} outside trees 0..{}",
                bad, self.num_trees
            )));
        }
        if let Some((p, _)) = gfp.iter().tuple_windows().find_position(|(a, b)| a > b) {
            return Err(ForestError::invariant(format!(
                "global_first_position decreases after process {}",
                p
            )));
        }

        for p in 0..gfc.len() - 1 {
            let empty_by_count = gfc[p] == gfc[p + 1];
            let empty_by_position = gfp[p] == gfp[p + 1];
            if empty_by_count != empty_by_position {
                return Err(ForestError::invariant(format!(
                    "process {} is {} by count but {} by position",
                    p,
                    if empty_by_count { "empty" } else { "non-empty" },
                    if empty_by_position { "empty" } else { "non-empty" },
                )));
            }
        }

        Ok(())
    }
}

/// Gather every process's first position and publish the partition. Collective.
///
/// `first` is this process's first position, `None` if it owns no octants.
pub fn global_partition(
    group: &ProcessGroup<'_>,
    counts: PartitionCounts,
    first: Option<Position>,
    num_trees: TreeId,
    epoch: u64,
) -> Result<Partition> {
    let comm = group.comm()?;
    let size = comm.size();
    let rank = comm.rank();

    if counts.num_procs() != size {
        return Err(ForestError::precondition(format!(
            "counts describe {} processes, group has {}",
            counts.num_procs(),
            size
        )));
    }
    let local_count = counts.local_count(rank)?;
    if first.is_some() != (local_count > 0) {
        return Err(ForestError::precondition(format!(
            "rank {} owns {} octants but {} a first position",
            rank,
            local_count,
            if first.is_some() { "supplied" } else { "did not supply" }
        )));
    }

    let input = first.unwrap_or_else(Position::empty_marker);
    let mut positions = vec![Position::default(); size as usize + 1];
    comm.all_gather_into(&input, &mut positions[..size as usize]);
    positions[size as usize] = Position::sentinel(num_trees);

    fill_empty_positions(&mut positions);

    let partition = Partition::new(epoch, num_trees, counts, positions).map_err(|err| {
        warn!("published partition is inconsistent: {}", err);
        err
    })?;
    debug!(
        "published partition epoch {} with {} octants",
        epoch,
        partition.global_count()
    );
    Ok(partition)
}

/// Cumulative octant counts per tree across the group. Collective.
///
/// `local_per_tree` holds this process's octant count for every tree of the
/// connectivity. Returns `num_trees + 1` entries.
pub fn count_pertree(
    group: &ProcessGroup<'_>,
    partition: &Partition,
    local_per_tree: &[Gloidx],
) -> Result<Vec<Gloidx>> {
    let comm = group.comm()?;

    if local_per_tree.len() != partition.num_trees() as usize {
        return Err(ForestError::precondition(format!(
            "{} per-tree counts for {} trees",
            local_per_tree.len(),
            partition.num_trees()
        )));
    }

    let mut per_tree_totals = vec![0 as Gloidx; local_per_tree.len()];
    comm.all_reduce_into(local_per_tree, &mut per_tree_totals[..], SystemOperation::sum());

    let pertree = pertree_offsets(&per_tree_totals);
    if pertree[pertree.len() - 1] != partition.global_count() {
        return Err(ForestError::invariant(format!(
            "per-tree counts add up to {}, partition holds {}",
            pertree[pertree.len() - 1],
            partition.global_count()
        )));
    }

    Ok(pertree)
}
