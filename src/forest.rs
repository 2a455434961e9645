//! A process's local share of a distributed forest.
//!
//! A [`Forest`] holds the octants of a contiguous range of trees, the process
//! group it is distributed over, and the [`Partition`] published for its current
//! refinement epoch. Changing the local octants starts a new epoch and drops the
//! published partition until [`Forest::update_partition`] runs again.

use std::sync::Arc;

use log::{debug, info};
use mpi::topology::{Rank, SimpleCommunicator};

use crate::{
    comm::{ProcessGroup, SyncOp},
    contact::{self, TreeInfo},
    error::{ForestError, Result},
    partition::{self, Partition, PartitionCounts},
    types::{
        connectivity::Connectivity,
        octant::{Octant, Position},
        Gloidx, Locidx, TreeId,
    },
};

/// The octants this process holds in one tree, in Morton order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalTree {
    pub id: TreeId,
    pub octants: Vec<Octant>,
}

impl LocalTree {
    pub fn new(id: TreeId, octants: Vec<Octant>) -> Self {
        LocalTree { id, octants }
    }
}

pub struct Forest<'c> {
    group: ProcessGroup<'c>,
    connectivity: Arc<Connectivity>,
    trees: Vec<LocalTree>,
    local_count: Locidx,
    epoch: u64,
    partition: Option<Arc<Partition>>,
}

fn check_trees(connectivity: &Connectivity, trees: &[LocalTree]) -> Result<Locidx> {
    let mut local_count: usize = 0;

    for (i, tree) in trees.iter().enumerate() {
        connectivity.check_tree(tree.id)?;

        if i > 0 && tree.id != trees[i - 1].id + 1 {
            return Err(ForestError::precondition(format!(
                "local trees are not contiguous: {} follows {}",
                tree.id,
                trees[i - 1].id
            )));
        }
        if tree.octants.is_empty() {
            return Err(ForestError::precondition(format!(
                "local tree {} holds no octants",
                tree.id
            )));
        }
        if let Some(bad) = tree.octants.iter().find(|q| !q.is_valid()) {
            return Err(ForestError::precondition(format!(
                "tree {} holds invalid octant {:?}",
                tree.id, bad
            )));
        }
        if tree.octants.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ForestError::precondition(format!(
                "octants of tree {} are not strictly increasing",
                tree.id
            )));
        }

        local_count += tree.octants.len();
    }

    Locidx::try_from(local_count).map_err(|_| {
        ForestError::precondition(format!("{} local octants overflow the local index", local_count))
    })
}

impl<'c> Forest<'c> {
    /// Distribute `trees` over `group`. No partition is published yet.
    pub fn new(
        group: ProcessGroup<'c>,
        connectivity: Arc<Connectivity>,
        trees: Vec<LocalTree>,
    ) -> Result<Self> {
        let local_count = check_trees(&connectivity, &trees)?;

        Ok(Forest {
            group,
            connectivity,
            trees,
            local_count,
            epoch: 0,
            partition: None,
        })
    }

    pub fn group(&self) -> &ProcessGroup<'c> {
        &self.group
    }

    /// Give the forest an owned duplicate of `comm`.
    pub fn create_group(&mut self, comm: &SimpleCommunicator) {
        self.group.create(comm);
    }

    /// Point the forest at `comm` without duplicating it.
    pub fn assign_group(&mut self, comm: &'c SimpleCommunicator) {
        self.group.assign(comm);
    }

    /// Release the forest's process group, leaving it null.
    pub fn free_group(&mut self) {
        self.group.free();
    }

    pub fn connectivity(&self) -> &Arc<Connectivity> {
        &self.connectivity
    }

    pub fn trees(&self) -> &[LocalTree] {
        &self.trees
    }

    pub fn local_count(&self) -> Locidx {
        self.local_count
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn first_local_tree(&self) -> Option<TreeId> {
        self.trees.first().map(|t| t.id)
    }

    pub fn last_local_tree(&self) -> Option<TreeId> {
        self.trees.last().map(|t| t.id)
    }

    fn local_trees(&self) -> Option<(TreeId, TreeId)> {
        self.first_local_tree().zip(self.last_local_tree())
    }

    /// Replace the local octants, starting a new epoch.
    pub fn replace_trees(&mut self, trees: Vec<LocalTree>) -> Result<()> {
        self.local_count = check_trees(&self.connectivity, &trees)?;
        self.trees = trees;
        self.epoch += 1;
        self.partition = None;
        debug!("forest entered epoch {} with {} local octants", self.epoch, self.local_count);
        Ok(())
    }

    /// Count octants across the group. Collective.
    pub fn count_quadrants(&self) -> Result<PartitionCounts> {
        partition::count_quadrants(&self.group, self.local_count)
    }

    /// Publish the partition for the current epoch from `counts`. Collective.
    ///
    /// `first_quad` overrides the first local octant as the start of this
    /// process's range; it is ignored on processes that own no octants.
    pub fn global_partition(
        &mut self,
        counts: PartitionCounts,
        first_quad: Option<Octant>,
    ) -> Result<Arc<Partition>> {
        let first = match self.trees.first() {
            None => None,
            Some(tree) => {
                let first_octant = first_quad.unwrap_or(tree.octants[0]);
                if !first_octant.is_valid() || first_octant > tree.octants[0] {
                    return Err(ForestError::precondition(format!(
                        "{:?} cannot start the range of tree {} beginning at {:?}",
                        first_octant, tree.id, tree.octants[0]
                    )));
                }
                Some(Position::of(tree.id, &first_octant))
            }
        };

        let published = partition::global_partition(
            &self.group,
            counts,
            first,
            self.connectivity.num_trees(),
            self.epoch,
        )?;

        let published = Arc::new(published);
        self.partition = Some(Arc::clone(&published));
        Ok(published)
    }

    /// Count octants and publish the partition for the current epoch. Collective.
    pub fn update_partition(&mut self) -> Result<Arc<Partition>> {
        let counts = self.count_quadrants()?;
        let published = self.global_partition(counts, None)?;
        info!(
            "partition epoch {}: {} octants, {} local",
            published.epoch(),
            published.global_count(),
            self.local_count
        );
        Ok(published)
    }

    /// The partition published for the current epoch.
    pub fn partition(&self) -> Result<&Arc<Partition>> {
        self.partition.as_ref().ok_or_else(|| {
            ForestError::precondition(format!(
                "no partition published for epoch {}",
                self.epoch
            ))
        })
    }

    /// Cumulative octant counts per tree. Collective.
    pub fn count_pertree(&self) -> Result<Vec<Gloidx>> {
        let partition = self.partition()?;

        let mut local_per_tree = vec![0 as Gloidx; self.connectivity.num_trees() as usize];
        for tree in &self.trees {
            local_per_tree[tree.id as usize] = tree.octants.len() as Gloidx;
        }

        partition::count_pertree(&self.group, partition, &local_per_tree)
    }

    pub fn find_owner(&self, tree: TreeId, q: &Octant, guess: Rank) -> Result<Rank> {
        self.partition()?.find_owner(tree, q, guess)
    }

    /// Boundary summary for a partially owned local tree.
    pub fn tree_info(&self, tree: TreeId) -> Result<TreeInfo> {
        let rank = self.group.rank()?;
        contact::tree_info(
            self.partition()?,
            &self.connectivity,
            rank,
            self.local_trees(),
            tree,
        )
    }

    /// Boundary summary for any local tree, owned completely or not.
    pub fn tree_info_any(&self, tree: TreeId) -> Result<TreeInfo> {
        let partition = self.partition()?;
        let rank = self.group.rank()?;
        if contact::owns_tree(partition, rank, tree)? {
            TreeInfo::fully_owned(partition, &self.connectivity, rank, tree)
        } else {
            self.tree_info(tree)
        }
    }

    pub fn neighborhood_owned(&self, info: &TreeInfo, q: &Octant) -> Result<bool> {
        contact::neighborhood_owned(self.partition()?, self.group.rank()?, info, q)
    }

    pub fn sync_flag(&self, flag: bool, op: SyncOp) -> Result<bool> {
        self.group.sync_flag(flag, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{constants::QMAXLEVEL, error::ErrorKind};

    fn uniform_octants(level: i8) -> Vec<Octant> {
        (0..(1u64 << (3 * level)))
            .map(|i| Octant::from_morton_index(i, level).unwrap())
            .collect()
    }

    #[test]
    fn test_new_validates_trees() {
        let connectivity = Arc::new(Connectivity::brick(3, 1, 1, [false; 3]));

        let forest = Forest::new(
            ProcessGroup::null(),
            Arc::clone(&connectivity),
            vec![
                LocalTree::new(1, uniform_octants(1)),
                LocalTree::new(2, uniform_octants(0)),
            ],
        )
        .unwrap();
        assert_eq!(forest.local_count(), 9);
        assert_eq!(forest.first_local_tree(), Some(1));
        assert_eq!(forest.last_local_tree(), Some(2));

        let gap = vec![
            LocalTree::new(0, uniform_octants(0)),
            LocalTree::new(2, uniform_octants(0)),
        ];
        assert!(Forest::new(ProcessGroup::null(), Arc::clone(&connectivity), gap).is_err());

        let mut unsorted = uniform_octants(1);
        unsorted.swap(2, 5);
        let unsorted = vec![LocalTree::new(0, unsorted)];
        assert!(Forest::new(ProcessGroup::null(), Arc::clone(&connectivity), unsorted).is_err());

        let foreign = vec![LocalTree::new(3, uniform_octants(0))];
        assert!(Forest::new(ProcessGroup::null(), Arc::clone(&connectivity), foreign).is_err());

        let hollow = vec![LocalTree::new(0, vec![])];
        assert!(Forest::new(ProcessGroup::null(), connectivity, hollow).is_err());
    }

    #[test]
    fn test_empty_forest() {
        let forest = Forest::new(
            ProcessGroup::null(),
            Arc::new(Connectivity::unit_cube()),
            vec![],
        )
        .unwrap();
        assert_eq!(forest.local_count(), 0);
        assert_eq!(forest.first_local_tree(), None);
    }

    #[test]
    fn test_collectives_need_a_group() {
        let mut forest = Forest::new(
            ProcessGroup::null(),
            Arc::new(Connectivity::unit_cube()),
            vec![LocalTree::new(0, uniform_octants(1))],
        )
        .unwrap();

        assert_eq!(forest.count_quadrants(), Err(ForestError::NullProcessGroup));
        assert_eq!(forest.update_partition().err(), Some(ForestError::NullProcessGroup));
        assert!(forest.partition().is_err());
        assert!(forest.find_owner(0, &Octant::root(), 0).is_err());
    }

    #[test]
    fn test_first_quad_is_checked_before_publishing() {
        let octants = uniform_octants(2);
        let mut forest = Forest::new(
            ProcessGroup::null(),
            Arc::new(Connectivity::unit_cube()),
            vec![LocalTree::new(0, octants[5..].to_vec())],
        )
        .unwrap();
        let counts = PartitionCounts::from_local_counts(&[59]).unwrap();

        // An override past the first local octant would disown it.
        let err = forest
            .global_partition(counts.clone(), Some(octants[6]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionViolation);

        let misaligned = Octant::new(1, 0, 0, 2);
        let err = forest
            .global_partition(counts.clone(), Some(misaligned))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionViolation);

        // Earlier octants, or the first one itself, pass the check and only then
        // need a process group.
        for first_quad in [octants[5], octants[0], Octant::root()] {
            assert_eq!(
                forest.global_partition(counts.clone(), Some(first_quad)).err(),
                Some(ForestError::NullProcessGroup)
            );
        }
        assert!(forest.partition().is_err());
    }

    #[test]
    fn test_replace_trees_starts_new_epoch() {
        let mut forest = Forest::new(
            ProcessGroup::null(),
            Arc::new(Connectivity::unit_cube()),
            vec![LocalTree::new(0, uniform_octants(1))],
        )
        .unwrap();

        forest
            .replace_trees(vec![LocalTree::new(0, uniform_octants(2))])
            .unwrap();
        assert_eq!(forest.epoch(), 1);
        assert_eq!(forest.local_count(), 64);

        let bad = vec![LocalTree::new(0, vec![Octant::new(1, 0, 0, QMAXLEVEL)])];
        assert!(forest.replace_trees(bad).is_err());
        assert_eq!(forest.epoch(), 1);
        assert_eq!(forest.local_count(), 64);
    }
}
