//! Boundary and contact analysis for partially owned trees.
//!
//! When a process owns only part of a tree, [`tree_info`] summarizes where the
//! partition cuts the tree and which faces touch other trees.
//! [`neighborhood_owned`] then answers cheaply whether all same-size neighbours
//! of an octant are local, which lets ghost construction skip interior octants.

use log::trace;
use mpi::topology::Rank;

use crate::{
    constants::{FACES, QMAXLEVEL, ROOT_LEN},
    error::{ForestError, Result},
    partition::Partition,
    types::{
        connectivity::Connectivity,
        octant::{Octant, Position},
        TreeId,
    },
};

/// How a process's share of one tree sits in the partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeInfo {
    pub tree: TreeId,
    /// Whether this process owns the beginning (`[0]`) and the end (`[1]`) of the tree.
    pub full_tree: [bool; 2],
    /// Whether each face of the tree touches another tree or wraps onto itself.
    pub tree_contact: [bool; FACES],
    /// First position owned by this process.
    pub first: Position,
    /// First position owned by the next non-empty process, or the sentinel.
    pub next: Position,
}

impl TreeInfo {
    /// Summary for a tree `rank` owns completely.
    pub fn fully_owned(
        partition: &Partition,
        connectivity: &Connectivity,
        rank: Rank,
        tree: TreeId,
    ) -> Result<Self> {
        connectivity.check_tree(tree)?;
        if !owns_tree(partition, rank, tree)? {
            return Err(ForestError::precondition(format!(
                "tree {} is not owned completely by rank {}",
                tree, rank
            )));
        }

        let gfp = partition.global_first_position();
        Ok(TreeInfo {
            tree,
            full_tree: [true, true],
            tree_contact: contacts(connectivity, tree)?,
            first: gfp[rank as usize],
            next: gfp[rank as usize + 1],
        })
    }

    /// Smallest octant this process could own in the tree.
    pub fn first_octant(&self) -> Octant {
        if self.first.tree == self.tree {
            self.first.to_octant()
        } else {
            Octant::root().first_descendant(QMAXLEVEL)
        }
    }

    /// Smallest octant the next process could own in the tree, if it starts in this tree.
    pub fn next_octant(&self) -> Option<Octant> {
        if self.next.tree == self.tree {
            Some(self.next.to_octant())
        } else {
            None
        }
    }
}

fn contacts(connectivity: &Connectivity, tree: TreeId) -> Result<[bool; FACES]> {
    let mut tree_contact = [false; FACES];
    for (face, contact) in tree_contact.iter_mut().enumerate() {
        *contact = connectivity.has_contact(tree, face)?;
    }
    Ok(tree_contact)
}

/// True if `rank` owns every octant of `tree`.
pub fn owns_tree(partition: &Partition, rank: Rank, tree: TreeId) -> Result<bool> {
    if partition.is_empty(rank)? {
        return Ok(false);
    }
    let gfp = partition.global_first_position();
    let (first, next) = (gfp[rank as usize], gfp[rank as usize + 1]);

    Ok(first <= Position::of(tree, &Octant::root()) && next.tree > tree)
}

/// Summarize how `rank`'s share of `tree` sits in the partition.
///
/// `local_trees` is the inclusive range of trees `rank` holds octants in. The
/// tree must be one of them and must not be owned completely; use
/// [`TreeInfo::fully_owned`] for that case.
pub fn tree_info(
    partition: &Partition,
    connectivity: &Connectivity,
    rank: Rank,
    local_trees: Option<(TreeId, TreeId)>,
    tree: TreeId,
) -> Result<TreeInfo> {
    connectivity.check_tree(tree)?;

    let (first_local_tree, last_local_tree) = local_trees.ok_or_else(|| {
        ForestError::precondition(format!("rank {} owns no trees", rank))
    })?;
    if tree < first_local_tree || tree > last_local_tree {
        return Err(ForestError::precondition(format!(
            "tree {} is not local to rank {}, which holds trees {}..={}",
            tree, rank, first_local_tree, last_local_tree
        )));
    }
    if partition.is_empty(rank)? {
        return Err(ForestError::invariant(format!(
            "rank {} holds trees but is empty in partition epoch {}",
            rank,
            partition.epoch()
        )));
    }

    let gfp = partition.global_first_position();
    let first = gfp[rank as usize];
    let next = gfp[rank as usize + 1];

    let full_tree = [
        tree > first_local_tree || first.is_tree_start(),
        tree < last_local_tree || next.tree > tree,
    ];
    if full_tree == [true, true] {
        return Err(ForestError::precondition(format!(
            "tree {} is owned completely by rank {}",
            tree, rank
        )));
    }

    trace!("tree {} on rank {} has ownership {:?}", tree, rank, full_tree);

    Ok(TreeInfo {
        tree,
        full_tree,
        tree_contact: contacts(connectivity, tree)?,
        first,
        next,
    })
}

/// True if every octant of the size of `q` touching `q` through a face, edge or
/// corner is owned by `rank`.
///
/// A `false` answer may be wrong (the neighbourhood could still be local),
/// a `true` answer never is. Full ownership claimed by `info` is checked
/// against the partition before it is relied on.
pub fn neighborhood_owned(
    partition: &Partition,
    rank: Rank,
    info: &TreeInfo,
    q: &Octant,
) -> Result<bool> {
    partition.check_rank(rank)?;
    if !q.is_valid() {
        return Err(ForestError::precondition(format!("{:?} is not a valid octant", q)));
    }

    let tree = info.tree;
    let qh = q.len();

    if info.full_tree == [true, true] && owns_tree(partition, rank, tree)? {
        // The whole tree is local, only faces glued to other trees can leave it.
        let anchor = q.anchor();
        let touches_contact = (0..FACES).any(|face| {
            let coord = anchor[face / 2];
            let on_face = if face % 2 == 0 {
                coord == 0
            } else {
                coord == ROOT_LEN - qh
            };
            on_face && info.tree_contact[face]
        });
        return Ok(!touches_contact);
    }

    // The neighbourhood spans the Morton range from the lower corner neighbour
    // to the last descendant of the upper corner neighbour.
    let lower = Octant::new(q.x - qh, q.y - qh, q.z - qh, q.level);
    if lower.is_inside_root() && partition.owns(tree, &lower, rank) {
        let upper = Octant::new(q.x + qh, q.y + qh, q.z + qh, q.level);
        if upper.is_inside_root() && partition.owns(tree, &upper.last_descendant(QMAXLEVEL), rank)
        {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        error::ErrorKind,
        partition::{tests::uniform_partition_fixture, PartitionCounts},
        types::{octant::octant_len, Gloidx},
    };

    /// Two trees in a row; rank 0 owns tree 0 and the first `split` level 1
    /// octants of tree 1, rank 1 owns the rest.
    fn brick_fixture(split: u64) -> (Partition, Connectivity) {
        let connectivity = Connectivity::brick(2, 1, 1, [false; 3]);
        let counts = PartitionCounts::from_local_counts(&[8 + split as Gloidx, 8 - split as Gloidx])
            .unwrap();
        let positions = vec![
            Position::of(0, &Octant::root()),
            Position::of(1, &Octant::from_morton_index(split, 1).unwrap()),
            Position::sentinel(2),
        ];
        (Partition::new(0, 2, counts, positions).unwrap(), connectivity)
    }

    #[test]
    fn test_tree_info_split_tree() {
        let (partition, connectivity) = brick_fixture(4);

        let info = tree_info(&partition, &connectivity, 0, Some((0, 1)), 1).unwrap();
        assert_eq!(info.full_tree, [true, false]);
        assert_eq!(info.tree_contact, [true, false, false, false, false, false]);
        assert_eq!(info.first_octant(), Octant::root().first_descendant(QMAXLEVEL));
        assert_eq!(
            info.next_octant(),
            Some(Octant::from_morton_index(4, 1).unwrap().first_descendant(QMAXLEVEL))
        );

        let info = tree_info(&partition, &connectivity, 1, Some((1, 1)), 1).unwrap();
        assert_eq!(info.full_tree, [false, true]);
        assert_eq!(info.next, Position::sentinel(2));
        assert_eq!(info.next_octant(), None);
    }

    #[test]
    fn test_tree_info_rejects_full_and_foreign_trees() {
        let (partition, connectivity) = brick_fixture(4);

        assert!(tree_info(&partition, &connectivity, 0, Some((0, 1)), 0).is_err());
        assert!(tree_info(&partition, &connectivity, 1, Some((1, 1)), 0).is_err());
        assert!(tree_info(&partition, &connectivity, 1, None, 1).is_err());
        assert!(tree_info(&partition, &connectivity, 0, Some((0, 1)), 2).is_err());
    }

    #[test]
    fn test_fully_owned_interior_and_contact() {
        let (partition, connectivity) = brick_fixture(4);
        let info = TreeInfo::fully_owned(&partition, &connectivity, 0, 0).unwrap();
        assert_eq!(info.first, Position::of(0, &Octant::root()));
        assert_eq!(info.next_octant(), None);

        let h = octant_len(2);
        let interior = Octant::new(h, h, h, 2);
        assert_eq!(neighborhood_owned(&partition, 0, &info, &interior), Ok(true));

        // The +x face of tree 0 is glued to tree 1.
        let on_plus_x = Octant::new(ROOT_LEN - h, h, h, 2);
        assert_eq!(neighborhood_owned(&partition, 0, &info, &on_plus_x), Ok(false));

        // The -x face is a domain boundary.
        let on_minus_x = Octant::new(0, h, h, 2);
        assert_eq!(neighborhood_owned(&partition, 0, &info, &on_minus_x), Ok(true));
    }

    #[test]
    fn test_fully_owned_needs_the_whole_tree() {
        let (partition, connectivity) = brick_fixture(4);

        // Rank 1 owns nothing in tree 0 and only half of tree 1.
        assert_eq!(
            TreeInfo::fully_owned(&partition, &connectivity, 1, 0).map_err(|e| e.kind()),
            Err(ErrorKind::PreconditionViolation)
        );
        assert!(TreeInfo::fully_owned(&partition, &connectivity, 1, 1).is_err());
        assert!(TreeInfo::fully_owned(&partition, &connectivity, 0, 1).is_err());
        assert!(TreeInfo::fully_owned(&partition, &connectivity, 2, 0).is_err());

        assert_eq!(owns_tree(&partition, 0, 0), Ok(true));
        assert_eq!(owns_tree(&partition, 0, 1), Ok(false));
        assert_eq!(owns_tree(&partition, 1, 0), Ok(false));
    }

    #[test]
    fn test_claimed_full_ownership_is_checked() {
        let (partition, connectivity) = brick_fixture(4);
        let mut info = TreeInfo::fully_owned(&partition, &connectivity, 0, 0).unwrap();

        let h = octant_len(2);
        let interior = Octant::new(h, h, h, 2);
        assert_eq!(neighborhood_owned(&partition, 0, &info, &interior), Ok(true));

        // The same summary handed to a rank that owns nothing in the tree.
        assert_eq!(neighborhood_owned(&partition, 1, &info, &interior), Ok(false));

        info.full_tree = [true, true];
        info.tree = 1;
        let in_tree_1 = Octant::new(h, h, h, 2);
        assert_eq!(neighborhood_owned(&partition, 1, &info, &in_tree_1), Ok(false));
    }

    #[test]
    fn test_neighborhood_owned_partial_tree() {
        // Rank 0 owns the first half of a level 2 refinement, rank 1 the second.
        let partition = uniform_partition_fixture(2, &[32, 32]);
        let connectivity = Connectivity::unit_cube();
        let info = tree_info(&partition, &connectivity, 0, Some((0, 0)), 0).unwrap();
        assert_eq!(info.full_tree, [true, false]);

        // Centered in the lower half, the full neighbourhood stays below z = ROOT_LEN / 2.
        let q = Octant::new(octant_len(3), octant_len(3), octant_len(3), 3);
        assert_eq!(neighborhood_owned(&partition, 0, &info, &q), Ok(true));

        // Touching the partition boundary from below.
        let q = Octant::new(octant_len(3), octant_len(3), 3 * octant_len(3), 3);
        assert_eq!(neighborhood_owned(&partition, 0, &info, &q), Ok(false));

        // On the domain boundary the answer is conservatively false.
        let q = Octant::new(0, octant_len(3), octant_len(3), 3);
        assert_eq!(neighborhood_owned(&partition, 0, &info, &q), Ok(false));
    }

    #[test]
    fn test_true_answers_are_exact() {
        let partition = uniform_partition_fixture(2, &[20, 27, 17]);
        let connectivity = Connectivity::unit_cube();
        let level = 3;
        let qh = octant_len(level);

        for rank in 0..3 {
            let info = tree_info(&partition, &connectivity, rank, Some((0, 0)), 0).unwrap();

            for index in 0..(1u64 << (3 * level)) {
                let q = Octant::from_morton_index(index, level).unwrap();
                if !neighborhood_owned(&partition, rank, &info, &q).unwrap() {
                    continue;
                }

                for dz in -1..=1 {
                    for dy in -1..=1 {
                        for dx in -1..=1 {
                            let n = Octant::new(q.x + dx * qh, q.y + dy * qh, q.z + dz * qh, level);
                            if n.is_inside_root() {
                                assert!(partition.is_owner(0, &n, rank).unwrap());
                            }
                        }
                    }
                }
            }
        }
    }
}
