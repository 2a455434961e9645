//! Ownership queries against a published [`Partition`].
//!
//! All queries are local reads of the replicated tables. A process `p` owns the
//! right-open range `[global_first_position[p], global_first_position[p + 1])`,
//! so an octant anchored exactly at a process boundary belongs to the later process.

use mpi::topology::Rank;

use crate::{
    error::{ForestError, Result},
    partition::Partition,
    types::{
        octant::{Octant, Position},
        Gloidx, TreeId,
    },
};

/// Index `p` with `bounds[p] <= target < bounds[p + 1]`, searching from `guess`.
///
/// `bounds` must be non-decreasing with `bounds[0] <= target < bounds[last]`.
/// The neighbours of `guess` are tried before the search falls back to
/// bisection, so a correct or adjacent guess costs O(1).
pub(crate) fn guided_search<T: Ord>(bounds: &[T], target: &T, guess: usize) -> Option<usize> {
    let num_intervals = bounds.len().checked_sub(1)?;
    if num_intervals == 0 || guess >= num_intervals {
        return None;
    }
    if *target < bounds[0] || *target >= bounds[num_intervals] {
        return None;
    }

    let mut low = 0;
    let mut high = num_intervals - 1;
    let mut guess = guess;
    let mut first_miss = true;

    loop {
        if low > high {
            return None;
        }

        if *target < bounds[guess] {
            high = guess - 1;
            guess = if first_miss {
                guess - 1
            } else {
                (low + high + 1) / 2
            };
        } else if *target >= bounds[guess + 1] {
            low = guess + 1;
            guess = if first_miss { guess + 1 } else { (low + high) / 2 };
        } else {
            return Some(guess);
        }

        first_miss = false;
    }
}

impl Partition {
    /// True if process `p` owns no octants.
    pub fn is_empty(&self, p: Rank) -> Result<bool> {
        self.check_rank(p)?;
        let gfp = self.global_first_position();
        Ok(gfp[p as usize] == gfp[p as usize + 1])
    }

    /// Emptiness read off the count table; agrees with [`Partition::is_empty`].
    pub fn is_empty_by_count(&self, p: Rank) -> Result<bool> {
        Ok(self.local_count(p)? == 0)
    }

    /// True if `q` in `tree` lies in the range owned by process `p`.
    ///
    /// Only the anchor of `q` is examined, so `q` may be coarser than the
    /// partition boundary it straddles.
    pub fn is_owner(&self, tree: TreeId, q: &Octant, p: Rank) -> Result<bool> {
        self.check_rank(p)?;
        self.check_octant(tree, q)?;
        Ok(self.owns(tree, q, p))
    }

    pub(crate) fn owns(&self, tree: TreeId, q: &Octant, p: Rank) -> bool {
        let target = Position::of(tree, q);
        let gfp = self.global_first_position();
        gfp[p as usize] <= target && target < gfp[p as usize + 1]
    }

    /// The unique process whose range contains the anchor of `q` in `tree`.
    ///
    /// Empty processes are never returned.
    pub fn find_owner(&self, tree: TreeId, q: &Octant, guess: Rank) -> Result<Rank> {
        self.check_rank(guess)?;
        self.check_octant(tree, q)?;

        let target = Position::of(tree, q);
        let gfp = self.global_first_position();

        if target < gfp[0] {
            return Err(ForestError::precondition(format!(
                "{:?} in tree {} precedes the first owned position {:?}",
                q, tree, gfp[0]
            )));
        }

        guided_search(gfp, &target, guess as usize)
            .map(|p| p as Rank)
            .ok_or_else(|| {
                ForestError::invariant(format!(
                    "no owner found for {:?} in tree {}",
                    q, tree
                ))
            })
    }

    /// The process owning the octant with global index `gidx`.
    pub fn find_owner_index(&self, gidx: Gloidx, guess: Rank) -> Result<Rank> {
        self.check_rank(guess)?;

        if gidx < 0 || gidx >= self.global_count() {
            return Err(ForestError::precondition(format!(
                "global index {} outside 0..{}",
                gidx,
                self.global_count()
            )));
        }

        guided_search(self.global_first_count(), &gidx, guess as usize)
            .map(|p| p as Rank)
            .ok_or_else(|| ForestError::invariant(format!("no owner found for index {}", gidx)))
    }

    fn check_octant(&self, tree: TreeId, q: &Octant) -> Result<()> {
        if tree < 0 || tree >= self.num_trees() {
            return Err(ForestError::precondition(format!(
                "tree {} outside 0..{}",
                tree,
                self.num_trees()
            )));
        }
        if !q.is_valid() {
            return Err(ForestError::precondition(format!("{:?} is not a valid octant", q)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    use crate::{
        constants::QMAXLEVEL,
        partition::{tests::uniform_partition_fixture, PartitionCounts},
        types::octant::octant_len,
    };

    fn linear_owner(partition: &Partition, target: &Position) -> Rank {
        let gfp = partition.global_first_position();
        (0..partition.num_procs())
            .find(|&p| gfp[p as usize] <= *target && *target < gfp[p as usize + 1])
            .unwrap()
    }

    #[test]
    fn test_guided_search_bounds() {
        let bounds = [0, 3, 7, 10];
        assert_eq!(guided_search(&bounds, &5, 0), Some(1));
        assert_eq!(guided_search(&bounds, &0, 2), Some(0));
        assert_eq!(guided_search(&bounds, &9, 0), Some(2));
        assert_eq!(guided_search(&bounds, &10, 0), None);
        assert_eq!(guided_search(&bounds, &-1, 0), None);
        assert_eq!(guided_search(&bounds, &1, 3), None);
        assert_eq!(guided_search::<i64>(&[0], &0, 0), None);
    }

    #[test]
    fn test_find_owner_index_any_guess() {
        let partition = uniform_partition_fixture(1, &[3, 4, 1]);
        for guess in 0..3 {
            assert_eq!(partition.find_owner_index(5, guess), Ok(1));
            assert_eq!(partition.find_owner_index(0, guess), Ok(0));
            assert_eq!(partition.find_owner_index(7, guess), Ok(2));
        }
        assert!(partition.find_owner_index(8, 0).is_err());
        assert!(partition.find_owner_index(0, 3).is_err());
    }

    #[test]
    fn test_empty_processes() {
        let partition = uniform_partition_fixture(1, &[0, 4, 0, 4]);

        let empty: Vec<bool> = (0..4).map(|p| partition.is_empty(p).unwrap()).collect();
        assert_eq!(empty, vec![true, false, true, false]);

        for p in 0..4 {
            assert_eq!(partition.is_empty(p), partition.is_empty_by_count(p));
        }

        // No octant, and no guess, ever lands on an empty process.
        for index in 0..8 {
            let q = Octant::from_morton_index(index, 1).unwrap();
            for guess in 0..4 {
                let owner = partition.find_owner(0, &q, guess).unwrap();
                assert!(!partition.is_empty(owner).unwrap());
                assert_eq!(owner, if index < 4 { 1 } else { 3 });
            }
        }
    }

    #[test]
    fn test_boundary_octant_belongs_to_later_process() {
        let partition = uniform_partition_fixture(1, &[3, 5]);
        let boundary = Octant::from_morton_index(3, 1).unwrap();

        assert!(!partition.is_owner(0, &boundary, 0).unwrap());
        assert!(partition.is_owner(0, &boundary, 1).unwrap());
        assert_eq!(partition.find_owner(0, &boundary, 0), Ok(1));

        // The last finest octant before the boundary stays with process 0.
        let before = Octant::from_morton_index(2, 1).unwrap().last_descendant(QMAXLEVEL);
        assert_eq!(partition.find_owner(0, &before, 1), Ok(0));
    }

    #[test]
    fn test_coarse_octant_owned_by_anchor() {
        // Process 1 starts in the middle of the first level 1 octant.
        let counts = PartitionCounts::from_local_counts(&[1, 63]).unwrap();
        let positions = vec![
            Position::of(0, &Octant::root()),
            Position::of(0, &Octant::new(octant_len(2), 0, 0, 2)),
            Position::sentinel(1),
        ];
        let partition = Partition::new(0, 1, counts, positions).unwrap();

        let coarse = Octant::new(0, 0, 0, 1);
        assert_eq!(partition.find_owner(0, &coarse, 1), Ok(0));
        assert!(partition.is_owner(0, &coarse, 0).unwrap());
    }

    #[test]
    fn test_invalid_queries() {
        let partition = uniform_partition_fixture(1, &[4, 4]);
        let q = Octant::root();

        assert!(partition.is_empty(-1).is_err());
        assert!(partition.is_empty(2).is_err());
        assert!(partition.is_owner(1, &q, 0).is_err());
        assert!(partition.find_owner(0, &Octant::new(1, 0, 0, 1), 0).is_err());
        assert!(partition.find_owner(0, &q, 5).is_err());
    }

    proptest! {
        #[test]
        fn find_owner_matches_linear_scan(
            local_counts in proptest::collection::vec(0i64..20, 1..9),
            index in 0u64..512,
        ) {
            let total: i64 = local_counts.iter().sum();
            prop_assume!(total > 0);

            // Scale the counts so that they cut a level 3 refinement of 512 octants.
            let mut scaled: Vec<i64> = local_counts.iter().map(|c| c * 512 / total).collect();
            let assigned: i64 = scaled.iter().sum();
            let last = scaled.len() - 1;
            scaled[last] += 512 - assigned;

            let partition = uniform_partition_fixture(3, &scaled);
            let q = Octant::from_morton_index(index, 3).unwrap();
            let expected = linear_owner(&partition, &Position::of(0, &q));

            for guess in 0..partition.num_procs() {
                prop_assert_eq!(partition.find_owner(0, &q, guess), Ok(expected));
                prop_assert_eq!(partition.find_owner_index(index as i64, guess), Ok(expected));
            }
        }
    }
}
