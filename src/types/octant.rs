//! Octants and partition positions, ordered along the Morton curve.
//!
//! Coordinates are integers in `[0, ROOT_LEN)` per dimension. Within a level the
//! interleaving puts `x` in the lowest bit, then `y`, then `z`, so `z` is the most
//! significant direction. An octant sorts before all of its descendants.

use std::cmp::Ordering;

use memoffset::offset_of;
use mpi::{
    datatype::{Equivalence, UncommittedUserDatatype, UserDatatype},
    Address,
};
use crate::{
    constants::{MAXLEVEL, QMAXLEVEL, ROOT_LEN},
    error::{ForestError, Result},
    types::{Coord, TreeId},
};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
/// A leaf cell of a tree, described by its anchor (lower left front corner) and level.
pub struct Octant {
    pub x: Coord,
    pub y: Coord,
    pub z: Coord,
    pub level: i8,
}

/// Side length of an octant at `level`, which must lie in `0..=MAXLEVEL`.
pub(crate) fn octant_len(level: i8) -> Coord {
    1 << (MAXLEVEL - level)
}

/// Returns true if the most significant bit of `y` is above that of `x`.
///
/// # Example:
/// If x = 3 and y = 4 the bit representations are x = 0b011 and y = 0b100,
/// the function returns true. For x = 5 and y = 4 it returns false.
fn y_has_most_significant_bit(x: u32, y: u32) -> bool {
    (x < y) & (x < (x ^ y))
}

/// Compare two anchors along the Morton curve, ignoring levels.
pub(crate) fn anchor_cmp(a: &[Coord; 3], b: &[Coord; 3]) -> Ordering {
    let xor = [
        (a[0] ^ b[0]) as u32,
        (a[1] ^ b[1]) as u32,
        (a[2] ^ b[2]) as u32,
    ];

    if xor == [0, 0, 0] {
        return Ordering::Equal;
    }

    // Ties between dimensions go to the more significant one.
    let mut argmax = 0;
    for dim in 1..3 {
        if !y_has_most_significant_bit(xor[dim], xor[argmax]) {
            argmax = dim;
        }
    }

    a[argmax].cmp(&b[argmax])
}

impl Octant {
    pub fn new(x: Coord, y: Coord, z: Coord, level: i8) -> Self {
        Octant { x, y, z, level }
    }

    /// The root octant of a tree.
    pub fn root() -> Self {
        Octant::new(0, 0, 0, 0)
    }

    /// Return the anchor
    pub fn anchor(&self) -> [Coord; 3] {
        [self.x, self.y, self.z]
    }

    /// Side length of this octant. The level must already be checked.
    pub(crate) fn len(&self) -> Coord {
        octant_len(self.level)
    }

    /// True if the anchor lies inside the root octant.
    pub fn is_inside_root(&self) -> bool {
        self.anchor().iter().all(|&c| (0..ROOT_LEN).contains(&c))
    }

    /// True if this is a legal forest octant: inside the root, at most at
    /// `QMAXLEVEL` and aligned to its own size.
    pub fn is_valid(&self) -> bool {
        if self.level < 0 || self.level > QMAXLEVEL || !self.is_inside_root() {
            return false;
        }
        let mask = self.len() - 1;
        self.anchor().iter().all(|&c| c & mask == 0)
    }

    /// First descendant at `level`, shares the anchor.
    pub(crate) fn first_descendant(&self, level: i8) -> Self {
        Octant::new(self.x, self.y, self.z, level)
    }

    /// Last descendant at `level`, no coarser than this octant.
    pub(crate) fn last_descendant(&self, level: i8) -> Self {
        let shift = self.len() - octant_len(level);
        Octant::new(self.x + shift, self.y + shift, self.z + shift, level)
    }

    /// Position of this octant in a uniform refinement of its tree at its own level.
    pub fn morton_index(&self) -> Result<u64> {
        if !self.is_valid() {
            return Err(ForestError::precondition(format!(
                "{:?} is not a valid octant",
                self
            )));
        }

        let shift = MAXLEVEL - self.level;
        let x = (self.x >> shift) as u64;
        let y = (self.y >> shift) as u64;
        let z = (self.z >> shift) as u64;

        let mut index: u64 = 0;
        for bit in 0..self.level as u64 {
            index |= ((x >> bit) & 1) << (3 * bit);
            index |= ((y >> bit) & 1) << (3 * bit + 1);
            index |= ((z >> bit) & 1) << (3 * bit + 2);
        }
        Ok(index)
    }

    /// The `index`-th octant of a uniform refinement of a tree at `level`.
    pub fn from_morton_index(index: u64, level: i8) -> Result<Self> {
        if !(0..=QMAXLEVEL).contains(&level) {
            return Err(ForestError::precondition(format!(
                "level {} outside 0..={}",
                level, QMAXLEVEL
            )));
        }
        if index >> (3 * level as u32) != 0 {
            return Err(ForestError::precondition(format!(
                "index {} outside a level {} refinement",
                index, level
            )));
        }

        let mut anchor: [u64; 3] = [0; 3];
        for bit in 0..level as u64 {
            for (dim, a) in anchor.iter_mut().enumerate() {
                *a |= ((index >> (3 * bit + dim as u64)) & 1) << bit;
            }
        }

        let shift = MAXLEVEL - level;
        Ok(Octant::new(
            (anchor[0] as Coord) << shift,
            (anchor[1] as Coord) << shift,
            (anchor[2] as Coord) << shift,
            level,
        ))
    }
}

impl Ord for Octant {
    fn cmp(&self, other: &Self) -> Ordering {
        // If anchors match, the one at the coarser level comes first.
        anchor_cmp(&self.anchor(), &other.anchor()).then(self.level.cmp(&other.level))
    }
}

impl PartialOrd for Octant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
/// One entry of the global position table: the tree and the anchor of the first
/// finest-level octant owned by a process.
pub struct Position {
    pub tree: TreeId,
    pub x: Coord,
    pub y: Coord,
    pub z: Coord,
}

unsafe impl Equivalence for Position {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::structured(
            &[1, 1, 1, 1],
            &[
                offset_of!(Position, tree) as Address,
                offset_of!(Position, x) as Address,
                offset_of!(Position, y) as Address,
                offset_of!(Position, z) as Address,
            ],
            &[
                UncommittedUserDatatype::contiguous(1, &TreeId::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &Coord::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &Coord::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &Coord::equivalent_datatype()).as_ref(),
            ],
        )
    }
}

impl Position {
    /// Position of the first finest descendant of `octant` in `tree`.
    pub fn of(tree: TreeId, octant: &Octant) -> Self {
        Position {
            tree,
            x: octant.x,
            y: octant.y,
            z: octant.z,
        }
    }

    /// One-past-the-end entry for a forest with `num_trees` trees.
    pub fn sentinel(num_trees: TreeId) -> Self {
        Position {
            tree: num_trees,
            x: 0,
            y: 0,
            z: 0,
        }
    }

    /// Contribution of a process that owns no octants.
    pub fn empty_marker() -> Self {
        Position {
            tree: -1,
            x: -1,
            y: -1,
            z: -1,
        }
    }

    pub fn is_empty_marker(&self) -> bool {
        self.tree < 0
    }

    pub fn anchor(&self) -> [Coord; 3] {
        [self.x, self.y, self.z]
    }

    /// The position as an octant on the finest forest level.
    pub fn to_octant(&self) -> Octant {
        Octant::new(self.x, self.y, self.z, QMAXLEVEL)
    }

    /// True if the position sits at the very beginning of its tree.
    pub fn is_tree_start(&self) -> bool {
        self.anchor() == [0, 0, 0]
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tree
            .cmp(&other.tree)
            .then_with(|| anchor_cmp(&self.anchor(), &other.anchor()))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use itertools::Itertools;

    #[test]
    fn test_y_has_most_significant_bit() {
        assert!(y_has_most_significant_bit(3, 4));
        assert!(!y_has_most_significant_bit(5, 4));
        assert!(!y_has_most_significant_bit(4, 5));
        assert!(y_has_most_significant_bit(0, 1));
    }

    #[test]
    fn test_uniform_refinement_is_sorted() {
        for level in 0..4 {
            let octants = (0..(1u64 << (3 * level)))
                .map(|i| Octant::from_morton_index(i, level).unwrap())
                .collect_vec();

            for (a, b) in octants.iter().tuple_windows() {
                assert!(a < b);
            }

            for (i, octant) in octants.iter().enumerate() {
                assert!(octant.is_valid());
                assert_eq!(octant.morton_index(), Ok(i as u64));
            }
        }
    }

    #[test]
    fn test_morton_index_rejects_bad_input() {
        assert!(Octant::from_morton_index(0, -1).is_err());
        assert!(Octant::from_morton_index(0, QMAXLEVEL + 1).is_err());
        assert!(Octant::from_morton_index(0, MAXLEVEL).is_err());
        assert!(Octant::from_morton_index(8, 1).is_err());
        assert!(Octant::from_morton_index(u64::MAX, 2).is_err());
        assert_eq!(Octant::from_morton_index(7, 1).map(|q| q.level), Ok(1));

        assert!(Octant::new(0, 0, 0, -3).morton_index().is_err());
        assert!(Octant::new(0, 0, 0, 100).morton_index().is_err());
        assert!(Octant::new(1, 0, 0, 1).morton_index().is_err());
    }

    #[test]
    fn test_z_is_most_significant() {
        let h = octant_len(1);
        let x = Octant::new(h, 0, 0, 1);
        let y = Octant::new(0, h, 0, 1);
        let z = Octant::new(0, 0, h, 1);

        assert!(x < y);
        assert!(y < z);
        assert!(Octant::new(h, h, 0, 1) < z);
    }

    #[test]
    fn test_ancestor_sorts_first() {
        let parent = Octant::new(0, 0, octant_len(1), 1);
        let first = parent.first_descendant(QMAXLEVEL);
        let last = parent.last_descendant(QMAXLEVEL);

        assert!(parent < first);
        assert!(first < last);
        assert_eq!(anchor_cmp(&parent.anchor(), &first.anchor()), Ordering::Equal);

        // The last descendant of an octant precedes its next sibling.
        let sibling = Octant::new(octant_len(1), 0, octant_len(1), 1);
        assert!(last < sibling);
    }

    #[test]
    fn test_is_valid() {
        assert!(Octant::root().is_valid());
        assert!(!Octant::new(1, 0, 0, 1).is_valid());
        assert!(!Octant::new(-octant_len(1), 0, 0, 1).is_valid());
        assert!(!Octant::new(0, 0, 0, MAXLEVEL).is_valid());
        assert!(Octant::new(0, 0, 0, QMAXLEVEL).is_valid());
    }

    #[test]
    fn test_position_order() {
        let a = Position::of(0, &Octant::new(0, 0, octant_len(1), 1));
        let b = Position::of(1, &Octant::root());
        let c = Position::sentinel(2);

        assert!(a < b);
        assert!(b < c);
        assert!(Position::of(1, &Octant::root()).is_tree_start());

        // Level does not enter the position order.
        let coarse = Position::of(0, &Octant::new(0, 0, 0, 1));
        let fine = Position::of(0, &Octant::new(0, 0, 0, QMAXLEVEL));
        assert_eq!(coarse, fine);
    }

    #[test]
    fn test_empty_marker() {
        assert!(Position::empty_marker().is_empty_marker());
        assert!(!Position::sentinel(3).is_empty_marker());
    }
}
