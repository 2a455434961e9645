//! Crate wide constants
use crate::types::{Coord, Tag};

/// Deepest level an octant coordinate can describe.
pub const MAXLEVEL: i8 = 19;

/// Deepest level an octant in a forest may have. Partition positions live here.
pub const QMAXLEVEL: i8 = 18;

/// Side length of a tree's root octant in integer coordinates.
pub const ROOT_LEN: Coord = 1 << MAXLEVEL;

/// Number of faces of an octree.
pub const FACES: usize = 6;

/// Tag used by the transfer routines when the caller has no preference.
pub const DEFAULT_TRANSFER_TAG: Tag = 214;
