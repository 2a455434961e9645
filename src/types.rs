//! Definition of basic types

pub mod connectivity;
pub mod octant;

/// Index of a tree in the forest's connectivity.
pub type TreeId = i32;

/// Integer coordinate of an octant inside its tree.
pub type Coord = i32;

/// Process local octant count or index.
pub type Locidx = i32;

/// Global octant count or index.
pub type Gloidx = i64;

/// Message tag for point to point transfers.
pub type Tag = i32;
