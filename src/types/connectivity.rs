//! Face topology of the trees in a forest.
//!
//! Faces are numbered `-x, +x, -y, +y, -z, +z`. A face that is not glued to
//! anything points back to its own tree and face.

use serde::{Deserialize, Serialize};

use crate::{
    constants::FACES,
    error::{ForestError, Result},
    types::TreeId,
};

/// Serialized form of a [`Connectivity`]: the two face tables, validated on the
/// way in.
#[derive(Serialize, Deserialize)]
struct FaceTables {
    tree_to_tree: Vec<TreeId>,
    tree_to_face: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FaceTables", into = "FaceTables")]
pub struct Connectivity {
    num_trees: TreeId,
    /// Neighbouring tree across each face, `FACES` entries per tree.
    tree_to_tree: Vec<TreeId>,
    /// Neighbouring face across each face, encoded as `face + FACES * orientation`.
    tree_to_face: Vec<u8>,
}

impl TryFrom<FaceTables> for Connectivity {
    type Error = ForestError;

    fn try_from(tables: FaceTables) -> Result<Self> {
        Connectivity::new(tables.tree_to_tree, tables.tree_to_face)
    }
}

impl From<Connectivity> for FaceTables {
    fn from(connectivity: Connectivity) -> Self {
        FaceTables {
            tree_to_tree: connectivity.tree_to_tree,
            tree_to_face: connectivity.tree_to_face,
        }
    }
}

impl Connectivity {
    /// Build a connectivity from raw face tables.
    pub fn new(tree_to_tree: Vec<TreeId>, tree_to_face: Vec<u8>) -> Result<Self> {
        if tree_to_tree.len() % FACES != 0 || tree_to_tree.len() != tree_to_face.len() {
            return Err(ForestError::precondition(format!(
                "face tables of length {} and {} do not describe whole trees",
                tree_to_tree.len(),
                tree_to_face.len()
            )));
        }

        let num_trees = (tree_to_tree.len() / FACES) as TreeId;

        if let Some(bad) = tree_to_tree.iter().find(|&&t| t < 0 || t >= num_trees) {
            return Err(ForestError::precondition(format!(
                "tree_to_tree references tree {} outside 0..{}",
                bad, num_trees
            )));
        }

        if let Some(bad) = tree_to_face.iter().find(|&&f| f as usize >= 4 * FACES) {
            return Err(ForestError::precondition(format!(
                "tree_to_face entry {} is not a face/orientation code",
                bad
            )));
        }

        Ok(Connectivity {
            num_trees,
            tree_to_tree,
            tree_to_face,
        })
    }

    /// A single tree with no glued faces.
    pub fn unit_cube() -> Self {
        Connectivity::brick(1, 1, 1, [false; 3])
    }

    /// An `nx * ny * nz` arrangement of trees, ordered x fastest, optionally
    /// periodic along each axis.
    pub fn brick(nx: TreeId, ny: TreeId, nz: TreeId, periodic: [bool; 3]) -> Self {
        let dims = [nx.max(1), ny.max(1), nz.max(1)];
        let num_trees = dims[0] * dims[1] * dims[2];

        let mut tree_to_tree = Vec::with_capacity(FACES * num_trees as usize);
        let mut tree_to_face = Vec::with_capacity(FACES * num_trees as usize);

        for tree in 0..num_trees {
            let coords = [
                tree % dims[0],
                (tree / dims[0]) % dims[1],
                tree / (dims[0] * dims[1]),
            ];

            for face in 0..FACES {
                let dim = face / 2;
                let step = if face % 2 == 0 { -1 } else { 1 };

                let mut neighbour = coords;
                neighbour[dim] += step;

                let inside = (0..dims[dim]).contains(&neighbour[dim]);
                if !inside && periodic[dim] {
                    neighbour[dim] = neighbour[dim].rem_euclid(dims[dim]);
                }

                if inside || periodic[dim] {
                    tree_to_tree.push(neighbour[0] + dims[0] * (neighbour[1] + dims[1] * neighbour[2]));
                    tree_to_face.push((face ^ 1) as u8);
                } else {
                    tree_to_tree.push(tree);
                    tree_to_face.push(face as u8);
                }
            }
        }

        Connectivity {
            num_trees,
            tree_to_tree,
            tree_to_face,
        }
    }

    pub fn num_trees(&self) -> TreeId {
        self.num_trees
    }

    /// Tree and face across `face` of `tree`.
    pub fn face_neighbour(&self, tree: TreeId, face: usize) -> Result<(TreeId, usize)> {
        self.check_tree(tree)?;
        if face >= FACES {
            return Err(ForestError::precondition(format!(
                "face {} outside 0..{}",
                face, FACES
            )));
        }

        let index = FACES * tree as usize + face;
        Ok((
            self.tree_to_tree[index],
            self.tree_to_face[index] as usize % FACES,
        ))
    }

    /// True if something lies across `face` of `tree`, including the tree itself
    /// through a different face (periodicity).
    pub fn has_contact(&self, tree: TreeId, face: usize) -> Result<bool> {
        let (neighbour, neighbour_face) = self.face_neighbour(tree, face)?;
        Ok(neighbour != tree || neighbour_face != face)
    }

    pub(crate) fn check_tree(&self, tree: TreeId) -> Result<()> {
        if tree < 0 || tree >= self.num_trees {
            return Err(ForestError::precondition(format!(
                "tree {} outside 0..{}",
                tree, self.num_trees
            )));
        }
        Ok(())
    }
}
