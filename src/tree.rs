//! Full node tree
//!
//! The complete KD tree built offline over the whole dataset. Immutable for
//! the lifetime of a session and shared behind an `Arc`.

use crate::bounds::Aabb;
use crate::error::{LodError, LodResult};
use crate::node::{decode_nodes, encode_nodes, is_leaf, NodeRecord};

/// Immutable full tree: node records, global cell-index buffer and the extent box
#[derive(Debug, Clone)]
pub struct FullTree {
    nodes: Vec<NodeRecord>,
    cells: Vec<u32>,
    extent: Aabb,
}

impl FullTree {
    /// Build from decoded records. Child pointers and leaf cell ranges are checked once here.
    pub fn new(nodes: Vec<NodeRecord>, cells: Vec<u32>, extent: Aabb) -> LodResult<Self> {
        if nodes.is_empty() {
            return Err(LodError::InvalidTree {
                reason: "full tree has no root".to_string(),
            });
        }

        let count = nodes.len() as u64;
        for (index, node) in nodes.iter().enumerate() {
            if is_leaf(node) {
                let end = node.left_ptr as u64 + node.cell_count as u64;
                if end > cells.len() as u64 {
                    return Err(LodError::InvalidTree {
                        reason: format!(
                            "leaf {} addresses cells {}..{} past buffer of {}",
                            index,
                            node.left_ptr,
                            end,
                            cells.len()
                        ),
                    });
                }
            } else if node.left_ptr == 0
                || node.left_ptr as u64 >= count
                || node.right_ptr as u64 >= count
            {
                return Err(LodError::InvalidTree {
                    reason: format!(
                        "branch {} has child pointers {}/{} outside 1..{}",
                        index, node.left_ptr, node.right_ptr, count
                    ),
                });
            }
        }

        Ok(Self {
            nodes,
            cells,
            extent,
        })
    }

    /// Build from a flat buffer of 20 byte node records
    pub fn from_bytes(node_bytes: &[u8], cells: Vec<u32>, extent: Aabb) -> LodResult<Self> {
        Self::new(decode_nodes(node_bytes)?, cells, extent)
    }

    pub fn node(&self, index: u32) -> LodResult<&NodeRecord> {
        self.nodes
            .get(index as usize)
            .ok_or(LodError::SlotOutOfRange {
                slot: index as usize,
                slot_count: self.nodes.len(),
            })
    }

    /// True leaves have no children in the full tree
    pub fn is_true_leaf(&self, index: u32) -> LodResult<bool> {
        Ok(is_leaf(self.node(index)?))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    pub fn cells(&self) -> &[u32] {
        &self.cells
    }

    /// Cell ids owned by a true leaf
    pub fn leaf_cells(&self, index: u32) -> LodResult<&[u32]> {
        let node = self.node(index)?;
        if !is_leaf(node) {
            return Err(LodError::InvalidTree {
                reason: format!("node {} is a branch and owns no cells", index),
            });
        }
        let start = node.left_ptr as usize;
        Ok(&self.cells[start..start + node.cell_count as usize])
    }

    pub fn extent(&self) -> &Aabb {
        &self.extent
    }

    /// Encoded node buffer, as handed to a renderer in full-resolution mode
    pub fn node_bytes(&self) -> Vec<u8> {
        encode_nodes(&self.nodes)
    }

    /// Indices of all true leaves
    pub fn leaf_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| is_leaf(n))
            .map(|(i, _)| i as u32)
    }

    /// Largest cell count of any leaf
    pub fn max_leaf_cells(&self) -> u32 {
        self.nodes
            .iter()
            .filter(|n| is_leaf(n))
            .map(|n| n.cell_count)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::create_aabb;
    use crate::test_fixtures::balanced_tree;
    use glam::Vec3;

    #[test]
    fn test_balanced_tree_shape() {
        let tree = balanced_tree(3, 2);
        assert_eq!(tree.len(), 15);
        assert_eq!(tree.leaf_indices().count(), 8);
        assert!(!tree.is_true_leaf(0).unwrap());
        assert_eq!(tree.max_leaf_cells(), 2);
    }

    #[test]
    fn test_bytes_round_trip() {
        let tree = balanced_tree(2, 1);
        let rebuilt = FullTree::from_bytes(&tree.node_bytes(), tree.cells().to_vec(), *tree.extent())
            .expect("Failed to rebuild tree");
        assert_eq!(rebuilt.nodes(), tree.nodes());
    }

    #[test]
    fn test_rejects_dangling_child() {
        let nodes = vec![NodeRecord {
            split_val: 0.5,
            cell_count: 0,
            parent_ptr: 0,
            left_ptr: 1,
            right_ptr: 2,
        }];
        let extent = create_aabb(Vec3::ZERO, Vec3::ONE);
        assert!(matches!(
            FullTree::new(nodes, vec![], extent),
            Err(LodError::InvalidTree { .. })
        ));
    }

    #[test]
    fn test_rejects_leaf_past_cells() {
        let nodes = vec![NodeRecord {
            cell_count: 4,
            ..Default::default()
        }];
        let extent = create_aabb(Vec3::ZERO, Vec3::ONE);
        assert!(FullTree::new(nodes, vec![0, 1], extent).is_err());
    }
}
