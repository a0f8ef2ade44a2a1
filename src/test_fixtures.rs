//! Small full trees and tetrahedral datasets for unit tests

use crate::bounds::{aabb_corners, create_aabb, midpoint_split, split_box, split_dimension, Aabb};
use crate::mesh::{InMemoryBlockSource, MeshBlockSizes, SourceBlock};
use crate::node::NodeRecord;
use crate::tree::FullTree;
use glam::Vec3;
use std::collections::VecDeque;

/// Complete KD tree over the unit cube in heap layout (children of `i` at
/// `2i + 1` and `2i + 2`), midpoint splits, `cells_per_leaf` cells per leaf.
pub fn balanced_tree(depth: u32, cells_per_leaf: u32) -> FullTree {
    let node_count = (1usize << (depth + 1)) - 1;
    let first_leaf = (1usize << depth) - 1;
    let extent = create_aabb(Vec3::ZERO, Vec3::ONE);

    let mut nodes = vec![NodeRecord::default(); node_count];
    let mut cells = Vec::new();
    let mut queue = VecDeque::from([(0usize, extent, 0u32)]);

    while let Some((index, bbox, level)) = queue.pop_front() {
        let parent_ptr = if index == 0 { 0 } else { ((index - 1) / 2) as u32 };
        if index >= first_leaf {
            let start = cells.len() as u32;
            cells.extend(start..start + cells_per_leaf);
            nodes[index] = NodeRecord {
                split_val: 0.0,
                cell_count: cells_per_leaf,
                parent_ptr,
                left_ptr: start,
                right_ptr: 0,
            };
            continue;
        }

        let dimension = split_dimension(level);
        let split_val = midpoint_split(&bbox, dimension);
        let (left_box, right_box) = split_box(&bbox, dimension, split_val);
        nodes[index] = NodeRecord {
            split_val,
            cell_count: 0,
            parent_ptr,
            left_ptr: (2 * index + 1) as u32,
            right_ptr: (2 * index + 2) as u32,
        };
        queue.push_back((2 * index + 1, left_box, level + 1));
        queue.push_back((2 * index + 2, right_box, level + 1));
    }

    FullTree::new(nodes, cells, extent).expect("Failed to build fixture tree")
}

/// Box of every node of a tree built by `balanced_tree`
pub fn node_boxes(tree: &FullTree) -> Vec<Aabb> {
    let mut boxes = vec![*tree.extent(); tree.len()];
    let mut stack = vec![(0u32, *tree.extent(), 0u32)];
    while let Some((index, bbox, level)) = stack.pop() {
        boxes[index as usize] = bbox;
        let node = tree.node(index).expect("Failed to read fixture node");
        if node.right_ptr == 0 {
            continue;
        }
        let (left_box, right_box) = split_box(&bbox, split_dimension(level), node.split_val);
        stack.push((node.left_ptr, left_box, level + 1));
        stack.push((node.right_ptr, right_box, level + 1));
    }
    boxes
}

pub fn tet_sizes(cells_per_leaf: u32) -> MeshBlockSizes {
    MeshBlockSizes {
        max_verts: 4 * cells_per_leaf as usize,
        max_cells: cells_per_leaf as usize,
        verts_per_cell: 4,
    }
}

/// One small tetrahedron per cell, placed inside its leaf box. Cells are laid
/// out along x so a midpoint treelet split separates them. The "pressure"
/// scalar is the vertex x coordinate, "density" is the leaf index.
pub fn tet_source(tree: &FullTree) -> InMemoryBlockSource {
    let cells_per_leaf = tree.max_leaf_cells();
    let boxes = node_boxes(tree);
    let mut source = InMemoryBlockSource::new("fixture.vtu", tet_sizes(cells_per_leaf));

    for leaf in tree.leaf_indices() {
        let bbox = boxes[leaf as usize];
        let cell_count = tree.node(leaf).expect("Failed to read leaf").cell_count;
        let size = bbox.max - bbox.min;
        let mut positions = Vec::new();
        let mut connectivity = Vec::new();

        for cell in 0..cell_count {
            let lo = (cell as f32 + 0.1) / cell_count as f32;
            let hi = (cell as f32 + 0.9) / cell_count as f32;
            let cell_box = create_aabb(
                bbox.min + size * Vec3::new(lo, 0.1, 0.1),
                bbox.min + size * Vec3::new(hi, 0.9, 0.9),
            );
            let corners = aabb_corners(&cell_box);
            let base = (positions.len() / 3) as u32;
            for corner in [corners[0], corners[4], corners[2], corners[1]] {
                positions.extend_from_slice(&corner.to_array());
            }
            connectivity.extend(base..base + 4);
        }

        let pressure = positions.chunks_exact(3).map(|p| p[0]).collect();
        let density = vec![leaf as f32; positions.len() / 3];
        source.insert_block(
            leaf,
            SourceBlock {
                positions,
                connectivity,
                scalars: [
                    ("pressure".to_string(), pressure),
                    ("density".to_string(), density),
                ]
                .into_iter()
                .collect(),
            },
        );
    }
    source
}
