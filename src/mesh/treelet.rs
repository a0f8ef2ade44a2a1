//! Treelet generation
//!
//! Subdivides one block's cells into a fixed-depth KD tree with the same
//! midpoint, cycling-axis splits as the outer tree. The treelet root is not
//! stored: its split value goes onto the owning dynamic node, which then
//! points straight at the two top children.

use super::mesh_block_data::{MeshBlockSizes, Treelet};
use crate::bounds::{midpoint_split, split_box, split_dimension, Aabb};
use crate::error::{LodError, LodResult};
use crate::node::NodeRecord;
use std::collections::VecDeque;

/// Stored nodes of a treelet of `depth` levels below its root
pub fn treelet_node_count(depth: u32) -> usize {
    (1usize << (depth + 1)) - 2
}

/// Which sides of `split_val` a cell reaches along `dimension`
///
/// Vertices on the split plane count as left. A straddling cell is on both sides.
fn cell_sides(
    positions: &[f32],
    connectivity: &[u32],
    verts_per_cell: usize,
    cell: u32,
    dimension: usize,
    split_val: f32,
) -> (bool, bool) {
    let start = cell as usize * verts_per_cell;
    let mut left = false;
    let mut right = false;
    for &vertex in connectivity.iter().skip(start).take(verts_per_cell) {
        let Some(coord) = positions.get(vertex as usize * 3 + dimension) else {
            continue;
        };
        if *coord <= split_val {
            left = true;
        } else {
            right = true;
        }
    }
    (left, right)
}

struct Pending {
    /// Global pointer, `None` for the implicit root
    this_ptr: Option<u32>,
    bbox: Aabb,
    depth: u32,
    cells: Vec<u32>,
}

/// Build the treelet of one mesh block
///
/// `depth` is the leaf's depth in the outer tree and picks the first split
/// axis. Records are laid out breadth-first, level by level, so the leaves
/// are the last `2^treelet_depth` records. Node pointers are global: record
/// `i` is addressed as `node_ptr_offset + i`. Leaf records carry the owning `slot` in
/// `parent_ptr` and an offset into the treelet's own cell list in `left_ptr`.
#[allow(clippy::too_many_arguments)]
pub fn generate_treelet(
    positions: &[f32],
    connectivity: &[u32],
    sizes: &MeshBlockSizes,
    cell_count: usize,
    bbox: &Aabb,
    depth: u32,
    treelet_depth: u32,
    node_ptr_offset: u32,
    slot: u32,
) -> LodResult<Treelet> {
    if treelet_depth == 0 {
        return Err(LodError::invalid_config(
            "treelet_depth",
            treelet_depth,
            "a treelet needs at least one level",
        ));
    }

    let mut nodes = vec![NodeRecord::default(); treelet_node_count(treelet_depth)];
    let mut cells = Vec::new();
    let mut root_split = 0.0;
    let mut next_ptr = node_ptr_offset;
    let mut leaves = Vec::new();

    let mut queue = VecDeque::from([Pending {
        this_ptr: None,
        bbox: *bbox,
        depth,
        cells: (0..cell_count as u32).collect(),
    }]);

    while let Some(node) = queue.pop_front() {
        if node.depth == depth + treelet_depth {
            leaves.push(node);
            continue;
        }

        let dimension = split_dimension(node.depth);
        let split_val = midpoint_split(&node.bbox, dimension);
        let mut left_cells = Vec::new();
        let mut right_cells = Vec::new();
        for &cell in &node.cells {
            let (left, right) = cell_sides(
                positions,
                connectivity,
                sizes.verts_per_cell,
                cell,
                dimension,
                split_val,
            );
            if left {
                left_cells.push(cell);
            }
            if right {
                right_cells.push(cell);
            }
        }

        let left_ptr = next_ptr;
        let right_ptr = next_ptr + 1;
        next_ptr += 2;

        match node.this_ptr {
            None => root_split = split_val,
            Some(ptr) => {
                nodes[(ptr - node_ptr_offset) as usize] = NodeRecord {
                    split_val,
                    cell_count: 0,
                    parent_ptr: 0,
                    left_ptr,
                    right_ptr,
                };
            }
        }

        let (left_box, right_box) = split_box(&node.bbox, dimension, split_val);
        queue.push_back(Pending {
            this_ptr: Some(left_ptr),
            bbox: left_box,
            depth: node.depth + 1,
            cells: left_cells,
        });
        queue.push_back(Pending {
            this_ptr: Some(right_ptr),
            bbox: right_box,
            depth: node.depth + 1,
            cells: right_cells,
        });
    }

    for leaf in leaves {
        let Some(ptr) = leaf.this_ptr else { continue };
        nodes[(ptr - node_ptr_offset) as usize] = NodeRecord {
            split_val: 0.0,
            cell_count: leaf.cells.len() as u32,
            parent_ptr: slot,
            left_ptr: cells.len() as u32,
            right_ptr: 0,
        };
        cells.extend(leaf.cells);
    }

    Ok(Treelet {
        nodes,
        cells,
        root_split,
    })
}
