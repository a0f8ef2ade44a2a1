//! Tree Node Data - Pure DOP
//!
//! NO METHODS. Just data.
//! All transformations happen in node_operations.rs

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

/// Size of one encoded node record in bytes
pub const NODE_BYTE_LENGTH: usize = 5 * 4;

// Field byte offsets inside a record
pub const SPLIT_VAL_OFFSET: usize = 0;
pub const CELL_COUNT_OFFSET: usize = 4;
pub const PARENT_PTR_OFFSET: usize = 8;
pub const LEFT_PTR_OFFSET: usize = 12;
pub const RIGHT_PTR_OFFSET: usize = 16;

/// KD tree node as laid out in node buffers (full tree, dynamic tree, treelets)
///
/// A record with `right_ptr == 0` is a leaf. For full-tree leaves `left_ptr`
/// is an offset into the cell-index buffer and `cell_count` the number of
/// cells there.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct NodeRecord {
    pub split_val: f32,
    pub cell_count: u32,
    pub parent_ptr: u32,
    pub left_ptr: u32,
    pub right_ptr: u32,
}

const_assert_eq!(std::mem::size_of::<NodeRecord>(), NODE_BYTE_LENGTH);

/// A node record together with the index it was read from
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DecodedNode {
    pub this_ptr: u32,
    pub record: NodeRecord,
}

/// Partial node write, `None` leaves the stored field untouched
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct NodeUpdate {
    pub split_val: Option<f32>,
    pub cell_count: Option<u32>,
    pub parent_ptr: Option<u32>,
    pub left_ptr: Option<u32>,
    pub right_ptr: Option<u32>,
}
