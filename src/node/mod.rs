//! Binary node codec
//!
//! Fixed 20 byte node records shared by the full tree, the dynamic tree and
//! the treelets.

pub mod node_data;
pub mod node_operations;

pub use node_data::{
    DecodedNode, NodeRecord, NodeUpdate, CELL_COUNT_OFFSET, LEFT_PTR_OFFSET, NODE_BYTE_LENGTH,
    PARENT_PTR_OFFSET, RIGHT_PTR_OFFSET, SPLIT_VAL_OFFSET,
};
pub use node_operations::{
    decode_nodes, encode_nodes, full_update, is_leaf, node_count, read_node, update_node,
    write_node,
};
