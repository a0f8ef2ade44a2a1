//! Dynamic tree
//!
//! A fixed-capacity mirror of the top of the full tree, refined and coarsened
//! every frame from view-dependent leaf scores.

pub mod dynamic_tree_data;
pub mod dynamic_tree_operations;
pub mod node_scorer;

pub use dynamic_tree_data::{
    DynamicTreeData, DynamicTreeOptions, LeafScore, MergeSplitLists, NodeState, TreeUpdateReport,
    CORNER_VALUE_STRIDE, NODES_CHANNEL, STATE_CHANNEL,
};
pub use dynamic_tree_operations::{
    apply_merge_split, calc_leaf_scores, corner_channel_name, corner_values,
    create_dynamic_tree, create_matched_corner_values, create_merge_split_lists,
    dynamic_node, dynamic_tree_is_connected, dynamic_tree_options, is_dynamic_leaf, node_buffer,
    node_state, reset_update_states, slot_for_full_index, update_dynamic_tree,
};
pub use node_scorer::{
    box_view_score, iso_weight, point_in_frustum, score_node, view_changed, IsoWeighting,
    ViewInputs,
};
