//! Dynamic Tree Data - Pure DOP
//!
//! NO METHODS. Just data.
//! All transformations happen in dynamic_tree_operations.rs

use crate::bounds::Aabb;
use crate::cache::{AssociativeCacheData, Tag};
use crate::tree::FullTree;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Node record channel of the dynamic-node cache
pub const NODES_CHANNEL: &str = "nodes";
/// Per-slot hysteresis state channel
pub const STATE_CHANNEL: &str = "state";
/// Corner values per node (one value per box corner)
pub const CORNER_VALUE_STRIDE: usize = 8;

/// Hysteresis state of a dynamic slot within one view epoch
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    None = 0,
    Merged = 1,
    Split = 2,
}

/// Behaviour switches fixed at construction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicTreeOptions {
    pub hysteresis: bool,
    pub depth_first_seed: bool,
    /// Copy cell ranges of true leaves from the full tree (no mesh cache)
    pub resident_cells: bool,
    /// Merge/split pairs applied per update at most
    pub modify_list_length: usize,
}

/// Bounded mirror of a rooted prefix of the full tree
#[derive(Debug)]
pub struct DynamicTreeData {
    pub full_tree: Arc<FullTree>,
    /// Slots tagged by full-tree index; channels `nodes`, `state` and one per corner-value field
    pub node_cache: AssociativeCacheData,
    pub options: DynamicTreeOptions,
    /// Full-tree corner values per registered scalar, 8 per full node
    pub corner_sources: FxHashMap<String, Arc<[f32]>>,
}

/// Score and neighbourhood of one dynamic leaf, gathered by the scoring walk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeafScore {
    pub slot: usize,
    pub full_index: Tag,
    pub parent_slot: usize,
    pub depth: u32,
    pub bbox: Aabb,
    pub score: f32,
    pub state: NodeState,
    /// Sibling under the same parent is a leaf too
    pub both_siblings_leaves: bool,
    /// Mirrors a full-tree leaf
    pub true_leaf: bool,
}

/// Disjoint merge and split candidates of one update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeSplitLists {
    pub merge: Vec<LeafScore>,
    pub split: Vec<LeafScore>,
}

/// Outcome of one dynamic tree update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeUpdateReport {
    pub leaves: usize,
    pub merge_candidates: usize,
    pub split_candidates: usize,
    /// Paired merge+split changes applied
    pub changes: usize,
}
