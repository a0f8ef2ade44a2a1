//! Mesh Block Data - Pure DOP
//!
//! NO METHODS. Just data.
//! All transformations happen in mesh_cache_operations.rs

use crate::bounds::Aabb;
use crate::cache::{ScoredCacheData, Tag};
use crate::node::NodeRecord;
use serde::{Deserialize, Serialize};

pub const POSITIONS_CHANNEL: &str = "positions";
pub const CELL_OFFSETS_CHANNEL: &str = "cellOffsets";
pub const CONNECTIVITY_CHANNEL: &str = "cellConnectivity";
pub const TREELET_NODES_CHANNEL: &str = "treeletNodes";
pub const TREELET_CELLS_CHANNEL: &str = "treeletCells";
pub const TREELET_ROOT_SPLIT_CHANNEL: &str = "treeletRootSplit";

/// Fixed per-block capacity, sized by the largest leaf of the dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshBlockSizes {
    pub max_verts: usize,
    pub max_cells: usize,
    /// 4 for tetrahedra
    pub verts_per_cell: usize,
}

/// One fetched block, padded to `MeshBlockSizes`
#[derive(Debug, Clone, PartialEq)]
pub struct MeshBlock {
    pub index: Tag,
    /// `max_verts * 3` floats
    pub positions: Vec<f32>,
    /// `max_cells * verts_per_cell` 0-based vertex indices, empty for scalar-only fetches
    pub connectivity: Vec<u32>,
    /// `max_verts` floats per requested scalar
    pub scalars: Vec<(String, Vec<f32>)>,
}

/// Treelet generated over one block's cells
#[derive(Debug, Clone, PartialEq)]
pub struct Treelet {
    /// `2^(depth + 1) - 2` records, root excluded
    pub nodes: Vec<NodeRecord>,
    /// Block-local cell indices referenced by the treelet leaves
    pub cells: Vec<u32>,
    /// Split of the implicit root, stored on the owning dynamic node
    pub root_split: f32,
}

/// A slot reserved for a block that is being fetched
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingBlock {
    pub tag: Tag,
    pub slot: usize,
    pub score: f32,
    /// Box and depth of the leaf, needed to build its treelet
    pub bbox: Aabb,
    pub depth: u32,
}

/// Blocks of one fetch round
#[derive(Debug, Clone, PartialEq)]
pub struct FetchBatch {
    pub blocks: Vec<PendingBlock>,
    pub geometry: bool,
    pub scalars: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum FetchState {
    #[default]
    Idle,
    FetchInFlight(FetchBatch),
}

/// Running totals of mesh cache activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MeshCacheStats {
    pub blocks_requested: usize,
    pub blocks_loaded: usize,
    pub blocks_evicted: usize,
    pub blocks_relinked: usize,
    pub stale_dropped: usize,
    pub fetch_failures: usize,
}

/// Scored cache of mesh blocks keyed by full-tree leaf index
#[derive(Debug)]
pub struct MeshCacheData {
    pub blocks: ScoredCacheData,
    pub sizes: MeshBlockSizes,
    /// 0 disables treelets
    pub treelet_depth: u32,
    pub nodes_per_treelet: usize,
    pub treelet_cell_stride: usize,
    /// Treelet node pointers start after the dynamic node buffer
    pub dynamic_slot_count: usize,
    /// Scalars fetched with every block
    pub scalars: Vec<String>,
    /// Loaded blocks that arrived without one of `scalars`
    pub scalar_refetch: Vec<Tag>,
    pub fetch_state: FetchState,
    pub stats: MeshCacheStats,
}
