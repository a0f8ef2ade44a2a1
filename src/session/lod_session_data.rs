//! LOD Session Data - Pure DOP
//!
//! NO METHODS. Just data.
//! All transformations happen in lod_session_operations.rs

use crate::config::LodConfig;
use crate::dynamic::{DynamicTreeData, IsoWeighting, LeafScore, ViewInputs};
use crate::mesh::{MeshCacheData, MeshCacheStats};
use crate::tree::FullTree;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

/// Everything one streaming session owns
///
/// The dynamic tree and the mesh cache are only ever touched through the
/// session, which is the single writer between frames.
#[derive(Debug)]
pub struct LodSessionData {
    pub config: LodConfig,
    /// Dataset the mesh blocks are requested for
    pub path: String,
    pub full_tree: Arc<FullTree>,
    pub dynamic_tree: DynamicTreeData,
    /// `None` when the whole mesh is resident
    pub mesh_cache: Option<MeshCacheData>,
    /// View of the last update, for change detection
    pub view: Option<ViewInputs>,
    pub iso: IsoWeighting,
    /// Iso settings changed since the last update
    pub iso_changed: bool,
    /// Ascending leaf scores of the last update
    pub leaf_scores: Vec<LeafScore>,
    pub stats: SessionStats,
}

/// Thread-safe shared session (Arc<RwLock<>>)
pub type SharedLodSession = Arc<RwLock<LodSessionData>>;

/// What one frame update did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameReport {
    pub frame: u64,
    /// A new hysteresis epoch started
    pub view_changed: bool,
    pub leaves: usize,
    /// Merge/split pairs applied
    pub nodes_modified: usize,
}

/// Session lifetime totals, returned on destroy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames: u64,
    pub view_epochs: u64,
    pub nodes_modified: usize,
    pub fetch_rounds: usize,
    pub mesh: MeshCacheStats,
}
