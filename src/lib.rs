// lod-stream - Data-Oriented Programming (DOP) Architecture
//
// View-dependent level of detail for large unstructured meshes.
// - A fixed-capacity dynamic tree mirrors the top of an offline KD tree and
//   is refined and coarsened every frame from leaf scores
// - Leaf geometry streams into a scored block cache, optionally subdivided
//   into treelets for rendering
//
// Data lives in *_data modules, transformations in *_operations modules.
// Prefer pure functions over methods.

pub mod bounds;
pub mod cache;
pub mod config;
pub mod dynamic;
pub mod error;
pub mod mesh;
pub mod node;
pub mod session;
pub mod tree;

#[cfg(test)]
mod test_fixtures;

pub use bounds::{Aabb, ChildSide};
pub use cache::{AssociativeCacheData, ScoredCacheData, Tag};
pub use config::LodConfig;
pub use dynamic::{DynamicTreeData, IsoWeighting, LeafScore, NodeState, ViewInputs};
pub use error::{ErrorContext, LodError, LodResult, OptionExt};
pub use mesh::{
    InMemoryBlockSource, MeshBlock, MeshBlockRequest, MeshBlockSizes, MeshBlockSource,
    MeshCacheData, SourceBlock,
};
pub use node::{NodeRecord, NODE_BYTE_LENGTH};
pub use session::{
    create_lod_session, create_shared_session, destroy_lod_session, stream_mesh_blocks,
    update_frame, FrameReport, LodSessionData, SessionStats, SharedLodSession,
};
pub use tree::FullTree;
