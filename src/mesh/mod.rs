//! Mesh block streaming
//!
//! Blocks of true-leaf geometry are kept in a scored cache, fetched in
//! batches from a `MeshBlockSource` and optionally subdivided into treelets.

pub mod fetch_protocol;
pub mod mesh_block_data;
pub mod mesh_cache_operations;
pub mod treelet;

pub use fetch_protocol::{
    create_mesh_block_request, fetch_mesh_blocks, parse_response, request_from_json,
    request_to_json, response_byte_length, InMemoryBlockSource, MeshBlockRequest,
    MeshBlockSource, SourceBlock, MESH_BLOCKS_MODE,
};
pub use mesh_block_data::{
    FetchBatch, FetchState, MeshBlock, MeshBlockSizes, MeshCacheData, MeshCacheStats,
    PendingBlock, Treelet, CELL_OFFSETS_CHANNEL, CONNECTIVITY_CHANNEL, POSITIONS_CHANNEL,
    TREELET_CELLS_CHANNEL, TREELET_NODES_CHANNEL, TREELET_ROOT_SPLIT_CHANNEL,
};
pub use mesh_cache_operations::{
    abort_block_loads, add_scalar_channel, apply_scalar_blocks, complete_block_loads,
    create_mesh_cache, f32_buffer, is_fetch_in_flight, is_linked, link_block, plan_block_loads,
    requeue_scalar_refetch, resident_tags, take_scalar_refetch, treelet_base_ptr,
    treelet_node_buffer, u32_buffer, unlink_block, update_mesh_scores,
};
pub use treelet::{generate_treelet, treelet_node_count};
