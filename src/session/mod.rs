//! Streaming session
//!
//! Owns one dataset's dynamic tree and mesh block cache and drives them
//! frame by frame.

pub mod lod_session_data;
pub mod lod_session_operations;

pub use lod_session_data::{FrameReport, LodSessionData, SessionStats, SharedLodSession};
pub use lod_session_operations::{
    abort_mesh_update, combined_node_buffer, complete_mesh_update, create_lod_session,
    create_shared_session, destroy_lod_session, match_corner_values, plan_mesh_update,
    render_cell_buffer, select_scalar, set_iso_weighting, stream_mesh_blocks, update_frame,
    update_frame_with,
};
