//! LOD Session Operations - Pure DOP Functions
//!
//! Lifecycle of a streaming session: create, per-frame update, mesh block
//! streaming, destroy. Async entry points take a `SharedLodSession` and
//! never hold its lock across a fetch.

use super::lod_session_data::{FrameReport, LodSessionData, SessionStats, SharedLodSession};
use crate::bounds::Aabb;
use crate::cache::Tag;
use crate::config::LodConfig;
use crate::dynamic::{
    calc_leaf_scores, create_dynamic_tree, create_matched_corner_values, dynamic_tree_options,
    node_buffer, reset_update_states, score_node, update_dynamic_tree, view_changed,
    IsoWeighting, ViewInputs,
};
use crate::error::{LodError, LodResult, OptionExt};
use crate::mesh::{
    abort_block_loads, add_scalar_channel, apply_scalar_blocks, complete_block_loads,
    create_mesh_cache, fetch_mesh_blocks, is_fetch_in_flight, plan_block_loads,
    requeue_scalar_refetch, resident_tags, take_scalar_refetch, treelet_node_buffer, u32_buffer,
    FetchBatch, MeshBlock, MeshBlockSizes, MeshBlockSource, TREELET_CELLS_CHANNEL,
};
use crate::tree::FullTree;
use parking_lot::RwLock;
use std::sync::Arc;

/// Create a session over `full_tree`
///
/// `sizes` is required when the config enables the mesh cache.
pub fn create_lod_session(
    config: LodConfig,
    full_tree: Arc<FullTree>,
    sizes: Option<MeshBlockSizes>,
    path: &str,
) -> LodResult<LodSessionData> {
    config.validate()?;

    let dynamic_tree = create_dynamic_tree(
        Arc::clone(&full_tree),
        config.dynamic_node_count,
        dynamic_tree_options(&config),
    )?;

    let mesh_cache = if config.uses_mesh_cache() {
        let sizes = sizes.ok_or_lod(|| {
            LodError::invalid_config(
                "mesh_block_sizes",
                "none",
                "block sizes are required when mesh_block_count > 0",
            )
        })?;
        Some(create_mesh_cache(&config, sizes, config.dynamic_node_count)?)
    } else {
        None
    };

    log::info!(
        "[LodSession] Created session for '{}' ({} dynamic nodes, {})",
        path,
        config.dynamic_node_count,
        if mesh_cache.is_some() {
            "streamed mesh"
        } else {
            "resident mesh"
        }
    );

    Ok(LodSessionData {
        config,
        path: path.to_string(),
        full_tree,
        dynamic_tree,
        mesh_cache,
        view: None,
        iso: IsoWeighting::None,
        iso_changed: false,
        leaf_scores: Vec::new(),
        stats: SessionStats::default(),
    })
}

pub fn create_shared_session(session: LodSessionData) -> SharedLodSession {
    Arc::new(RwLock::new(session))
}

/// Change the iso weighting. Takes effect, with a new epoch, on the next update.
pub fn set_iso_weighting(session: &mut LodSessionData, iso: IsoWeighting) {
    if session.iso != iso {
        session.iso = iso;
        session.iso_changed = true;
    }
}

/// Per-frame update with the default view scorer
///
/// A view that differs from the last one by more than the configured epsilon,
/// or changed iso settings, start a new hysteresis epoch. Without a view the
/// leaves get random scores.
pub fn update_frame(session: &mut LodSessionData, view: Option<ViewInputs>) -> LodResult<FrameReport> {
    let new_epoch = session.iso_changed
        || view_changed(
            session.view.as_ref(),
            view.as_ref(),
            session.config.view_change_epsilon,
        );
    session.view = view;
    session.iso_changed = false;

    let iso = session.iso.clone();
    let mut rng = rand::thread_rng();
    update_frame_with(session, new_epoch, |bbox, tag| {
        score_node(view.as_ref(), &iso, bbox, tag, &mut rng)
    })
}

/// Per-frame update with a caller supplied scoring function
pub fn update_frame_with<F>(
    session: &mut LodSessionData,
    new_epoch: bool,
    score: F,
) -> LodResult<FrameReport>
where
    F: FnMut(&Aabb, Tag) -> f32,
{
    if new_epoch {
        reset_update_states(&mut session.dynamic_tree)?;
        session.stats.view_epochs += 1;
    }

    let scores = calc_leaf_scores(&session.dynamic_tree, score)?;
    let update = update_dynamic_tree(&mut session.dynamic_tree, &scores)?;
    session.leaf_scores = scores;

    session.stats.frames += 1;
    session.stats.nodes_modified += update.changes;

    Ok(FrameReport {
        frame: session.stats.frames,
        view_changed: new_epoch,
        leaves: update.leaves,
        nodes_modified: update.changes,
    })
}

/// Reserve block slots for the last update's leaves, returning what to fetch
pub fn plan_mesh_update(session: &mut LodSessionData) -> LodResult<Option<FetchBatch>> {
    let Some(mesh) = session.mesh_cache.as_mut() else {
        return Ok(None);
    };
    plan_block_loads(mesh, &mut session.dynamic_tree, &session.leaf_scores)
}

pub fn complete_mesh_update(session: &mut LodSessionData, blocks: Vec<MeshBlock>) -> LodResult<usize> {
    let Some(mesh) = session.mesh_cache.as_mut() else {
        return Ok(0);
    };
    session.stats.fetch_rounds += 1;
    complete_block_loads(mesh, &mut session.dynamic_tree, blocks)
}

pub fn abort_mesh_update(session: &mut LodSessionData) -> LodResult<usize> {
    match session.mesh_cache.as_mut() {
        Some(mesh) => abort_block_loads(mesh),
        None => Ok(0),
    }
}

/// Everything a fetch needs, copied out so no lock is held while it runs
struct FetchPlan {
    path: String,
    sizes: MeshBlockSizes,
    max_blocks_per_request: usize,
}

fn fetch_plan(session: &LodSessionData) -> LodResult<FetchPlan> {
    let mesh = session.mesh_cache.as_ref().ok_or_lod(|| {
        LodError::invalid_config("mesh_block_count", 0, "the session streams no mesh blocks")
    })?;
    Ok(FetchPlan {
        path: session.path.clone(),
        sizes: mesh.sizes,
        max_blocks_per_request: session.config.max_blocks_per_request,
    })
}

/// One mesh streaming round: plan under the lock, fetch unlocked, complete under the lock
///
/// Returns the number of blocks loaded. A failed fetch releases its
/// reservations and the error is returned. Blocks that arrived without a
/// scalar selected while they were in flight get it in a scalar-only refetch.
pub async fn stream_mesh_blocks(
    shared: &SharedLodSession,
    source: &dyn MeshBlockSource,
) -> LodResult<usize> {
    let loaded = load_planned_blocks(shared, source).await?;
    refetch_missing_scalars(shared, source).await?;
    Ok(loaded)
}

async fn load_planned_blocks(
    shared: &SharedLodSession,
    source: &dyn MeshBlockSource,
) -> LodResult<usize> {
    let (batch, plan) = {
        let mut session = shared.write();
        if session.mesh_cache.is_none() {
            return Ok(0);
        }
        let Some(batch) = plan_mesh_update(&mut session)? else {
            return Ok(0);
        };
        (batch, fetch_plan(&session)?)
    };

    let tags: Vec<Tag> = batch.blocks.iter().map(|block| block.tag).collect();
    let fetched = fetch_mesh_blocks(
        source,
        &plan.path,
        &tags,
        batch.geometry,
        &batch.scalars,
        &plan.sizes,
        plan.max_blocks_per_request,
    )
    .await;

    let mut session = shared.write();
    match fetched {
        Ok(blocks) => complete_mesh_update(&mut session, blocks),
        Err(error) => {
            log::warn!("[LodSession] Mesh block fetch failed: {}", error);
            abort_mesh_update(&mut session)?;
            Err(error)
        }
    }
}

/// Scalar-only fetch for blocks queued by `complete_block_loads`. Returns the
/// number of blocks refetched; a failed fetch queues them again.
async fn refetch_missing_scalars(
    shared: &SharedLodSession,
    source: &dyn MeshBlockSource,
) -> LodResult<usize> {
    let (tags, scalars, plan) = {
        let mut session = shared.write();
        if session.mesh_cache.is_none() {
            return Ok(0);
        }
        let plan = fetch_plan(&session)?;
        let Some(mesh) = session.mesh_cache.as_mut() else {
            return Ok(0);
        };
        (take_scalar_refetch(mesh), mesh.scalars.clone(), plan)
    };
    if tags.is_empty() {
        return Ok(0);
    }

    let fetched = fetch_mesh_blocks(
        source,
        &plan.path,
        &tags,
        false,
        &scalars,
        &plan.sizes,
        plan.max_blocks_per_request,
    )
    .await;

    let mut session = shared.write();
    let Some(mesh) = session.mesh_cache.as_mut() else {
        return Ok(0);
    };
    match fetched {
        Ok(blocks) => {
            for name in &scalars {
                apply_scalar_blocks(mesh, name, &blocks)?;
            }
            log::debug!("[LodSession] Refetched {} scalars for {} blocks", scalars.len(), tags.len());
            Ok(tags.len())
        }
        Err(error) => {
            log::warn!("[LodSession] Scalar refetch failed: {}", error);
            requeue_scalar_refetch(mesh, tags);
            Err(error)
        }
    }
}

/// Switch on a scalar field: fetch it for every resident block and keep
/// fetching it with new blocks. Returns the number of blocks resynced.
///
/// Blocks of a batch already in flight are not resident yet. They are
/// refetched by the `stream_mesh_blocks` call that completes them.
pub async fn select_scalar(
    shared: &SharedLodSession,
    source: &dyn MeshBlockSource,
    name: &str,
) -> LodResult<usize> {
    let (tags, plan) = {
        let mut session = shared.write();
        let plan = fetch_plan(&session)?;
        let Some(mesh) = session.mesh_cache.as_mut() else {
            return Ok(0);
        };
        if add_scalar_channel(mesh, name) {
            log::info!("[LodSession] Selected scalar '{}'", name);
        }
        (resident_tags(mesh), plan)
    };
    if tags.is_empty() {
        return Ok(0);
    }

    let blocks = fetch_mesh_blocks(
        source,
        &plan.path,
        &tags,
        false,
        &[name.to_string()],
        &plan.sizes,
        plan.max_blocks_per_request,
    )
    .await?;

    let mut session = shared.write();
    match session.mesh_cache.as_mut() {
        Some(mesh) => apply_scalar_blocks(mesh, name, &blocks),
        None => Ok(0),
    }
}

/// Register per-node corner values of a scalar on the dynamic tree
pub fn match_corner_values(
    session: &mut LodSessionData,
    name: &str,
    values: Arc<[f32]>,
) -> LodResult<()> {
    create_matched_corner_values(&mut session.dynamic_tree, name, values)
}

/// Dynamic node buffer followed by the treelet node buffer
pub fn combined_node_buffer(session: &LodSessionData) -> LodResult<Vec<u8>> {
    let dynamic = node_buffer(&session.dynamic_tree)?;
    let treelets = match &session.mesh_cache {
        Some(mesh) => treelet_node_buffer(mesh)?,
        None => &[],
    };
    let mut combined = Vec::with_capacity(dynamic.len() + treelets.len());
    combined.extend_from_slice(dynamic);
    combined.extend_from_slice(treelets);
    Ok(combined)
}

/// Cell-index buffer that leaf `left_ptr`s address
///
/// The full tree's cell buffer for a resident mesh, the treelet cell buffer
/// when treelets are on. Streamed blocks without treelets index their cells
/// directly, so the buffer is empty.
pub fn render_cell_buffer(session: &LodSessionData) -> LodResult<&[u32]> {
    match &session.mesh_cache {
        None => Ok(session.full_tree.cells()),
        Some(mesh) if mesh.treelet_depth > 0 => u32_buffer(mesh, TREELET_CELLS_CHANNEL),
        Some(_) => Ok(&[]),
    }
}

/// End the session, dropping any in-flight reservations
pub fn destroy_lod_session(mut session: LodSessionData) -> SessionStats {
    if let Some(mesh) = session.mesh_cache.as_mut() {
        if is_fetch_in_flight(mesh) {
            if let Err(error) = abort_block_loads(mesh) {
                log::warn!("[LodSession] Failed to release in-flight blocks: {}", error);
            }
        }
        session.stats.mesh = mesh.stats;
    }

    log::info!(
        "[LodSession] Destroyed session for '{}' after {} frames ({} nodes modified, {} blocks loaded)",
        session.path,
        session.stats.frames,
        session.stats.nodes_modified,
        session.stats.mesh.blocks_loaded
    );
    session.stats
}
