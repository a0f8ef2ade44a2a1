//! Mesh Cache Operations - Pure DOP Functions
//!
//! A load round is split in two so the fetch can happen without holding any
//! state: `plan_block_loads` reserves slots and returns the batch to fetch,
//! `complete_block_loads` writes what came back and links it into the
//! dynamic tree. Only one round is in flight at a time.

use super::mesh_block_data::{
    FetchBatch, FetchState, MeshBlock, MeshBlockSizes, MeshCacheData, MeshCacheStats,
    PendingBlock, CELL_OFFSETS_CHANNEL, CONNECTIVITY_CHANNEL, POSITIONS_CHANNEL,
    TREELET_CELLS_CHANNEL, TREELET_NODES_CHANNEL, TREELET_ROOT_SPLIT_CHANNEL,
};
use super::treelet::{generate_treelet, treelet_node_count};
use crate::cache::{
    channel_storage, create_channel, create_scored_cache, get_slot_for_tag, grow_channel_stride,
    has_channel,
    occupied_slots, read_at, release_slot, resync_channel, scored_insert, should_load,
    sync_scores, tag_at, update_at, ChannelStorage, ChannelValue, ElementType, Tag,
};
use crate::config::LodConfig;
use crate::dynamic::{
    dynamic_node, is_dynamic_leaf, slot_for_full_index, DynamicTreeData, LeafScore,
    NODES_CHANNEL,
};
use crate::error::{LodError, LodResult};
use crate::node::{encode_nodes, NodeRecord, NodeUpdate, NODE_BYTE_LENGTH};
use rustc_hash::FxHashMap;

/// Create the block cache with every geometry channel allocated up front
pub fn create_mesh_cache(
    config: &LodConfig,
    sizes: MeshBlockSizes,
    dynamic_slot_count: usize,
) -> LodResult<MeshCacheData> {
    if sizes.verts_per_cell == 0 {
        return Err(LodError::invalid_config(
            "verts_per_cell",
            sizes.verts_per_cell,
            "cells need at least one vertex",
        ));
    }

    let mut blocks = create_scored_cache(config.mesh_block_count);
    let cache = &mut blocks.cache;
    create_channel(cache, POSITIONS_CHANNEL, ElementType::F32, sizes.max_verts * 3);
    create_channel(cache, CELL_OFFSETS_CHANNEL, ElementType::U32, sizes.max_cells);
    create_channel(
        cache,
        CONNECTIVITY_CHANNEL,
        ElementType::U32,
        sizes.max_cells * sizes.verts_per_cell,
    );

    let treelet_depth = config.treelet_depth;
    let nodes_per_treelet = if treelet_depth > 0 {
        treelet_node_count(treelet_depth)
    } else {
        0
    };
    let treelet_cell_stride =
        (sizes.max_cells as f32 * config.treelet_cell_overallocation).ceil() as usize;

    if treelet_depth > 0 {
        create_channel(
            cache,
            TREELET_NODES_CHANNEL,
            ElementType::U8,
            nodes_per_treelet * NODE_BYTE_LENGTH,
        );
        create_channel(cache, TREELET_CELLS_CHANNEL, ElementType::U32, treelet_cell_stride);
        create_channel(cache, TREELET_ROOT_SPLIT_CHANNEL, ElementType::F32, 1);
    }

    log::info!(
        "[MeshCache] Created {} block slots ({} verts, {} cells per block, treelet depth {})",
        config.mesh_block_count,
        sizes.max_verts,
        sizes.max_cells,
        treelet_depth
    );

    Ok(MeshCacheData {
        blocks,
        sizes,
        treelet_depth,
        nodes_per_treelet,
        treelet_cell_stride,
        dynamic_slot_count,
        scalars: Vec::new(),
        scalar_refetch: Vec::new(),
        fetch_state: FetchState::Idle,
        stats: MeshCacheStats::default(),
    })
}

pub fn is_fetch_in_flight(mesh: &MeshCacheData) -> bool {
    matches!(mesh.fetch_state, FetchState::FetchInFlight(_))
}

/// Pointer of the first treelet node owned by a block slot
pub fn treelet_base_ptr(mesh: &MeshCacheData, slot: usize) -> u32 {
    (mesh.dynamic_slot_count + slot * mesh.nodes_per_treelet) as u32
}

/// Does this dynamic true leaf currently address block data
pub fn is_linked(mesh: &MeshCacheData, record: &NodeRecord) -> bool {
    if mesh.treelet_depth > 0 {
        record.right_ptr > 0
    } else {
        record.cell_count > 0
    }
}

/// Refresh block scores from the latest leaf scores. Blocks whose leaf is
/// not currently a dynamic leaf drop to negative infinity.
pub fn update_mesh_scores(mesh: &mut MeshCacheData, leaf_scores: &[LeafScore]) {
    let scores: FxHashMap<Tag, f32> = leaf_scores
        .iter()
        .filter(|leaf| leaf.true_leaf)
        .map(|leaf| (leaf.full_index, leaf.score))
        .collect();
    sync_scores(&mut mesh.blocks, |tag| scores.get(&tag).copied());
}

/// Point a dynamic true leaf at its resident block. Returns false when the
/// leaf is no longer in the dynamic tree.
pub fn link_block(
    mesh: &MeshCacheData,
    tree: &mut DynamicTreeData,
    tag: Tag,
    mesh_slot: usize,
) -> LodResult<bool> {
    let Some(dynamic_slot) = slot_for_full_index(tree, tag) else {
        return Ok(false);
    };
    let record = dynamic_node(tree, dynamic_slot)?;
    if !is_dynamic_leaf(&record, tree.node_cache.slot_count) {
        return Ok(false);
    }

    let update = if mesh.treelet_depth > 0 {
        let root_split = match read_at(&mesh.blocks.cache, TREELET_ROOT_SPLIT_CHANNEL, mesh_slot)? {
            ChannelValue::F32(values) => values.first().copied().unwrap_or(0.0),
            _ => 0.0,
        };
        let base = treelet_base_ptr(mesh, mesh_slot);
        NodeUpdate {
            split_val: Some(root_split),
            cell_count: Some(0),
            left_ptr: Some(base),
            right_ptr: Some(base + 1),
            ..Default::default()
        }
    } else {
        NodeUpdate {
            cell_count: Some(tree.full_tree.node(tag)?.cell_count),
            left_ptr: Some(mesh_slot as u32),
            right_ptr: Some(0),
            ..Default::default()
        }
    };
    update_at(
        &mut tree.node_cache,
        dynamic_slot,
        &[(NODES_CHANNEL, ChannelValue::NodeWrite(update))],
    )?;
    Ok(true)
}

/// Turn the leaf for `tag` back into an unresident true leaf
pub fn unlink_block(tree: &mut DynamicTreeData, tag: Tag) -> LodResult<bool> {
    let Some(dynamic_slot) = slot_for_full_index(tree, tag) else {
        return Ok(false);
    };
    let record = dynamic_node(tree, dynamic_slot)?;
    if !is_dynamic_leaf(&record, tree.node_cache.slot_count) {
        return Ok(false);
    }
    let cleared = NodeUpdate {
        cell_count: Some(0),
        left_ptr: Some(0),
        right_ptr: Some(0),
        ..Default::default()
    };
    update_at(
        &mut tree.node_cache,
        dynamic_slot,
        &[(NODES_CHANNEL, ChannelValue::NodeWrite(cleared))],
    )?;
    Ok(true)
}

/// Relink resident blocks and reserve slots for the ones worth fetching
///
/// Returns the batch to fetch, or `None` when nothing needs fetching or a
/// batch is already in flight.
pub fn plan_block_loads(
    mesh: &mut MeshCacheData,
    tree: &mut DynamicTreeData,
    leaf_scores: &[LeafScore],
) -> LodResult<Option<FetchBatch>> {
    if is_fetch_in_flight(mesh) {
        log::debug!("[MeshCache] Fetch in flight, skipping block planning");
        return Ok(None);
    }

    update_mesh_scores(mesh, leaf_scores);

    let mut pending: Vec<PendingBlock> = Vec::new();
    for leaf in leaf_scores.iter().rev() {
        if !leaf.true_leaf {
            continue;
        }
        let Some(dynamic_slot) = slot_for_full_index(tree, leaf.full_index) else {
            continue;
        };
        if is_linked(mesh, &dynamic_node(tree, dynamic_slot)?) {
            continue;
        }
        if tree.full_tree.node(leaf.full_index)?.cell_count == 0 {
            continue;
        }

        if let Some(mesh_slot) = get_slot_for_tag(&mesh.blocks.cache, leaf.full_index) {
            if link_block(mesh, tree, leaf.full_index, mesh_slot)? {
                mesh.stats.blocks_relinked += 1;
            }
            continue;
        }

        if !should_load(&mesh.blocks, leaf.score) {
            continue;
        }
        let Some(outcome) = scored_insert(&mut mesh.blocks, leaf.score, leaf.full_index, &[])?
        else {
            continue;
        };
        if let Some(evicted) = outcome.evicted {
            mesh.stats.blocks_evicted += 1;
            unlink_block(tree, evicted)?;
            pending.retain(|p| p.tag != evicted);
        }
        pending.push(PendingBlock {
            tag: leaf.full_index,
            slot: outcome.slot,
            score: leaf.score,
            bbox: leaf.bbox,
            depth: leaf.depth,
        });
    }

    if pending.is_empty() {
        return Ok(None);
    }

    mesh.stats.blocks_requested += pending.len();
    log::debug!("[MeshCache] Reserved {} block slots for fetching", pending.len());

    let batch = FetchBatch {
        blocks: pending,
        geometry: true,
        scalars: mesh.scalars.clone(),
    };
    mesh.fetch_state = FetchState::FetchInFlight(batch.clone());
    Ok(Some(batch))
}

enum LoadOutcome {
    Loaded,
    Stale,
    Missing,
}

fn cell_offsets(sizes: &MeshBlockSizes) -> Vec<u32> {
    (0..sizes.max_cells)
        .map(|i| (i * sizes.verts_per_cell) as u32)
        .collect()
}

/// Widen the per-slot treelet cell list to hold at least `needed` entries
///
/// Straddling cells are copied to both sides of a split, so a block can need
/// up to `max_cells << treelet_depth` entries. Leaf offsets are slot-local
/// and stay valid.
fn grow_treelet_cells(mesh: &mut MeshCacheData, needed: usize) -> LodResult<()> {
    let worst = mesh.sizes.max_cells << mesh.treelet_depth;
    let stride = (2 * mesh.treelet_cell_stride).min(worst).max(needed);
    grow_channel_stride(&mut mesh.blocks.cache, TREELET_CELLS_CHANNEL, stride)?;
    log::info!(
        "[MeshCache] Treelet cell list grew from {} to {} entries per block",
        mesh.treelet_cell_stride,
        stride
    );
    mesh.treelet_cell_stride = stride;
    Ok(())
}

fn load_block(
    mesh: &mut MeshCacheData,
    tree: &mut DynamicTreeData,
    pending: &PendingBlock,
    blocks: &mut FxHashMap<Tag, MeshBlock>,
) -> LodResult<LoadOutcome> {
    if tag_at(&mesh.blocks.cache, pending.slot) != Some(pending.tag) {
        log::debug!(
            "[MeshCache] Dropping block {}, slot {} was reassigned during the fetch",
            pending.tag,
            pending.slot
        );
        return Ok(LoadOutcome::Stale);
    }
    let Some(block) = blocks.remove(&pending.tag) else {
        log::warn!("[MeshCache] Block {} missing from the fetch response", pending.tag);
        release_slot(&mut mesh.blocks, pending.slot)?;
        return Ok(LoadOutcome::Missing);
    };

    let sizes = mesh.sizes;
    let cell_count = (tree.full_tree.node(pending.tag)?.cell_count as usize).min(sizes.max_cells);

    let mut data: Vec<(&str, ChannelValue)> = vec![
        (POSITIONS_CHANNEL, ChannelValue::F32(block.positions.clone())),
        (CELL_OFFSETS_CHANNEL, ChannelValue::U32(cell_offsets(&sizes))),
    ];
    if !block.connectivity.is_empty() {
        data.push((CONNECTIVITY_CHANNEL, ChannelValue::U32(block.connectivity.clone())));
    }
    for (name, values) in &block.scalars {
        if has_channel(&mesh.blocks.cache, name) {
            data.push((name.as_str(), ChannelValue::F32(values.clone())));
        }
    }

    if mesh.treelet_depth > 0 {
        let treelet = generate_treelet(
            &block.positions,
            &block.connectivity,
            &sizes,
            cell_count,
            &pending.bbox,
            pending.depth,
            mesh.treelet_depth,
            treelet_base_ptr(mesh, pending.slot),
            pending.slot as u32,
        )?;
        if treelet.cells.len() > mesh.treelet_cell_stride {
            grow_treelet_cells(mesh, treelet.cells.len())?;
        }
        data.push((TREELET_NODES_CHANNEL, ChannelValue::U8(encode_nodes(&treelet.nodes))));
        data.push((TREELET_CELLS_CHANNEL, ChannelValue::U32(treelet.cells)));
        data.push((TREELET_ROOT_SPLIT_CHANNEL, ChannelValue::F32(vec![treelet.root_split])));
    }

    update_at(&mut mesh.blocks.cache, pending.slot, &data)?;
    link_block(mesh, tree, pending.tag, pending.slot)?;

    // batch planned before a scalar was selected
    let missing_scalar = mesh
        .scalars
        .iter()
        .any(|name| !block.scalars.iter().any(|(scalar, _)| scalar == name));
    if missing_scalar {
        mesh.scalar_refetch.push(pending.tag);
    }
    Ok(LoadOutcome::Loaded)
}

/// Store the blocks of the in-flight batch and link them
///
/// Reservations whose slot was reassigned meanwhile are dropped. On error
/// every reservation not yet filled is released before returning.
pub fn complete_block_loads(
    mesh: &mut MeshCacheData,
    tree: &mut DynamicTreeData,
    blocks: Vec<MeshBlock>,
) -> LodResult<usize> {
    let FetchState::FetchInFlight(batch) = std::mem::take(&mut mesh.fetch_state) else {
        log::warn!("[MeshCache] Fetch completed with no batch in flight");
        return Ok(0);
    };

    let mut by_index: FxHashMap<Tag, MeshBlock> =
        blocks.into_iter().map(|block| (block.index, block)).collect();
    let mut loaded = 0;

    for (i, pending) in batch.blocks.iter().enumerate() {
        match load_block(mesh, tree, pending, &mut by_index) {
            Ok(LoadOutcome::Loaded) => loaded += 1,
            Ok(LoadOutcome::Stale) => mesh.stats.stale_dropped += 1,
            Ok(LoadOutcome::Missing) => mesh.stats.fetch_failures += 1,
            Err(error) => {
                release_reservations(mesh, &batch.blocks[i..])?;
                return Err(error);
            }
        }
    }

    mesh.stats.blocks_loaded += loaded;
    log::debug!(
        "[MeshCache] Loaded {} of {} requested blocks",
        loaded,
        batch.blocks.len()
    );
    Ok(loaded)
}

fn release_reservations(mesh: &mut MeshCacheData, pending: &[PendingBlock]) -> LodResult<usize> {
    let mut released = 0;
    for block in pending {
        if tag_at(&mesh.blocks.cache, block.slot) == Some(block.tag) {
            release_slot(&mut mesh.blocks, block.slot)?;
            released += 1;
        }
    }
    Ok(released)
}

/// Give up on the in-flight batch and free its reservations
pub fn abort_block_loads(mesh: &mut MeshCacheData) -> LodResult<usize> {
    let FetchState::FetchInFlight(batch) = std::mem::take(&mut mesh.fetch_state) else {
        return Ok(0);
    };
    let released = release_reservations(mesh, &batch.blocks)?;
    mesh.stats.fetch_failures += 1;
    log::warn!("[MeshCache] Aborted fetch, released {} block slots", released);
    Ok(released)
}

/// Start fetching `name` with every block. Returns true if the channel is new.
pub fn add_scalar_channel(mesh: &mut MeshCacheData, name: &str) -> bool {
    if mesh.scalars.iter().any(|s| s == name) {
        return false;
    }
    create_channel(&mut mesh.blocks.cache, name, ElementType::F32, mesh.sizes.max_verts);
    mesh.scalars.push(name.to_string());
    true
}

/// Tags of blocks holding data (reservations of an in-flight batch excluded)
pub fn resident_tags(mesh: &MeshCacheData) -> Vec<Tag> {
    let reserved: Vec<Tag> = match &mesh.fetch_state {
        FetchState::FetchInFlight(batch) => batch.blocks.iter().map(|b| b.tag).collect(),
        FetchState::Idle => Vec::new(),
    };
    occupied_slots(&mesh.blocks.cache)
        .map(|(_, tag)| tag)
        .filter(|tag| !reserved.contains(tag))
        .collect()
}

/// Take the still-resident blocks that need a scalar-only refetch of every
/// selected scalar
pub fn take_scalar_refetch(mesh: &mut MeshCacheData) -> Vec<Tag> {
    let mut tags = std::mem::take(&mut mesh.scalar_refetch);
    tags.sort_unstable();
    tags.dedup();
    tags.retain(|&tag| get_slot_for_tag(&mesh.blocks.cache, tag).is_some());
    tags
}

/// Put back refetch tags whose fetch failed
pub fn requeue_scalar_refetch(mesh: &mut MeshCacheData, tags: Vec<Tag>) {
    mesh.scalar_refetch.extend(tags);
}

/// Write scalar values from a scalar-only fetch into resident blocks
pub fn apply_scalar_blocks(
    mesh: &mut MeshCacheData,
    name: &str,
    blocks: &[MeshBlock],
) -> LodResult<usize> {
    let values: FxHashMap<Tag, &Vec<f32>> = blocks
        .iter()
        .filter_map(|block| {
            block
                .scalars
                .iter()
                .find(|(scalar, _)| scalar == name)
                .map(|(_, v)| (block.index, v))
        })
        .collect();
    let written = resync_channel(&mut mesh.blocks.cache, name, |tag| {
        values.get(&tag).map(|v| ChannelValue::F32((*v).clone()))
    })?;
    log::debug!("[MeshCache] Resynced scalar '{}' for {} blocks", name, written);
    Ok(written)
}

/// Flat treelet node buffer, appended after the dynamic nodes for rendering
pub fn treelet_node_buffer(mesh: &MeshCacheData) -> LodResult<&[u8]> {
    if mesh.treelet_depth == 0 {
        return Ok(&[]);
    }
    match channel_storage(&mesh.blocks.cache, TREELET_NODES_CHANNEL)? {
        ChannelStorage::U8(bytes) => Ok(bytes),
        _ => Err(LodError::ChannelTypeMismatch {
            name: TREELET_NODES_CHANNEL.to_string(),
            expected: "u8".to_string(),
        }),
    }
}

/// Raw `u32` buffer of a channel
pub fn u32_buffer<'a>(mesh: &'a MeshCacheData, name: &str) -> LodResult<&'a [u32]> {
    match channel_storage(&mesh.blocks.cache, name)? {
        ChannelStorage::U32(values) => Ok(values),
        _ => Err(LodError::ChannelTypeMismatch {
            name: name.to_string(),
            expected: "u32".to_string(),
        }),
    }
}

/// Raw `f32` buffer of a channel
pub fn f32_buffer<'a>(mesh: &'a MeshCacheData, name: &str) -> LodResult<&'a [f32]> {
    match channel_storage(&mesh.blocks.cache, name)? {
        ChannelStorage::F32(values) => Ok(values),
        _ => Err(LodError::ChannelTypeMismatch {
            name: name.to_string(),
            expected: "f32".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{occupied_count, release_slot, scored_insert};
    use crate::dynamic::{calc_leaf_scores, create_dynamic_tree, dynamic_tree_options};
    use crate::mesh::fetch_protocol::{fetch_mesh_blocks, InMemoryBlockSource};
    use crate::node::decode_nodes;
    use crate::test_fixtures::{balanced_tree, tet_source};
    use crate::tree::FullTree;
    use std::sync::Arc;

    struct Fixture {
        tree: DynamicTreeData,
        mesh: MeshCacheData,
        source: InMemoryBlockSource,
    }

    /// Depth-2 tree: true leaves 3 and 4 are seeded, 5 and 6 stay behind a pruned leaf
    fn fixture(mesh_block_count: usize, treelet_depth: u32) -> Fixture {
        let full: Arc<FullTree> = Arc::new(balanced_tree(2, 2));
        let config = LodConfig {
            dynamic_node_count: 7,
            mesh_block_count,
            treelet_depth,
            ..Default::default()
        };
        let tree = create_dynamic_tree(Arc::clone(&full), 7, dynamic_tree_options(&config))
            .expect("Failed to create dynamic tree");
        let source = tet_source(&full);
        let mesh = create_mesh_cache(&config, source.sizes, 7).expect("Failed to create mesh cache");
        Fixture { tree, mesh, source }
    }

    fn scores(tree: &DynamicTreeData, table: &[(Tag, f32)]) -> Vec<LeafScore> {
        calc_leaf_scores(tree, |_, tag| {
            table.iter().find(|(t, _)| *t == tag).map(|(_, s)| *s).unwrap_or(0.0)
        })
        .expect("Failed to score leaves")
    }

    fn fetch(source: &InMemoryBlockSource, batch: &FetchBatch) -> Vec<MeshBlock> {
        let tags: Vec<Tag> = batch.blocks.iter().map(|b| b.tag).collect();
        pollster::block_on(fetch_mesh_blocks(
            source,
            &source.path,
            &tags,
            batch.geometry,
            &batch.scalars,
            &source.sizes,
            1000,
        ))
        .expect("Failed to fetch blocks")
    }

    fn leaf_record(tree: &DynamicTreeData, tag: Tag) -> NodeRecord {
        let slot = slot_for_full_index(tree, tag).expect("leaf in dynamic tree");
        dynamic_node(tree, slot).unwrap()
    }

    fn run_round(f: &mut Fixture, table: &[(Tag, f32)]) -> Option<usize> {
        let leaf_scores = scores(&f.tree, table);
        let batch = plan_block_loads(&mut f.mesh, &mut f.tree, &leaf_scores).unwrap()?;
        let blocks = fetch(&f.source, &batch);
        Some(complete_block_loads(&mut f.mesh, &mut f.tree, blocks).unwrap())
    }

    #[test]
    fn test_single_slot_goes_to_best_leaf() {
        let mut f = fixture(1, 0);
        assert_eq!(run_round(&mut f, &[(3, 2.0), (4, 9.0)]), Some(1));

        let loaded = leaf_record(&f.tree, 4);
        assert_eq!(loaded.cell_count, 2);
        assert_eq!(loaded.left_ptr, 0);

        let deferred = leaf_record(&f.tree, 3);
        assert_eq!((deferred.cell_count, deferred.left_ptr, deferred.right_ptr), (0, 0, 0));

        // still not worth a slot on the next frame
        assert_eq!(run_round(&mut f, &[(3, 2.0), (4, 9.0)]), None);
        assert_eq!(occupied_count(&f.mesh.blocks.cache), 1);
    }

    #[test]
    fn test_eviction_unlinks_previous_leaf() {
        let mut f = fixture(1, 0);
        run_round(&mut f, &[(3, 2.0), (4, 9.0)]);
        assert_eq!(run_round(&mut f, &[(3, 20.0), (4, 1.0)]), Some(1));

        assert_eq!(leaf_record(&f.tree, 4).cell_count, 0);
        assert_eq!(leaf_record(&f.tree, 3).cell_count, 2);
        assert_eq!(f.mesh.stats.blocks_evicted, 1);
        assert_eq!(get_slot_for_tag(&f.mesh.blocks.cache, 4), None);
    }

    #[test]
    fn test_block_data_written() {
        let mut f = fixture(2, 0);
        run_round(&mut f, &[(3, 1.0), (4, 2.0)]);

        let slot = get_slot_for_tag(&f.mesh.blocks.cache, 3).unwrap();
        let positions = f32_buffer(&f.mesh, POSITIONS_CHANNEL).unwrap();
        let stride = f.mesh.sizes.max_verts * 3;
        let expected = &f.source.blocks[&3].positions;
        assert_eq!(&positions[slot * stride..slot * stride + expected.len()], expected.as_slice());

        let offsets = u32_buffer(&f.mesh, CELL_OFFSETS_CHANNEL).unwrap();
        assert_eq!(&offsets[slot * 2..slot * 2 + 2], &[0, 4]);
        let connectivity = u32_buffer(&f.mesh, CONNECTIVITY_CHANNEL).unwrap();
        assert_eq!(&connectivity[slot * 8..slot * 8 + 8], &[0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_treelet_linking() {
        let mut f = fixture(2, 1);
        run_round(&mut f, &[(3, 1.0), (4, 2.0)]);

        let slot = get_slot_for_tag(&f.mesh.blocks.cache, 4).unwrap();
        let record = leaf_record(&f.tree, 4);
        let base = 7 + slot as u32 * 2;
        assert_eq!((record.left_ptr, record.right_ptr, record.cell_count), (base, base + 1, 0));
        // leaves at depth 2 split on z first
        assert_eq!(record.split_val, 0.5);

        let bytes = treelet_node_buffer(&f.mesh).unwrap();
        assert_eq!(bytes.len(), 2 * 2 * NODE_BYTE_LENGTH);
        let nodes = decode_nodes(&bytes[slot * 2 * NODE_BYTE_LENGTH..(slot + 1) * 2 * NODE_BYTE_LENGTH]).unwrap();
        assert!(nodes.iter().all(|n| n.parent_ptr == slot as u32 && n.right_ptr == 0));
        assert!(nodes.iter().map(|n| n.cell_count).sum::<u32>() >= 2);

        // linked treelet leaves stay leaves for the scoring walk
        let leaves = scores(&f.tree, &[]);
        assert!(leaves.iter().any(|l| l.full_index == 4));
    }

    #[test]
    fn test_straddling_treelet_cells_grow_stride() {
        // fixture cells span most of their leaf in y and z, so the z and y
        // splits duplicate every cell
        let mut f = fixture(2, 3);
        assert_eq!(f.mesh.treelet_cell_stride, 4);
        assert_eq!(run_round(&mut f, &[(3, 1.0), (4, 2.0)]), Some(2));

        assert_eq!(f.mesh.treelet_cell_stride, 8);
        let cells = u32_buffer(&f.mesh, TREELET_CELLS_CHANNEL).unwrap();
        assert_eq!(cells.len(), 2 * 8);

        let bytes = treelet_node_buffer(&f.mesh).unwrap();
        for tag in [3, 4] {
            let slot = get_slot_for_tag(&f.mesh.blocks.cache, tag).unwrap();
            assert_eq!(leaf_record(&f.tree, tag).left_ptr, 7 + slot as u32 * 14);

            let span = 14 * NODE_BYTE_LENGTH;
            let nodes = decode_nodes(&bytes[slot * span..(slot + 1) * span]).unwrap();
            let leaves: Vec<NodeRecord> = nodes.into_iter().filter(|n| n.right_ptr == 0).collect();
            assert_eq!(leaves.len(), 8);
            for leaf in leaves {
                assert_eq!(leaf.cell_count, 1);
                let cell = cells[slot * 8 + leaf.left_ptr as usize];
                assert!(cell < 2);
            }
        }
        assert_eq!(f.mesh.stats.fetch_failures, 0);
    }

    #[test]
    fn test_single_batch_in_flight() {
        let mut f = fixture(2, 0);
        let leaf_scores = scores(&f.tree, &[(3, 1.0), (4, 2.0)]);
        let batch = plan_block_loads(&mut f.mesh, &mut f.tree, &leaf_scores).unwrap();
        assert_eq!(batch.map(|b| b.blocks.len()), Some(2));
        assert!(is_fetch_in_flight(&f.mesh));
        assert!(plan_block_loads(&mut f.mesh, &mut f.tree, &leaf_scores).unwrap().is_none());
    }

    #[test]
    fn test_stale_reservation_dropped() {
        let mut f = fixture(1, 0);
        let leaf_scores = scores(&f.tree, &[(3, 2.0), (4, 9.0)]);
        let batch = plan_block_loads(&mut f.mesh, &mut f.tree, &leaf_scores).unwrap().unwrap();
        let blocks = fetch(&f.source, &batch);

        // slot handed to another node while the fetch was out
        release_slot(&mut f.mesh.blocks, 0).unwrap();
        scored_insert(&mut f.mesh.blocks, 50.0, 99, &[]).unwrap();

        assert_eq!(complete_block_loads(&mut f.mesh, &mut f.tree, blocks).unwrap(), 0);
        assert_eq!(f.mesh.stats.stale_dropped, 1);
        assert_eq!(leaf_record(&f.tree, 4).cell_count, 0);
        assert!(!is_fetch_in_flight(&f.mesh));
    }

    #[test]
    fn test_abort_releases_reservations() {
        let mut f = fixture(2, 0);
        let leaf_scores = scores(&f.tree, &[(3, 1.0), (4, 2.0)]);
        plan_block_loads(&mut f.mesh, &mut f.tree, &leaf_scores).unwrap();

        assert_eq!(abort_block_loads(&mut f.mesh).unwrap(), 2);
        assert_eq!(occupied_count(&f.mesh.blocks.cache), 0);
        assert_eq!(f.mesh.stats.fetch_failures, 1);

        let batch = plan_block_loads(&mut f.mesh, &mut f.tree, &leaf_scores).unwrap();
        assert!(batch.is_some());
    }

    #[test]
    fn test_resident_block_relinked_without_fetch() {
        let mut f = fixture(2, 0);
        run_round(&mut f, &[(3, 1.0), (4, 2.0)]);
        unlink_block(&mut f.tree, 3).unwrap();
        assert_eq!(leaf_record(&f.tree, 3).cell_count, 0);

        let before = f.source.request_count();
        assert_eq!(run_round(&mut f, &[(3, 1.0), (4, 2.0)]), None);
        assert_eq!(f.source.request_count(), before);
        assert_eq!(leaf_record(&f.tree, 3).cell_count, 2);
        assert_eq!(f.mesh.stats.blocks_relinked, 1);
    }

    #[test]
    fn test_scalar_selected_during_fetch_is_refetched() {
        let mut f = fixture(2, 0);
        let leaf_scores = scores(&f.tree, &[(3, 1.0), (4, 2.0)]);
        let batch = plan_block_loads(&mut f.mesh, &mut f.tree, &leaf_scores).unwrap().unwrap();
        assert!(batch.scalars.is_empty());

        // selected while the batch is out, so its blocks arrive without it
        assert!(add_scalar_channel(&mut f.mesh, "density"));
        assert!(resident_tags(&f.mesh).is_empty());
        let blocks = fetch(&f.source, &batch);
        assert_eq!(complete_block_loads(&mut f.mesh, &mut f.tree, blocks).unwrap(), 2);

        let tags = take_scalar_refetch(&mut f.mesh);
        assert_eq!(tags, vec![3, 4]);
        assert!(take_scalar_refetch(&mut f.mesh).is_empty());

        let refetched = pollster::block_on(fetch_mesh_blocks(
            &f.source,
            &f.source.path,
            &tags,
            false,
            &f.mesh.scalars,
            &f.source.sizes,
            1000,
        ))
        .expect("Failed to refetch scalars");
        assert_eq!(apply_scalar_blocks(&mut f.mesh, "density", &refetched).unwrap(), 2);

        let density = f32_buffer(&f.mesh, "density").unwrap();
        for tag in [3, 4] {
            let slot = get_slot_for_tag(&f.mesh.blocks.cache, tag).unwrap();
            assert_eq!(&density[slot * 8..slot * 8 + 8], &[tag as f32; 8]);
        }
    }

    #[test]
    fn test_blocks_with_every_scalar_need_no_refetch() {
        let mut f = fixture(2, 0);
        add_scalar_channel(&mut f.mesh, "density");
        assert_eq!(run_round(&mut f, &[(3, 1.0), (4, 2.0)]), Some(2));
        assert!(take_scalar_refetch(&mut f.mesh).is_empty());
    }

    #[test]
    fn test_scalar_switch_resyncs_resident_blocks() {
        let mut f = fixture(2, 0);
        run_round(&mut f, &[(3, 1.0), (4, 2.0)]);

        assert!(add_scalar_channel(&mut f.mesh, "density"));
        assert!(!add_scalar_channel(&mut f.mesh, "density"));
        let tags = resident_tags(&f.mesh);
        let blocks = pollster::block_on(fetch_mesh_blocks(
            &f.source,
            &f.source.path,
            &tags,
            false,
            &["density".to_string()],
            &f.source.sizes,
            1000,
        ))
        .unwrap();
        assert_eq!(apply_scalar_blocks(&mut f.mesh, "density", &blocks).unwrap(), 2);

        let slot = get_slot_for_tag(&f.mesh.blocks.cache, 4).unwrap();
        let density = f32_buffer(&f.mesh, "density").unwrap();
        assert_eq!(&density[slot * 8..slot * 8 + 8], &[4.0; 8]);
    }
}
