//! Dynamic Tree Operations - Pure DOP Functions
//!
//! Seeding from the full tree, the per-frame scoring walk, merge/split
//! scheduling and the hysteresis epoch. Slot count never changes: every
//! merge frees exactly the two slots the paired split consumes.

use super::dynamic_tree_data::{
    DynamicTreeData, DynamicTreeOptions, LeafScore, MergeSplitLists, NodeState,
    TreeUpdateReport, CORNER_VALUE_STRIDE, NODES_CHANNEL, STATE_CHANNEL,
};
use crate::bounds::{split_box, split_dimension, Aabb};
use crate::cache::{
    channel_storage, create_associative_cache, create_channel, create_channel_with_codec,
    get_slot_for_tag, has_channel, insert_at, occupied_count, occupied_slots, read_at,
    read_node_at, resync_channel, tag_at, update_at, ChannelStorage, ChannelValue, ElementType,
    NodeCodec, Tag,
};
use crate::config::LodConfig;
use crate::error::{LodError, LodResult, OptionExt};
use crate::node::{full_update, is_leaf, NodeRecord, NodeUpdate, NODE_BYTE_LENGTH};
use crate::tree::FullTree;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Arc;

/// Walk cap in multiples of the slot count
const TRAVERSAL_GUARD_FACTOR: usize = 3;

pub fn dynamic_tree_options(config: &LodConfig) -> DynamicTreeOptions {
    DynamicTreeOptions {
        hysteresis: config.hysteresis,
        depth_first_seed: config.depth_first_seed,
        resident_cells: !config.uses_mesh_cache(),
        modify_list_length: config.modify_list_length(),
    }
}

/// Leaf test for dynamic records. Treelet-linked true leaves point past the slot range.
#[inline]
pub fn is_dynamic_leaf(record: &NodeRecord, slot_count: usize) -> bool {
    record.right_ptr == 0 || record.right_ptr as usize >= slot_count
}

pub fn corner_channel_name(scalar: &str) -> String {
    format!("corners.{}", scalar)
}

/// Build a dynamic tree of `slot_count` slots seeded from the top of `full_tree`
pub fn create_dynamic_tree(
    full_tree: Arc<FullTree>,
    slot_count: usize,
    options: DynamicTreeOptions,
) -> LodResult<DynamicTreeData> {
    if slot_count > full_tree.len() {
        return Err(LodError::NodeCountExceedsTree {
            requested: slot_count,
            available: full_tree.len(),
        });
    }
    if slot_count == 0 {
        return Err(LodError::invalid_config(
            "dynamic_node_count",
            slot_count,
            "the root needs a slot",
        ));
    }

    let mut node_cache = create_associative_cache(slot_count);
    create_channel_with_codec(
        &mut node_cache,
        NODES_CHANNEL,
        ElementType::U8,
        NODE_BYTE_LENGTH,
        Box::new(NodeCodec),
    );
    create_channel(&mut node_cache, STATE_CHANNEL, ElementType::U8, 1);

    let mut tree = DynamicTreeData {
        full_tree,
        node_cache,
        options,
        corner_sources: FxHashMap::default(),
    };
    seed_dynamic_tree(&mut tree)?;

    log::info!(
        "[DynamicTree] Seeded {} of {} slots from a full tree of {} nodes ({})",
        occupied_count(&tree.node_cache),
        slot_count,
        tree.full_tree.len(),
        if options.depth_first_seed {
            "depth first"
        } else {
            "breadth first"
        }
    );
    Ok(tree)
}

/// Record a full-tree node gets when it first appears in the dynamic tree
fn mirror_record(
    full_tree: &FullTree,
    options: &DynamicTreeOptions,
    full_index: Tag,
    parent_slot: usize,
) -> LodResult<NodeRecord> {
    let full = full_tree.node(full_index)?;
    let resident_leaf = options.resident_cells && is_leaf(full);
    Ok(NodeRecord {
        split_val: full.split_val,
        cell_count: if resident_leaf { full.cell_count } else { 0 },
        parent_ptr: parent_slot as u32,
        left_ptr: if resident_leaf { full.left_ptr } else { 0 },
        right_ptr: 0,
    })
}

/// Corner values of every registered field for one full-tree node
fn corner_values_for(
    corner_sources: &FxHashMap<String, Arc<[f32]>>,
    full_index: Tag,
) -> LodResult<Vec<(String, ChannelValue)>> {
    let start = full_index as usize * CORNER_VALUE_STRIDE;
    corner_sources
        .iter()
        .map(|(name, values)| {
            let corners = values
                .get(start..start + CORNER_VALUE_STRIDE)
                .ok_or_lod(|| LodError::Internal {
                    message: format!("corner values of '{}' stop before node {}", name, full_index),
                })?;
            Ok((corner_channel_name(name), ChannelValue::F32(corners.to_vec())))
        })
        .collect()
}

/// Install `full_index` at `slot` with a fresh record, state and corner values
fn install_node(
    tree: &mut DynamicTreeData,
    slot: usize,
    full_index: Tag,
    record: &NodeRecord,
    state: NodeState,
) -> LodResult<()> {
    let corners = corner_values_for(&tree.corner_sources, full_index)?;
    let mut data: Vec<(&str, ChannelValue)> = vec![
        (NODES_CHANNEL, ChannelValue::NodeWrite(full_update(record))),
        (STATE_CHANNEL, ChannelValue::U8(vec![state as u8])),
    ];
    data.extend(corners.iter().map(|(name, value)| (name.as_str(), value.clone())));
    insert_at(&mut tree.node_cache, slot, full_index, &data)?;
    Ok(())
}

fn seed_dynamic_tree(tree: &mut DynamicTreeData) -> LodResult<()> {
    let slot_count = tree.node_cache.slot_count;
    let full_tree = Arc::clone(&tree.full_tree);
    let options = tree.options;

    let root = mirror_record(&full_tree, &options, 0, 0)?;
    install_node(tree, 0, 0, &root, NodeState::None)?;

    // (full index, dynamic slot) of nodes waiting to be expanded
    let mut frontier: VecDeque<(Tag, usize)> = VecDeque::new();
    if !is_leaf(full_tree.node(0)?) {
        frontier.push_back((0, 0));
    }

    let mut used = 1;
    while used + 2 < slot_count {
        let Some((full_index, slot)) = frontier.pop_back() else {
            break;
        };
        let full = *full_tree.node(full_index)?;
        let children = [(full.left_ptr, used), (full.right_ptr, used + 1)];

        for (child_full, child_slot) in children {
            let record = mirror_record(&full_tree, &options, child_full, slot)?;
            install_node(tree, child_slot, child_full, &record, NodeState::None)?;

            if !full_tree.is_true_leaf(child_full)? {
                if options.depth_first_seed {
                    frontier.push_back((child_full, child_slot));
                } else {
                    frontier.push_front((child_full, child_slot));
                }
            }
        }

        let branch = NodeUpdate {
            left_ptr: Some(used as u32),
            right_ptr: Some(used as u32 + 1),
            ..Default::default()
        };
        update_at(&mut tree.node_cache, slot, &[(NODES_CHANNEL, ChannelValue::NodeWrite(branch))])?;
        used += 2;
    }
    Ok(())
}

/// Record stored at a dynamic slot
pub fn dynamic_node(tree: &DynamicTreeData, slot: usize) -> LodResult<NodeRecord> {
    Ok(read_node_at(&tree.node_cache, NODES_CHANNEL, slot)?.record)
}

pub fn node_state(tree: &DynamicTreeData, slot: usize) -> LodResult<NodeState> {
    match read_at(&tree.node_cache, STATE_CHANNEL, slot)? {
        ChannelValue::U8(bytes) => Ok(match bytes.first().copied() {
            Some(1) => NodeState::Merged,
            Some(2) => NodeState::Split,
            _ => NodeState::None,
        }),
        _ => Err(LodError::ChannelTypeMismatch {
            name: STATE_CHANNEL.to_string(),
            expected: "u8".to_string(),
        }),
    }
}

/// Dynamic node buffer, as handed to a renderer
pub fn node_buffer(tree: &DynamicTreeData) -> LodResult<&[u8]> {
    match channel_storage(&tree.node_cache, NODES_CHANNEL)? {
        ChannelStorage::U8(bytes) => Ok(bytes),
        _ => Err(LodError::ChannelTypeMismatch {
            name: NODES_CHANNEL.to_string(),
            expected: "u8".to_string(),
        }),
    }
}

struct WalkEntry {
    slot: usize,
    bbox: Aabb,
    depth: u32,
    both_siblings_leaves: bool,
}

/// Score every dynamic leaf, ascending by score
///
/// Walks depth first from the root, deriving each node's box from its
/// parent's box and split value. `score` gets the box and the full-tree index.
pub fn calc_leaf_scores<F>(tree: &DynamicTreeData, mut score: F) -> LodResult<Vec<LeafScore>>
where
    F: FnMut(&Aabb, Tag) -> f32,
{
    let slot_count = tree.node_cache.slot_count;
    let guard = TRAVERSAL_GUARD_FACTOR * slot_count;
    let mut leaves = Vec::new();
    let mut stack = vec![WalkEntry {
        slot: 0,
        bbox: *tree.full_tree.extent(),
        depth: 0,
        both_siblings_leaves: false,
    }];
    let mut visited = 0;

    while let Some(entry) = stack.pop() {
        if visited >= guard {
            log::warn!(
                "[DynamicTree] Scoring walk stopped after {} nodes, the node buffer has a cycle",
                visited
            );
            break;
        }
        visited += 1;

        let full_index = tag_at(&tree.node_cache, entry.slot).ok_or_lod(|| LodError::InvalidTree {
            reason: format!("dynamic slot {} is reachable but unoccupied", entry.slot),
        })?;
        let record = dynamic_node(tree, entry.slot)?;

        if is_dynamic_leaf(&record, slot_count) {
            leaves.push(LeafScore {
                slot: entry.slot,
                full_index,
                parent_slot: record.parent_ptr as usize,
                depth: entry.depth,
                bbox: entry.bbox,
                score: score(&entry.bbox, full_index),
                state: node_state(tree, entry.slot)?,
                both_siblings_leaves: entry.both_siblings_leaves,
                true_leaf: tree.full_tree.is_true_leaf(full_index)?,
            });
            continue;
        }

        let left = record.left_ptr as usize;
        let right = record.right_ptr as usize;
        let both_leaves = is_dynamic_leaf(&dynamic_node(tree, left)?, slot_count)
            && is_dynamic_leaf(&dynamic_node(tree, right)?, slot_count);
        let (left_box, right_box) =
            split_box(&entry.bbox, split_dimension(entry.depth), record.split_val);

        stack.push(WalkEntry {
            slot: right,
            bbox: right_box,
            depth: entry.depth + 1,
            both_siblings_leaves: both_leaves,
        });
        stack.push(WalkEntry {
            slot: left,
            bbox: left_box,
            depth: entry.depth + 1,
            both_siblings_leaves: both_leaves,
        });
    }

    leaves.sort_by(|a, b| a.score.total_cmp(&b.score));
    Ok(leaves)
}

/// Pick split candidates from the top of `scores` and merge candidates from the bottom
///
/// `scores` must be sorted ascending. Merges are only taken below the lowest
/// split candidate so no leaf is in both lists.
pub fn create_merge_split_lists(tree: &DynamicTreeData, scores: &[LeafScore]) -> MergeSplitLists {
    let budget = tree.options.modify_list_length;
    let hysteresis = tree.options.hysteresis;
    let mut lists = MergeSplitLists::default();

    let mut lowest_split_index = scores.len();
    for (index, leaf) in scores.iter().enumerate().rev() {
        if lists.split.len() >= budget {
            break;
        }
        if leaf.true_leaf || (hysteresis && leaf.state == NodeState::Merged) {
            continue;
        }
        lists.split.push(*leaf);
        lowest_split_index = index;
    }

    let split_parents: FxHashSet<usize> = lists.split.iter().map(|s| s.parent_slot).collect();
    let mut merge_parents = FxHashSet::default();
    for leaf in &scores[..lowest_split_index] {
        if lists.merge.len() >= budget {
            break;
        }
        if !leaf.both_siblings_leaves
            || split_parents.contains(&leaf.parent_slot)
            || merge_parents.contains(&leaf.parent_slot)
            || (hysteresis && leaf.state == NodeState::Split)
        {
            continue;
        }
        merge_parents.insert(leaf.parent_slot);
        lists.merge.push(*leaf);
    }

    lists
}

/// Apply paired changes: collapse each merge parent and reuse its two slots
/// for the children of the matching split candidate. Returns the pair count.
pub fn apply_merge_split(tree: &mut DynamicTreeData, lists: &MergeSplitLists) -> LodResult<usize> {
    let changes = lists.merge.len().min(lists.split.len());
    let full_tree = Arc::clone(&tree.full_tree);
    let options = tree.options;

    for (merge, split) in lists.merge.iter().zip(&lists.split).take(changes) {
        let parent_slot = merge.parent_slot;
        let parent = dynamic_node(tree, parent_slot)?;
        let freed = [parent.left_ptr as usize, parent.right_ptr as usize];

        let collapse = NodeUpdate {
            cell_count: Some(0),
            left_ptr: Some(0),
            right_ptr: Some(0),
            ..Default::default()
        };
        update_at(
            &mut tree.node_cache,
            parent_slot,
            &[
                (NODES_CHANNEL, ChannelValue::NodeWrite(collapse)),
                (STATE_CHANNEL, ChannelValue::U8(vec![NodeState::Merged as u8])),
            ],
        )?;

        let full = *full_tree.node(split.full_index)?;
        let expand = NodeUpdate {
            split_val: Some(full.split_val),
            cell_count: Some(0),
            left_ptr: Some(freed[0] as u32),
            right_ptr: Some(freed[1] as u32),
            ..Default::default()
        };
        update_at(
            &mut tree.node_cache,
            split.slot,
            &[(NODES_CHANNEL, ChannelValue::NodeWrite(expand))],
        )?;

        for (child_full, child_slot) in [(full.left_ptr, freed[0]), (full.right_ptr, freed[1])] {
            let record = mirror_record(&full_tree, &options, child_full, split.slot)?;
            install_node(tree, child_slot, child_full, &record, NodeState::Split)?;
        }
    }

    Ok(changes)
}

/// One scheduling step over already computed, ascending leaf scores
pub fn update_dynamic_tree(
    tree: &mut DynamicTreeData,
    scores: &[LeafScore],
) -> LodResult<TreeUpdateReport> {
    let lists = create_merge_split_lists(tree, scores);
    let changes = apply_merge_split(tree, &lists)?;

    if changes > 0 {
        log::debug!(
            "[DynamicTree] Applied {} merge/split pairs ({} merge, {} split candidates, {} leaves)",
            changes,
            lists.merge.len(),
            lists.split.len(),
            scores.len()
        );
    }

    Ok(TreeUpdateReport {
        leaves: scores.len(),
        merge_candidates: lists.merge.len(),
        split_candidates: lists.split.len(),
        changes,
    })
}

/// Start a new hysteresis epoch
pub fn reset_update_states(tree: &mut DynamicTreeData) -> LodResult<()> {
    resync_channel(&mut tree.node_cache, STATE_CHANNEL, |_| {
        Some(ChannelValue::U8(vec![NodeState::None as u8]))
    })?;
    Ok(())
}

/// Register per-node corner values of a scalar field and fill them in for
/// every resident node. `values` holds 8 floats per full-tree node.
pub fn create_matched_corner_values(
    tree: &mut DynamicTreeData,
    name: &str,
    values: Arc<[f32]>,
) -> LodResult<()> {
    let expected = tree.full_tree.len() * CORNER_VALUE_STRIDE;
    if values.len() < expected {
        return Err(LodError::invalid_config(
            "corner_values",
            values.len(),
            &format!("'{}' needs {} values for {} nodes", name, expected, tree.full_tree.len()),
        ));
    }

    let channel = corner_channel_name(name);
    if !has_channel(&tree.node_cache, &channel) {
        create_channel(&mut tree.node_cache, &channel, ElementType::F32, CORNER_VALUE_STRIDE);
    }
    let written = resync_channel(&mut tree.node_cache, &channel, |tag| {
        let start = tag as usize * CORNER_VALUE_STRIDE;
        values
            .get(start..start + CORNER_VALUE_STRIDE)
            .map(|corners| ChannelValue::F32(corners.to_vec()))
    })?;
    tree.corner_sources.insert(name.to_string(), values);

    log::info!("[DynamicTree] Matched corner values for '{}' on {} nodes", name, written);
    Ok(())
}

/// Corner-value buffer of a registered field, 8 floats per slot
pub fn corner_values<'a>(tree: &'a DynamicTreeData, name: &str) -> LodResult<&'a [f32]> {
    let channel = corner_channel_name(name);
    match channel_storage(&tree.node_cache, &channel)? {
        ChannelStorage::F32(values) => Ok(values),
        _ => Err(LodError::ChannelTypeMismatch {
            name: channel,
            expected: "f32".to_string(),
        }),
    }
}

/// Slot currently mirroring a full-tree node
pub fn slot_for_full_index(tree: &DynamicTreeData, full_index: Tag) -> Option<usize> {
    get_slot_for_tag(&tree.node_cache, full_index)
}

/// Occupied slots form one tree rooted at slot 0 whose links agree both ways
pub fn dynamic_tree_is_connected(tree: &DynamicTreeData) -> bool {
    let slot_count = tree.node_cache.slot_count;
    if tag_at(&tree.node_cache, 0) != Some(0) {
        return false;
    }

    for (slot, _) in occupied_slots(&tree.node_cache) {
        let Ok(record) = dynamic_node(tree, slot) else {
            return false;
        };
        if slot != 0 {
            let parent_slot = record.parent_ptr as usize;
            if tag_at(&tree.node_cache, parent_slot).is_none() {
                return false;
            }
            let Ok(parent) = dynamic_node(tree, parent_slot) else {
                return false;
            };
            if parent.left_ptr as usize != slot && parent.right_ptr as usize != slot {
                return false;
            }
        }
        if !is_dynamic_leaf(&record, slot_count) {
            for child in [record.left_ptr, record.right_ptr] {
                if tag_at(&tree.node_cache, child as usize).is_none() {
                    return false;
                }
            }
        }
    }
    true
}
