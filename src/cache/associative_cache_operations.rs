//! Associative Cache Operations - Pure DOP Functions
//!
//! Tag-addressed slot store over named channels. Slot count is fixed at
//! creation. A channel's stride can only grow, and only through
//! `grow_channel_stride`.

use super::cache_data::{
    AssociativeCacheData, Channel, ChannelStorage, ChannelValue, ElementType, InsertOutcome, Tag,
};
use super::codec::{ChannelCodec, SliceCodec};
use crate::error::{LodError, LodResult};
use crate::node::DecodedNode;
use rand::Rng;
use rustc_hash::FxHashMap;

/// Create an empty cache with `slot_count` slots and no channels
pub fn create_associative_cache(slot_count: usize) -> AssociativeCacheData {
    AssociativeCacheData {
        slot_count,
        tags: vec![None; slot_count],
        directory: FxHashMap::default(),
        channels: FxHashMap::default(),
    }
}

/// Allocate a channel of `slot_count * stride` elements using the slice codec
pub fn create_channel(
    cache: &mut AssociativeCacheData,
    name: &str,
    element_type: ElementType,
    stride: usize,
) {
    create_channel_with_codec(cache, name, element_type, stride, Box::new(SliceCodec));
}

/// Allocate a channel with a custom codec. Recreating a channel discards its contents.
pub fn create_channel_with_codec(
    cache: &mut AssociativeCacheData,
    name: &str,
    element_type: ElementType,
    stride: usize,
    codec: Box<dyn ChannelCodec>,
) {
    let len = cache.slot_count * stride;
    let storage = match element_type {
        ElementType::F32 => ChannelStorage::F32(vec![0.0; len]),
        ElementType::U32 => ChannelStorage::U32(vec![0; len]),
        ElementType::U8 => ChannelStorage::U8(vec![0; len]),
    };
    let previous = cache.channels.insert(
        name.to_string(),
        Channel {
            element_type,
            stride,
            storage,
            codec,
        },
    );
    if previous.is_some() {
        log::debug!("[AssociativeCache] Recreated channel '{}'", name);
    }
}

/// Replace the codec of an existing channel
pub fn set_codec(
    cache: &mut AssociativeCacheData,
    name: &str,
    codec: Box<dyn ChannelCodec>,
) -> LodResult<()> {
    let channel = cache
        .channels
        .get_mut(name)
        .ok_or_else(|| LodError::channel_not_found(name))?;
    channel.codec = codec;
    Ok(())
}

fn restride<T: Copy + Default>(buffer: &[T], slot_count: usize, old: usize, new: usize) -> Vec<T> {
    let mut grown = vec![T::default(); slot_count * new];
    for slot in 0..slot_count {
        grown[slot * new..slot * new + old].copy_from_slice(&buffer[slot * old..(slot + 1) * old]);
    }
    grown
}

/// Widen a channel to `stride` elements per slot, keeping every slot's contents
///
/// Strides never shrink; a smaller `stride` is a no-op.
pub fn grow_channel_stride(
    cache: &mut AssociativeCacheData,
    name: &str,
    stride: usize,
) -> LodResult<()> {
    let slot_count = cache.slot_count;
    let channel = cache
        .channels
        .get_mut(name)
        .ok_or_else(|| LodError::channel_not_found(name))?;
    let old = channel.stride;
    if stride <= old {
        return Ok(());
    }

    channel.storage = match &channel.storage {
        ChannelStorage::F32(buffer) => ChannelStorage::F32(restride(buffer, slot_count, old, stride)),
        ChannelStorage::U32(buffer) => ChannelStorage::U32(restride(buffer, slot_count, old, stride)),
        ChannelStorage::U8(buffer) => ChannelStorage::U8(restride(buffer, slot_count, old, stride)),
    };
    channel.stride = stride;
    log::debug!(
        "[AssociativeCache] Grew channel '{}' from {} to {} elements per slot",
        name,
        old,
        stride
    );
    Ok(())
}

pub fn has_channel(cache: &AssociativeCacheData, name: &str) -> bool {
    cache.channels.contains_key(name)
}

/// Slot holding `tag`, if any
pub fn get_slot_for_tag(cache: &AssociativeCacheData, tag: Tag) -> Option<usize> {
    cache.directory.get(&tag).copied()
}

/// Tag stored in `slot`, `None` when the slot is unoccupied or out of range
pub fn tag_at(cache: &AssociativeCacheData, slot: usize) -> Option<Tag> {
    cache.tags.get(slot).copied().flatten()
}

pub fn occupied_count(cache: &AssociativeCacheData) -> usize {
    cache.directory.len()
}

/// `(slot, tag)` for every occupied slot in slot order
pub fn occupied_slots(cache: &AssociativeCacheData) -> impl Iterator<Item = (usize, Tag)> + '_ {
    cache
        .tags
        .iter()
        .enumerate()
        .filter_map(|(slot, tag)| tag.map(|t| (slot, t)))
}

fn check_slot(cache: &AssociativeCacheData, slot: usize) -> LodResult<()> {
    if slot >= cache.slot_count {
        return Err(LodError::SlotOutOfRange {
            slot,
            slot_count: cache.slot_count,
        });
    }
    Ok(())
}

/// Every write names a channel and fits its type and stride
fn check_writes(cache: &AssociativeCacheData, data: &[(&str, ChannelValue)]) -> LodResult<()> {
    for (name, value) in data {
        let channel = cache
            .channels
            .get(*name)
            .ok_or_else(|| LodError::channel_not_found(name))?;
        channel
            .codec
            .check(name, &channel.storage, channel.stride, value)?;
    }
    Ok(())
}

fn write_channels(
    cache: &mut AssociativeCacheData,
    slot: usize,
    data: &[(&str, ChannelValue)],
) -> LodResult<()> {
    for (name, value) in data {
        let channel = cache
            .channels
            .get_mut(*name)
            .ok_or_else(|| LodError::channel_not_found(name))?;
        channel
            .codec
            .encode(name, &mut channel.storage, slot, channel.stride, value)?;
    }
    Ok(())
}

/// Install `tag` in `slot`, evicting whatever tag was there
///
/// Writes are checked before anything is touched, so an unknown channel,
/// a type mismatch or an overlong value leaves the cache unchanged. If `tag` already lived in another
/// slot that slot is vacated to keep tags unique.
pub fn insert_at(
    cache: &mut AssociativeCacheData,
    slot: usize,
    tag: Tag,
    data: &[(&str, ChannelValue)],
) -> LodResult<InsertOutcome> {
    check_slot(cache, slot)?;
    check_writes(cache, data)?;

    let previous = cache.tags[slot];
    let evicted = match previous {
        Some(old) if old != tag => {
            cache.directory.remove(&old);
            Some(old)
        }
        _ => None,
    };

    if let Some(other) = cache.directory.get(&tag).copied() {
        if other != slot {
            cache.tags[other] = None;
        }
    }

    cache.tags[slot] = Some(tag);
    cache.directory.insert(tag, slot);

    write_channels(cache, slot, data)?;

    Ok(InsertOutcome { slot, evicted })
}

/// Install `tag` at a uniformly random slot
pub fn insert_at_random<R: Rng + ?Sized>(
    cache: &mut AssociativeCacheData,
    rng: &mut R,
    tag: Tag,
    data: &[(&str, ChannelValue)],
) -> LodResult<InsertOutcome> {
    if cache.slot_count == 0 {
        return Err(LodError::SlotOutOfRange {
            slot: 0,
            slot_count: 0,
        });
    }
    let slot = rng.gen_range(0..cache.slot_count);
    insert_at(cache, slot, tag, data)
}

/// Write the supplied channels at `slot`, leaving tag and directory alone
pub fn update_at(
    cache: &mut AssociativeCacheData,
    slot: usize,
    data: &[(&str, ChannelValue)],
) -> LodResult<()> {
    check_slot(cache, slot)?;
    check_writes(cache, data)?;
    write_channels(cache, slot, data)
}

/// Vacate `slot`, returning the tag it held. Channel contents are left as garbage.
pub fn evict_at(cache: &mut AssociativeCacheData, slot: usize) -> LodResult<Option<Tag>> {
    check_slot(cache, slot)?;
    let evicted = cache.tags[slot].take();
    if let Some(tag) = evicted {
        cache.directory.remove(&tag);
    }
    Ok(evicted)
}

/// Rewrite one channel for every occupied slot from its tag
///
/// Tags for which `value_for_tag` yields `None` keep their current contents.
/// Returns the number of slots rewritten.
pub fn resync_channel<F>(
    cache: &mut AssociativeCacheData,
    name: &str,
    mut value_for_tag: F,
) -> LodResult<usize>
where
    F: FnMut(Tag) -> Option<ChannelValue>,
{
    let channel = cache
        .channels
        .get_mut(name)
        .ok_or_else(|| LodError::channel_not_found(name))?;

    let mut written = 0;
    for (slot, tag) in cache.tags.iter().enumerate() {
        let Some(tag) = tag else { continue };
        if let Some(value) = value_for_tag(*tag) {
            channel
                .codec
                .encode(name, &mut channel.storage, slot, channel.stride, &value)?;
            written += 1;
        }
    }
    Ok(written)
}

/// Decode one slot of a channel
pub fn read_at(cache: &AssociativeCacheData, name: &str, slot: usize) -> LodResult<ChannelValue> {
    check_slot(cache, slot)?;
    let channel = cache
        .channels
        .get(name)
        .ok_or_else(|| LodError::channel_not_found(name))?;
    channel
        .codec
        .decode(name, &channel.storage, slot, channel.stride)
}

/// Decode one slot of a node-coded channel
pub fn read_node_at(cache: &AssociativeCacheData, name: &str, slot: usize) -> LodResult<DecodedNode> {
    match read_at(cache, name, slot)? {
        ChannelValue::NodeRead(node) => Ok(node),
        _ => Err(LodError::ChannelTypeMismatch {
            name: name.to_string(),
            expected: "node".to_string(),
        }),
    }
}

/// Raw storage of a channel, e.g. for upload to a renderer
pub fn channel_storage<'a>(
    cache: &'a AssociativeCacheData,
    name: &str,
) -> LodResult<&'a ChannelStorage> {
    cache
        .channels
        .get(name)
        .map(|c| &c.storage)
        .ok_or_else(|| LodError::channel_not_found(name))
}

/// Elements per slot of a channel
pub fn channel_stride(cache: &AssociativeCacheData, name: &str) -> LodResult<usize> {
    cache
        .channels
        .get(name)
        .map(|c| c.stride)
        .ok_or_else(|| LodError::channel_not_found(name))
}

/// Check that `tags` and `directory` mirror each other exactly
pub fn directory_is_consistent(cache: &AssociativeCacheData) -> bool {
    let forward = occupied_slots(cache).all(|(slot, tag)| cache.directory.get(&tag) == Some(&slot));
    let backward = cache
        .directory
        .iter()
        .all(|(tag, slot)| cache.tags.get(*slot) == Some(&Some(*tag)));
    forward && backward && cache.tags.len() == cache.slot_count
}
