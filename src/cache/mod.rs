//! Slot caches
//!
//! `AssociativeCacheData` is a fixed-slot, tag-addressed store over parallel
//! typed channels. `ScoredCacheData` wraps it with a score per slot and
//! score-driven replacement. The dynamic tree keeps its nodes in the former,
//! the mesh block cache keeps its blocks in the latter.

pub mod associative_cache_operations;
pub mod cache_data;
pub mod codec;
pub mod scored_cache_operations;

pub use associative_cache_operations::{
    channel_storage, channel_stride, create_associative_cache, create_channel,
    create_channel_with_codec, directory_is_consistent, evict_at, get_slot_for_tag,
    grow_channel_stride, has_channel, insert_at, insert_at_random, occupied_count, occupied_slots,
    read_at, read_node_at, resync_channel, set_codec, tag_at, update_at,
};
pub use cache_data::{
    AssociativeCacheData, Channel, ChannelStorage, ChannelValue, ElementType, InsertOutcome,
    ScoredCacheData, Tag,
};
pub use codec::{ChannelCodec, NodeCodec, SliceCodec};
pub use scored_cache_operations::{
    create_scored_cache, release_slot, score_at, scored_insert, should_load, sync_scores,
    worst_score,
};
