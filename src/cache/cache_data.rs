//! Associative Cache Data - Pure DOP
//!
//! NO METHODS. Just data.
//! All transformations happen in associative_cache_operations.rs and
//! scored_cache_operations.rs

use super::codec::ChannelCodec;
use crate::node::{DecodedNode, NodeUpdate};
use rustc_hash::FxHashMap;

/// Key a slot is addressed by (full-tree node index for every cache in this crate)
pub type Tag = u32;

/// Element type of a channel's flat buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F32,
    U32,
    U8,
}

/// Flat typed buffer of `slot_count * stride` elements
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelStorage {
    F32(Vec<f32>),
    U32(Vec<u32>),
    U8(Vec<u8>),
}

/// A value written into or read out of one channel slot
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelValue {
    F32(Vec<f32>),
    U32(Vec<u32>),
    U8(Vec<u8>),
    /// Partial node write for node-coded channels
    NodeWrite(NodeUpdate),
    /// Decoded node from a node-coded channel
    NodeRead(DecodedNode),
}

/// One named channel of a cache
#[derive(Debug)]
pub struct Channel {
    pub element_type: ElementType,
    /// Elements per slot
    pub stride: usize,
    pub storage: ChannelStorage,
    pub codec: Box<dyn ChannelCodec>,
}

/// Fixed-slot, fully associative cache over parallel channels
#[derive(Debug)]
pub struct AssociativeCacheData {
    pub slot_count: usize,
    /// slot -> tag, `None` for unoccupied slots
    pub tags: Vec<Option<Tag>>,
    /// tag -> slot
    pub directory: FxHashMap<Tag, usize>,
    pub channels: FxHashMap<String, Channel>,
}

/// Result of installing a tag into a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub slot: usize,
    /// Tag that previously occupied the slot, if it was a different one
    pub evicted: Option<Tag>,
}

/// Associative cache with a relevance score per slot
///
/// Unoccupied slots score as negative infinity.
#[derive(Debug)]
pub struct ScoredCacheData {
    pub cache: AssociativeCacheData,
    /// Reserved score channel, one entry per slot
    pub scores: Vec<f32>,
}
