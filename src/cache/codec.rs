//! Per-channel read/write codecs
//!
//! A channel's codec is picked when the channel is created and can be swapped
//! later with `set_codec`. The default `SliceCodec` copies plain element
//! slices; `NodeCodec` stores node records in a byte channel.

use super::cache_data::{ChannelStorage, ChannelValue};
use crate::error::{LodError, LodResult};
use crate::node::{read_node, update_node, NODE_BYTE_LENGTH};

/// Encode/decode one slot of a channel
pub trait ChannelCodec: Send + Sync + std::fmt::Debug {
    /// Would `encode` accept `value`. Called before a slot is touched.
    fn check(
        &self,
        channel: &str,
        storage: &ChannelStorage,
        stride: usize,
        value: &ChannelValue,
    ) -> LodResult<()>;

    fn encode(
        &self,
        channel: &str,
        storage: &mut ChannelStorage,
        slot: usize,
        stride: usize,
        value: &ChannelValue,
    ) -> LodResult<()>;

    fn decode(
        &self,
        channel: &str,
        storage: &ChannelStorage,
        slot: usize,
        stride: usize,
    ) -> LodResult<ChannelValue>;
}

/// Copies up to `stride` elements into the slot
#[derive(Debug, Clone, Copy, Default)]
pub struct SliceCodec;

fn check_len(channel: &str, len: usize, stride: usize) -> LodResult<()> {
    if len > stride {
        return Err(LodError::ChannelOverflow {
            name: channel.to_string(),
            len,
            stride,
        });
    }
    Ok(())
}

fn copy_into<T: Copy>(
    channel: &str,
    buffer: &mut [T],
    data: &[T],
    slot: usize,
    stride: usize,
) -> LodResult<()> {
    check_len(channel, data.len(), stride)?;
    let start = slot * stride;
    buffer[start..start + data.len()].copy_from_slice(data);
    Ok(())
}

fn mismatch(channel: &str, expected: &str) -> LodError {
    LodError::ChannelTypeMismatch {
        name: channel.to_string(),
        expected: expected.to_string(),
    }
}

impl ChannelCodec for SliceCodec {
    fn check(
        &self,
        channel: &str,
        storage: &ChannelStorage,
        stride: usize,
        value: &ChannelValue,
    ) -> LodResult<()> {
        match (storage, value) {
            (ChannelStorage::F32(_), ChannelValue::F32(data)) => check_len(channel, data.len(), stride),
            (ChannelStorage::U32(_), ChannelValue::U32(data)) => check_len(channel, data.len(), stride),
            (ChannelStorage::U8(_), ChannelValue::U8(data)) => check_len(channel, data.len(), stride),
            (ChannelStorage::F32(_), _) => Err(mismatch(channel, "f32")),
            (ChannelStorage::U32(_), _) => Err(mismatch(channel, "u32")),
            (ChannelStorage::U8(_), _) => Err(mismatch(channel, "u8")),
        }
    }

    fn encode(
        &self,
        channel: &str,
        storage: &mut ChannelStorage,
        slot: usize,
        stride: usize,
        value: &ChannelValue,
    ) -> LodResult<()> {
        match (storage, value) {
            (ChannelStorage::F32(buffer), ChannelValue::F32(data)) => {
                copy_into(channel, buffer, data, slot, stride)
            }
            (ChannelStorage::U32(buffer), ChannelValue::U32(data)) => {
                copy_into(channel, buffer, data, slot, stride)
            }
            (ChannelStorage::U8(buffer), ChannelValue::U8(data)) => {
                copy_into(channel, buffer, data, slot, stride)
            }
            (ChannelStorage::F32(_), _) => Err(mismatch(channel, "f32")),
            (ChannelStorage::U32(_), _) => Err(mismatch(channel, "u32")),
            (ChannelStorage::U8(_), _) => Err(mismatch(channel, "u8")),
        }
    }

    fn decode(
        &self,
        _channel: &str,
        storage: &ChannelStorage,
        slot: usize,
        stride: usize,
    ) -> LodResult<ChannelValue> {
        let range = slot * stride..(slot + 1) * stride;
        Ok(match storage {
            ChannelStorage::F32(buffer) => ChannelValue::F32(buffer[range].to_vec()),
            ChannelStorage::U32(buffer) => ChannelValue::U32(buffer[range].to_vec()),
            ChannelStorage::U8(buffer) => ChannelValue::U8(buffer[range].to_vec()),
        })
    }
}

/// Node records in a `U8` channel of stride `NODE_BYTE_LENGTH`
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeCodec;

impl ChannelCodec for NodeCodec {
    fn check(
        &self,
        channel: &str,
        storage: &ChannelStorage,
        stride: usize,
        value: &ChannelValue,
    ) -> LodResult<()> {
        if !matches!(storage, ChannelStorage::U8(_)) {
            return Err(mismatch(channel, "u8 node"));
        }
        match value {
            ChannelValue::NodeWrite(_) => Ok(()),
            ChannelValue::U8(data) => check_len(channel, data.len(), stride),
            _ => Err(mismatch(channel, "node")),
        }
    }

    fn encode(
        &self,
        channel: &str,
        storage: &mut ChannelStorage,
        slot: usize,
        stride: usize,
        value: &ChannelValue,
    ) -> LodResult<()> {
        let ChannelStorage::U8(buffer) = storage else {
            return Err(mismatch(channel, "u8 node"));
        };
        debug_assert_eq!(stride, NODE_BYTE_LENGTH);
        match value {
            ChannelValue::NodeWrite(update) => update_node(buffer, slot, update),
            // pre-encoded record bytes
            ChannelValue::U8(data) => copy_into(channel, buffer, data, slot, stride),
            _ => Err(mismatch(channel, "node")),
        }
    }

    fn decode(
        &self,
        channel: &str,
        storage: &ChannelStorage,
        slot: usize,
        _stride: usize,
    ) -> LodResult<ChannelValue> {
        let ChannelStorage::U8(buffer) = storage else {
            return Err(mismatch(channel, "u8 node"));
        };
        Ok(ChannelValue::NodeRead(read_node(buffer, slot)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeUpdate;

    #[test]
    fn test_slice_codec_short_write_keeps_tail() {
        let mut storage = ChannelStorage::U32(vec![9; 8]);
        SliceCodec
            .encode("cells", &mut storage, 1, 4, &ChannelValue::U32(vec![1, 2]))
            .expect("Failed to encode");
        assert_eq!(storage, ChannelStorage::U32(vec![9, 9, 9, 9, 1, 2, 9, 9]));
    }

    #[test]
    fn test_slice_codec_overflow() {
        let mut storage = ChannelStorage::F32(vec![0.0; 4]);
        let err = SliceCodec
            .encode("positions", &mut storage, 0, 2, &ChannelValue::F32(vec![1.0; 3]))
            .unwrap_err();
        assert!(matches!(err, LodError::ChannelOverflow { len: 3, stride: 2, .. }));
    }

    #[test]
    fn test_slice_codec_type_mismatch() {
        let mut storage = ChannelStorage::F32(vec![0.0; 4]);
        let err = SliceCodec
            .encode("positions", &mut storage, 0, 2, &ChannelValue::U32(vec![1]))
            .unwrap_err();
        assert!(matches!(err, LodError::ChannelTypeMismatch { .. }));
    }

    #[test]
    fn test_check_matches_encode() {
        let storage = ChannelStorage::U8(vec![0; 2 * NODE_BYTE_LENGTH]);
        assert!(NodeCodec
            .check("nodes", &storage, NODE_BYTE_LENGTH, &ChannelValue::F32(vec![1.0]))
            .is_err());
        assert!(NodeCodec
            .check("nodes", &storage, NODE_BYTE_LENGTH, &ChannelValue::NodeWrite(NodeUpdate::default()))
            .is_ok());

        let storage = ChannelStorage::F32(vec![0.0; 4]);
        assert!(SliceCodec
            .check("positions", &storage, 2, &ChannelValue::F32(vec![1.0; 3]))
            .is_err());
        assert!(SliceCodec
            .check("positions", &storage, 2, &ChannelValue::F32(vec![1.0; 2]))
            .is_ok());
    }

    #[test]
    fn test_node_codec_partial_write() {
        let mut storage = ChannelStorage::U8(vec![0; 2 * NODE_BYTE_LENGTH]);
        let update = NodeUpdate {
            cell_count: Some(5),
            right_ptr: Some(3),
            ..Default::default()
        };
        NodeCodec
            .encode("nodes", &mut storage, 1, NODE_BYTE_LENGTH, &ChannelValue::NodeWrite(update))
            .unwrap();

        let ChannelValue::NodeRead(node) = NodeCodec
            .decode("nodes", &storage, 1, NODE_BYTE_LENGTH)
            .unwrap()
        else {
            panic!("node codec must decode to a node");
        };
        assert_eq!(node.this_ptr, 1);
        assert_eq!(node.record.cell_count, 5);
        assert_eq!(node.record.right_ptr, 3);
        assert_eq!(node.record.left_ptr, 0);
    }
}
