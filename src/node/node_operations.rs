//! Tree Node Operations - Pure DOP Functions
//!
//! Encode and decode node records in flat byte buffers. Pointer fields are
//! stored as-is; keeping them in range is the caller's job.

use super::node_data::{
    DecodedNode, NodeRecord, NodeUpdate, CELL_COUNT_OFFSET, LEFT_PTR_OFFSET, NODE_BYTE_LENGTH,
    PARENT_PTR_OFFSET, RIGHT_PTR_OFFSET, SPLIT_VAL_OFFSET,
};
use crate::error::{LodError, LodResult};

/// Check if a record is a leaf
pub fn is_leaf(record: &NodeRecord) -> bool {
    record.right_ptr == 0
}

/// Number of whole records in a byte buffer
pub fn node_count(buffer: &[u8]) -> usize {
    buffer.len() / NODE_BYTE_LENGTH
}

fn record_range(buffer_len: usize, index: usize) -> LodResult<std::ops::Range<usize>> {
    let start = index * NODE_BYTE_LENGTH;
    let end = start + NODE_BYTE_LENGTH;
    if end > buffer_len {
        return Err(LodError::SlotOutOfRange {
            slot: index,
            slot_count: buffer_len / NODE_BYTE_LENGTH,
        });
    }
    Ok(start..end)
}

/// Read the record at `index`
pub fn read_node(buffer: &[u8], index: usize) -> LodResult<DecodedNode> {
    let range = record_range(buffer.len(), index)?;
    let record: NodeRecord = bytemuck::pod_read_unaligned(&buffer[range]);
    Ok(DecodedNode {
        this_ptr: index as u32,
        record,
    })
}

/// Write every field of `record` at `index`
pub fn write_node(buffer: &mut [u8], index: usize, record: &NodeRecord) -> LodResult<()> {
    let range = record_range(buffer.len(), index)?;
    buffer[range].copy_from_slice(bytemuck::bytes_of(record));
    Ok(())
}

/// Write only the fields set in `update`, other bytes stay as they are
pub fn update_node(buffer: &mut [u8], index: usize, update: &NodeUpdate) -> LodResult<()> {
    let range = record_range(buffer.len(), index)?;
    let bytes = &mut buffer[range];

    if let Some(split_val) = update.split_val {
        write_field(bytes, SPLIT_VAL_OFFSET, bytemuck::bytes_of(&split_val));
    }
    if let Some(cell_count) = update.cell_count {
        write_field(bytes, CELL_COUNT_OFFSET, bytemuck::bytes_of(&cell_count));
    }
    if let Some(parent_ptr) = update.parent_ptr {
        write_field(bytes, PARENT_PTR_OFFSET, bytemuck::bytes_of(&parent_ptr));
    }
    if let Some(left_ptr) = update.left_ptr {
        write_field(bytes, LEFT_PTR_OFFSET, bytemuck::bytes_of(&left_ptr));
    }
    if let Some(right_ptr) = update.right_ptr {
        write_field(bytes, RIGHT_PTR_OFFSET, bytemuck::bytes_of(&right_ptr));
    }
    Ok(())
}

#[inline]
fn write_field(record_bytes: &mut [u8], offset: usize, value: &[u8]) {
    record_bytes[offset..offset + 4].copy_from_slice(value);
}

/// Full update built from a record
pub fn full_update(record: &NodeRecord) -> NodeUpdate {
    NodeUpdate {
        split_val: Some(record.split_val),
        cell_count: Some(record.cell_count),
        parent_ptr: Some(record.parent_ptr),
        left_ptr: Some(record.left_ptr),
        right_ptr: Some(record.right_ptr),
    }
}

/// Encode a slice of records into a fresh byte buffer
pub fn encode_nodes(records: &[NodeRecord]) -> Vec<u8> {
    bytemuck::cast_slice(records).to_vec()
}

/// Decode a whole byte buffer into records
pub fn decode_nodes(buffer: &[u8]) -> LodResult<Vec<NodeRecord>> {
    if buffer.len() % NODE_BYTE_LENGTH != 0 {
        return Err(LodError::InvalidTree {
            reason: format!(
                "node buffer of {} bytes is not a multiple of {}",
                buffer.len(),
                NODE_BYTE_LENGTH
            ),
        });
    }
    Ok(bytemuck::pod_collect_to_vec(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NodeRecord {
        NodeRecord {
            split_val: -3.25,
            cell_count: 17,
            parent_ptr: 4,
            left_ptr: 9,
            right_ptr: 10,
        }
    }

    #[test]
    fn test_write_then_read() {
        let mut buffer = vec![0u8; 3 * NODE_BYTE_LENGTH];
        write_node(&mut buffer, 2, &sample()).expect("Failed to write node");

        let decoded = read_node(&buffer, 2).expect("Failed to read node");
        assert_eq!(decoded.this_ptr, 2);
        assert_eq!(decoded.record, sample());
        // neighbouring records untouched
        assert_eq!(read_node(&buffer, 1).unwrap().record, NodeRecord::default());
    }

    #[test]
    fn test_partial_update_leaves_other_bytes() {
        let mut buffer = vec![0u8; NODE_BYTE_LENGTH];
        write_node(&mut buffer, 0, &sample()).unwrap();
        let before = buffer.clone();

        update_node(
            &mut buffer,
            0,
            &NodeUpdate {
                left_ptr: Some(77),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(buffer[..LEFT_PTR_OFFSET], before[..LEFT_PTR_OFFSET]);
        assert_eq!(buffer[RIGHT_PTR_OFFSET..], before[RIGHT_PTR_OFFSET..]);
        let record = read_node(&buffer, 0).unwrap().record;
        assert_eq!(record.left_ptr, 77);
        assert_eq!(record.split_val, -3.25);
    }

    #[test]
    fn test_extreme_values_survive() {
        let record = NodeRecord {
            split_val: f32::NEG_INFINITY,
            cell_count: u32::MAX,
            parent_ptr: 0,
            left_ptr: u32::MAX - 1,
            right_ptr: 1,
        };
        let mut buffer = vec![0u8; NODE_BYTE_LENGTH];
        update_node(&mut buffer, 0, &full_update(&record)).unwrap();
        assert_eq!(read_node(&buffer, 0).unwrap().record, record);
    }

    #[test]
    fn test_out_of_range_is_error() {
        let buffer = vec![0u8; NODE_BYTE_LENGTH];
        assert!(matches!(
            read_node(&buffer, 1),
            Err(LodError::SlotOutOfRange { slot: 1, slot_count: 1 })
        ));
    }

    #[test]
    fn test_decode_rejects_ragged_buffer() {
        assert!(decode_nodes(&[0u8; NODE_BYTE_LENGTH + 3]).is_err());
        let records = vec![sample(), NodeRecord::default()];
        assert_eq!(decode_nodes(&encode_nodes(&records)).unwrap(), records);
    }

    #[test]
    fn test_decode_unaligned_buffer() {
        let records = vec![sample(), sample()];
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&encode_nodes(&records));
        assert_eq!(decode_nodes(&bytes[1..]).expect("Failed to decode"), records);
    }
}
