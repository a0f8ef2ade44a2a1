//! Mesh block fetch protocol
//!
//! Requests are JSON. A response is one flat little-endian buffer laid out
//! section by section, each section holding every requested block in request
//! order at fixed per-block size:
//!
//! 1. positions, `max_verts * 3` f32 per block, present in every response
//! 2. connectivity, `max_cells * verts_per_cell` u32 per block, 1-based, only when `geometry`
//! 3. per requested scalar, `max_verts` f32 per block
//!
//! Positions are sent even for scalar-only requests (`geometry == false`). A
//! server that drops them without geometry speaks a different format, and its
//! responses fail the length check.

use super::mesh_block_data::{MeshBlock, MeshBlockSizes};
use crate::cache::Tag;
use crate::error::{ErrorContext, LodError, LodResult};
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

pub const MESH_BLOCKS_MODE: &str = "meshblocks";

const WORD: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshBlockRequest {
    pub mode: String,
    /// Dataset the blocks belong to
    pub path: String,
    pub blocks: Vec<Tag>,
    pub geometry: bool,
    pub scalars: Vec<String>,
}

/// Anything that can answer mesh block requests with a response buffer
pub trait MeshBlockSource: Send + Sync {
    fn fetch_blocks<'a>(&'a self, request: &'a MeshBlockRequest) -> BoxFuture<'a, LodResult<Vec<u8>>>;
}

pub fn create_mesh_block_request(
    path: &str,
    blocks: Vec<Tag>,
    geometry: bool,
    scalars: Vec<String>,
) -> MeshBlockRequest {
    MeshBlockRequest {
        mode: MESH_BLOCKS_MODE.to_string(),
        path: path.to_string(),
        blocks,
        geometry,
        scalars,
    }
}

pub fn request_to_json(request: &MeshBlockRequest) -> LodResult<String> {
    Ok(serde_json::to_string(request)?)
}

pub fn request_from_json(text: &str) -> LodResult<MeshBlockRequest> {
    serde_json::from_str(text).context("Failed to parse mesh block request")
}

fn connectivity_len(sizes: &MeshBlockSizes) -> usize {
    sizes.max_cells * sizes.verts_per_cell
}

/// Words (4 byte elements) one block occupies in a response. Positions always count.
fn block_words(request: &MeshBlockRequest, sizes: &MeshBlockSizes) -> usize {
    let connectivity = if request.geometry {
        connectivity_len(sizes)
    } else {
        0
    };
    sizes.max_verts * 3 + connectivity + request.scalars.len() * sizes.max_verts
}

pub fn response_byte_length(request: &MeshBlockRequest, sizes: &MeshBlockSizes) -> usize {
    request.blocks.len() * block_words(request, sizes) * WORD
}

fn read_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(WORD)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn read_u32s(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(WORD)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Next `words` words of a length-checked response
fn next_section<'a>(bytes: &'a [u8], cursor: &mut usize, words: usize) -> &'a [u8] {
    let section = &bytes[*cursor..*cursor + words * WORD];
    *cursor += words * WORD;
    section
}

/// Split a response into blocks, in request order
pub fn parse_response(
    request: &MeshBlockRequest,
    sizes: &MeshBlockSizes,
    bytes: &[u8],
) -> LodResult<Vec<MeshBlock>> {
    let expected = response_byte_length(request, sizes);
    if bytes.len() != expected {
        return Err(LodError::ResponseLengthMismatch {
            expected,
            actual: bytes.len(),
        });
    }

    let mut cursor = 0;
    let mut blocks = Vec::with_capacity(request.blocks.len());
    for &index in &request.blocks {
        blocks.push(MeshBlock {
            index,
            positions: read_f32s(next_section(bytes, &mut cursor, sizes.max_verts * 3)),
            connectivity: Vec::new(),
            scalars: Vec::with_capacity(request.scalars.len()),
        });
    }

    if request.geometry {
        for block in &mut blocks {
            // 1-based on the wire, padding (0) wraps to u32::MAX
            block.connectivity = read_u32s(next_section(bytes, &mut cursor, connectivity_len(sizes)))
                .into_iter()
                .map(|v| v.wrapping_sub(1))
                .collect();
        }
    }

    for name in &request.scalars {
        for block in &mut blocks {
            let values = read_f32s(next_section(bytes, &mut cursor, sizes.max_verts));
            block.scalars.push((name.clone(), values));
        }
    }

    Ok(blocks)
}

/// Fetch `indices` in requests of at most `max_blocks_per_request` blocks
pub async fn fetch_mesh_blocks(
    source: &dyn MeshBlockSource,
    path: &str,
    indices: &[Tag],
    geometry: bool,
    scalars: &[String],
    sizes: &MeshBlockSizes,
    max_blocks_per_request: usize,
) -> LodResult<Vec<MeshBlock>> {
    let requests: Vec<MeshBlockRequest> = indices
        .chunks(max_blocks_per_request.max(1))
        .map(|chunk| create_mesh_block_request(path, chunk.to_vec(), geometry, scalars.to_vec()))
        .collect();

    log::debug!(
        "[MeshFetch] Fetching {} blocks in {} requests from '{}'",
        indices.len(),
        requests.len(),
        path
    );

    let responses = try_join_all(requests.iter().map(|r| source.fetch_blocks(r))).await?;

    let mut blocks = Vec::with_capacity(indices.len());
    for (request, bytes) in requests.iter().zip(responses) {
        blocks.extend(parse_response(request, sizes, &bytes)?);
    }
    Ok(blocks)
}

/// Unpadded block data as held by a data source, connectivity 0-based
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceBlock {
    pub positions: Vec<f32>,
    pub connectivity: Vec<u32>,
    pub scalars: FxHashMap<String, Vec<f32>>,
}

/// Serves a whole dataset from memory, answering in the wire format
#[derive(Debug)]
pub struct InMemoryBlockSource {
    pub path: String,
    pub sizes: MeshBlockSizes,
    pub blocks: FxHashMap<Tag, SourceBlock>,
    requests: AtomicUsize,
}

impl InMemoryBlockSource {
    pub fn new(path: &str, sizes: MeshBlockSizes) -> Self {
        Self {
            path: path.to_string(),
            sizes,
            blocks: FxHashMap::default(),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn insert_block(&mut self, index: Tag, block: SourceBlock) {
        self.blocks.insert(index, block);
    }

    /// Requests answered so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    fn block(&self, index: Tag) -> LodResult<&SourceBlock> {
        self.blocks.get(&index).ok_or(LodError::MissingBlock { index })
    }

    fn padded<T: Copy>(data: &[T], len: usize, pad: T, what: &str, index: Tag) -> LodResult<Vec<T>> {
        if data.len() > len {
            return Err(LodError::FetchFailed {
                reason: format!("{} of block {} exceed the block size ({} > {})", what, index, data.len(), len),
            });
        }
        let mut out = data.to_vec();
        out.resize(len, pad);
        Ok(out)
    }

    /// Encode the response for `request`
    pub fn encode_response(&self, request: &MeshBlockRequest) -> LodResult<Vec<u8>> {
        if request.mode != MESH_BLOCKS_MODE || request.path != self.path {
            return Err(LodError::FetchFailed {
                reason: format!("unknown request '{}' for '{}'", request.mode, request.path),
            });
        }

        let sizes = &self.sizes;
        let mut out = Vec::with_capacity(response_byte_length(request, sizes));

        for &index in &request.blocks {
            let block = self.block(index)?;
            for v in Self::padded(&block.positions, sizes.max_verts * 3, 0.0, "positions", index)? {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }

        if request.geometry {
            for &index in &request.blocks {
                let block = self.block(index)?;
                let one_based: Vec<u32> = block.connectivity.iter().map(|v| v + 1).collect();
                for v in Self::padded(&one_based, connectivity_len(sizes), 0, "connectivity", index)? {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        }

        for name in &request.scalars {
            for &index in &request.blocks {
                let values = self.block(index)?.scalars.get(name).ok_or_else(|| {
                    LodError::FetchFailed {
                        reason: format!("block {} has no scalar '{}'", index, name),
                    }
                })?;
                for v in Self::padded(values, sizes.max_verts, 0.0, name, index)? {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        }

        Ok(out)
    }
}

impl MeshBlockSource for InMemoryBlockSource {
    fn fetch_blocks<'a>(&'a self, request: &'a MeshBlockRequest) -> BoxFuture<'a, LodResult<Vec<u8>>> {
        async move {
            self.requests.fetch_add(1, Ordering::Relaxed);
            self.encode_response(request)
        }
        .boxed()
    }
}
