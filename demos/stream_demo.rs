//! Stream a synthetic tetrahedral dataset
//!
//! Builds a KD tree over random cells, serves the leaf blocks from memory and
//! orbits a camera around the dataset while the dynamic tree and the mesh
//! block cache follow the view.

use glam::{Mat4, Vec3};
use lod_stream::{
    bounds::{aabb_center, create_aabb, midpoint_split, split_box, split_dimension},
    create_lod_session, create_shared_session, destroy_lod_session, stream_mesh_blocks,
    update_frame, Aabb, FullTree, InMemoryBlockSource, LodConfig, MeshBlockSizes, NodeRecord,
    SourceBlock, ViewInputs,
};
use rand::Rng;
use std::sync::Arc;

const DATASET: &str = "synthetic.vtu";
const CELL_COUNT: usize = 20_000;
const CELLS_PER_LEAF: usize = 32;
const MAX_DEPTH: u32 = 20;
const FRAMES: usize = 120;

struct Dataset {
    tree: FullTree,
    sizes: MeshBlockSizes,
    source: InMemoryBlockSource,
}

/// Split `ids` at box midpoints until leaves are small, appending records in preorder
fn build_node(
    centroids: &[Vec3],
    ids: Vec<u32>,
    bbox: Aabb,
    depth: u32,
    parent: u32,
    nodes: &mut Vec<NodeRecord>,
    cells: &mut Vec<u32>,
) -> u32 {
    let index = nodes.len() as u32;
    nodes.push(NodeRecord {
        parent_ptr: parent,
        ..Default::default()
    });

    if ids.len() <= CELLS_PER_LEAF || depth >= MAX_DEPTH {
        nodes[index as usize].left_ptr = cells.len() as u32;
        nodes[index as usize].cell_count = ids.len() as u32;
        cells.extend(ids);
        return index;
    }

    let dimension = split_dimension(depth);
    let split_val = midpoint_split(&bbox, dimension);
    let (left_box, right_box) = split_box(&bbox, dimension, split_val);
    let (left_ids, right_ids): (Vec<u32>, Vec<u32>) = ids
        .into_iter()
        .partition(|&id| centroids[id as usize][dimension] < split_val);

    let left = build_node(centroids, left_ids, left_box, depth + 1, index, nodes, cells);
    let right = build_node(centroids, right_ids, right_box, depth + 1, index, nodes, cells);
    nodes[index as usize].split_val = split_val;
    nodes[index as usize].left_ptr = left;
    nodes[index as usize].right_ptr = right;
    index
}

fn build_dataset() -> anyhow::Result<Dataset> {
    let mut rng = rand::thread_rng();
    let extent = create_aabb(Vec3::splat(-1.0), Vec3::splat(1.0));
    let centroids: Vec<Vec3> = (0..CELL_COUNT)
        .map(|_| {
            Vec3::new(
                rng.gen_range(-0.98..0.98),
                rng.gen_range(-0.98..0.98),
                rng.gen_range(-0.98..0.98),
            )
        })
        .collect();

    let mut nodes = Vec::new();
    let mut cells = Vec::new();
    build_node(&centroids, (0..CELL_COUNT as u32).collect(), extent, 0, 0, &mut nodes, &mut cells);
    let tree = FullTree::new(nodes, cells, extent)?;

    let max_cells = tree.max_leaf_cells() as usize;
    let sizes = MeshBlockSizes {
        max_verts: 4 * max_cells,
        max_cells,
        verts_per_cell: 4,
    };
    let mut source = InMemoryBlockSource::new(DATASET, sizes);

    let offsets = [
        Vec3::new(0.01, 0.0, 0.0),
        Vec3::new(-0.01, 0.01, 0.0),
        Vec3::new(-0.01, -0.01, 0.0),
        Vec3::new(0.0, 0.0, 0.015),
    ];
    for leaf in tree.leaf_indices() {
        let mut block = SourceBlock::default();
        let mut pressure = Vec::new();
        for (local, &cell) in tree.leaf_cells(leaf)?.iter().enumerate() {
            let centroid = centroids[cell as usize];
            for offset in offsets {
                let vertex = centroid + offset;
                block.positions.extend_from_slice(&vertex.to_array());
                pressure.push(vertex.length());
            }
            let base = (local * 4) as u32;
            block.connectivity.extend(base..base + 4);
        }
        block.scalars.insert("pressure".to_string(), pressure);
        source.insert_block(leaf, block);
    }

    Ok(Dataset {
        tree,
        sizes,
        source,
    })
}

fn orbit_view(frame: usize, focus: Vec3) -> ViewInputs {
    let angle = frame as f32 / FRAMES as f32 * std::f32::consts::TAU;
    let eye = focus + Vec3::new(angle.cos() * 2.5, 0.8, angle.sin() * 2.5);
    let proj = Mat4::perspective_rh(0.9, 16.0 / 9.0, 0.05, 50.0);
    ViewInputs {
        eye,
        proj_view: proj * Mat4::look_at_rh(eye, focus, Vec3::Y),
        cam_to_focus: eye.distance(focus),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let dataset = build_dataset()?;
    println!(
        "Built {} nodes over {} cells ({} leaves)",
        dataset.tree.len(),
        CELL_COUNT,
        dataset.tree.leaf_indices().count()
    );

    let config = LodConfig {
        dynamic_node_count: 512,
        mesh_block_count: 96,
        treelet_depth: 3,
        modify_list_fraction: 0.02,
        ..Default::default()
    };
    let focus = aabb_center(dataset.tree.extent());
    let session =
        create_lod_session(config, Arc::new(dataset.tree), Some(dataset.sizes), DATASET)?;
    let shared = create_shared_session(session);

    for frame in 0..FRAMES {
        let report = update_frame(&mut shared.write(), Some(orbit_view(frame, focus)))?;
        let loaded = pollster::block_on(stream_mesh_blocks(&shared, &dataset.source))?;
        if frame % 20 == 0 {
            println!(
                "frame {:3}: {} leaves, {} merge/split pairs, {} blocks loaded",
                report.frame, report.leaves, report.nodes_modified, loaded
            );
        }
    }

    let session = Arc::try_unwrap(shared)
        .map_err(|_| anyhow::anyhow!("session still shared"))?
        .into_inner();
    let stats = destroy_lod_session(session);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("{} block requests served", dataset.source.request_count());
    Ok(())
}
