//! Default view-dependent node scoring
//!
//! Score of a node box is its squared angular size as seen from the eye, or
//! zero when the box lies entirely outside the view frustum. An optional iso
//! weighting favours boxes whose value range contains the iso value.

use crate::bounds::{aabb_center, aabb_corners, aabb_longest_edge, Aabb};
use crate::cache::Tag;
use glam::{Mat4, Vec3};
use rand::Rng;
use std::sync::Arc;

/// Largest weight of a box whose range misses the iso value
const ISO_MISS_WEIGHT: f32 = 0.1;

/// Per-frame camera inputs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewInputs {
    pub eye: Vec3,
    /// Projection * view, depth mapped to [0, 1]
    pub proj_view: Mat4,
    /// Distance from the camera to its focus point
    pub cam_to_focus: f32,
}

/// How node value ranges are found for iso weighting
#[derive(Debug, Clone, Default, PartialEq)]
pub enum IsoWeighting {
    #[default]
    None,
    /// Value is a coordinate, the range is the box extent along `axis`
    Axis {
        axis: usize,
        limits: [f32; 2],
        value: f32,
    },
    /// `[min, max]` pairs per full-tree node
    NodeRanges {
        ranges: Arc<[f32]>,
        limits: [f32; 2],
        value: f32,
    },
}

/// Clip-space containment with depth in [0, 1]
pub fn point_in_frustum(point: Vec3, proj_view: &Mat4) -> bool {
    let clip = *proj_view * point.extend(1.0);
    if clip.w <= 0.0 {
        return false;
    }
    let ndc = clip.truncate() / clip.w;
    ndc.x.abs() <= 1.0 && ndc.y.abs() <= 1.0 && ndc.z >= 0.0
}

fn contains_point(bbox: &Aabb, point: Vec3) -> bool {
    point.cmpge(bbox.min).all() && point.cmple(bbox.max).all()
}

/// `(longest_edge / distance)^2`, zero for boxes outside the frustum
pub fn box_view_score(bbox: &Aabb, view: &ViewInputs) -> f32 {
    let visible = contains_point(bbox, view.eye)
        || aabb_corners(bbox)
            .iter()
            .any(|corner| point_in_frustum(*corner, &view.proj_view));
    if !visible {
        return 0.0;
    }
    let distance = aabb_center(bbox).distance(view.eye).max(f32::EPSILON);
    let ratio = aabb_longest_edge(bbox) / distance;
    ratio * ratio
}

/// 1 when `range` contains `value`. A range wholly below `value` is weighted
/// by how far its top reaches from the lower limit towards `value`, a range
/// above by how far its bottom reaches down from the upper limit, both scaled
/// into `[0, ISO_MISS_WEIGHT]`.
pub fn iso_weight(range: [f32; 2], limits: [f32; 2], value: f32) -> f32 {
    let [lo, hi] = range;
    let [min, max] = limits;
    let reach = if hi < value {
        (hi - min) / (value - min).max(f32::EPSILON)
    } else if lo > value {
        (max - lo) / (max - value).max(f32::EPSILON)
    } else {
        return 1.0;
    };
    ISO_MISS_WEIGHT * reach.clamp(0.0, 1.0)
}

fn iso_factor(iso: &IsoWeighting, bbox: &Aabb, full_index: Tag) -> f32 {
    match iso {
        IsoWeighting::None => 1.0,
        IsoWeighting::Axis {
            axis,
            limits,
            value,
        } => iso_weight([bbox.min[*axis], bbox.max[*axis]], *limits, *value),
        IsoWeighting::NodeRanges {
            ranges,
            limits,
            value,
        } => {
            let start = full_index as usize * 2;
            match ranges.get(start..start + 2) {
                Some(range) => iso_weight([range[0], range[1]], *limits, *value),
                None => 1.0,
            }
        }
    }
}

/// Score one node box. Without a view every node gets a uniform random score.
pub fn score_node<R: Rng + ?Sized>(
    view: Option<&ViewInputs>,
    iso: &IsoWeighting,
    bbox: &Aabb,
    full_index: Tag,
    rng: &mut R,
) -> f32 {
    let base = match view {
        Some(view) => box_view_score(bbox, view),
        None => rng.gen::<f32>(),
    };
    base * iso_factor(iso, bbox, full_index)
}

/// Views differing by at most `epsilon` in every input belong to the same epoch
pub fn view_changed(previous: Option<&ViewInputs>, next: Option<&ViewInputs>, epsilon: f32) -> bool {
    match (previous, next) {
        (None, None) => false,
        (Some(a), Some(b)) => {
            a.eye.distance(b.eye) > epsilon
                || !a.proj_view.abs_diff_eq(b.proj_view, epsilon)
                || (a.cam_to_focus - b.cam_to_focus).abs() > epsilon
        }
        _ => true,
    }
}
