/// Data-Oriented Axis-Aligned Bounding Boxes for KD traversal
///
/// Pure functions over box data. Boxes of tree nodes are never stored, they
/// are re-derived from the parent box and split value while walking.
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Axis-Aligned Bounding Box - pure data structure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

/// Which side of its parent's split a child lies on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSide {
    Left,
    Right,
}

pub fn create_aabb(min: Vec3, max: Vec3) -> Aabb {
    Aabb { min, max }
}

/// Split dimension used at a tree depth (x, y, z cycling)
#[inline]
pub fn split_dimension(depth: u32) -> usize {
    (depth % 3) as usize
}

pub fn aabb_center(aabb: &Aabb) -> Vec3 {
    (aabb.min + aabb.max) * 0.5
}

/// Length of the longest edge
pub fn aabb_longest_edge(aabb: &Aabb) -> f32 {
    (aabb.max - aabb.min).abs().max_element()
}

/// The eight corners, x varying slowest
pub fn aabb_corners(aabb: &Aabb) -> [Vec3; 8] {
    let (lo, hi) = (aabb.min, aabb.max);
    [
        Vec3::new(lo.x, lo.y, lo.z),
        Vec3::new(lo.x, lo.y, hi.z),
        Vec3::new(lo.x, hi.y, lo.z),
        Vec3::new(lo.x, hi.y, hi.z),
        Vec3::new(hi.x, lo.y, lo.z),
        Vec3::new(hi.x, lo.y, hi.z),
        Vec3::new(hi.x, hi.y, lo.z),
        Vec3::new(hi.x, hi.y, hi.z),
    ]
}

/// Box of one child after splitting `parent` at `split_val` along `dimension`
pub fn child_box(parent: &Aabb, side: ChildSide, dimension: usize, split_val: f32) -> Aabb {
    let mut child = *parent;
    match side {
        ChildSide::Left => child.max[dimension] = split_val,
        ChildSide::Right => child.min[dimension] = split_val,
    }
    child
}

/// Both child boxes of a split, left first
pub fn split_box(parent: &Aabb, dimension: usize, split_val: f32) -> (Aabb, Aabb) {
    (
        child_box(parent, ChildSide::Left, dimension, split_val),
        child_box(parent, ChildSide::Right, dimension, split_val),
    )
}

/// Midpoint split value of a box along a dimension
pub fn midpoint_split(aabb: &Aabb, dimension: usize) -> f32 {
    (aabb.min[dimension] + aabb.max[dimension]) * 0.5
}

/// Smallest box containing every point, `None` for no points
pub fn aabb_from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Aabb> {
    points.into_iter().fold(None, |acc, p| match acc {
        None => Some(Aabb { min: p, max: p }),
        Some(b) => Some(Aabb {
            min: b.min.min(p),
            max: b.max.max(p),
        }),
    })
}
