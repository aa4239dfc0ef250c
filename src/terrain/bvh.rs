//! Bounding-volume hierarchy over a tile's triangles.
//!
//! Built off the render thread once a tile's mesh exists and attached to the
//! tile afterwards. The hierarchy has two levels: a root box and one leaf box
//! per square block of grid quads, which is enough to answer ground-height
//! queries without walking all 8192 triangles.

use bevy::math::{Vec2, Vec3};
use thiserror::Error;

use crate::constants;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpatialIndexError {
    #[error("geometry has no triangles")]
    EmptyGeometry,
    #[error("index buffer references vertex {index} of {vertex_count}")]
    MalformedIndices { index: u32, vertex_count: usize },
}

/// Positions and indices handed to the worker.
#[derive(Debug, Clone, Default)]
pub struct TileGeometry {
    pub positions: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    fn grow(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    fn merge(&mut self, other: &Aabb) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn contains_planar(&self, point: Vec2) -> bool {
        point.x >= self.min.x && point.x <= self.max.x && point.y >= self.min.y && point.y <= self.max.y
    }
}

#[derive(Debug, Clone)]
struct Leaf {
    bounds: Aabb,
    triangles: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct TileBvh {
    root: Aabb,
    leaves: Vec<Leaf>,
    positions: Vec<[f32; 3]>,
    indices: Vec<u32>,
}

impl TileBvh {
    pub fn bounds(&self) -> Aabb {
        self.root
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Interpolated surface height at a tile-local planar point, or `None`
    /// outside the tile.
    pub fn height_at(&self, point: Vec2) -> Option<f32> {
        if !self.root.contains_planar(point) {
            return None;
        }
        self.leaves
            .iter()
            .filter(|leaf| leaf.bounds.contains_planar(point))
            .flat_map(|leaf| leaf.triangles.iter())
            .find_map(|&triangle| self.height_in_triangle(triangle, point))
    }

    fn height_in_triangle(&self, triangle: u32, point: Vec2) -> Option<f32> {
        let base = triangle as usize * 3;
        let [a, b, c] = [0, 1, 2].map(|k| Vec3::from(self.positions[self.indices[base + k] as usize]));

        let v0 = b.truncate() - a.truncate();
        let v1 = c.truncate() - a.truncate();
        let v2 = point - a.truncate();
        let denom = v0.perp_dot(v1);
        if denom.abs() < f32::EPSILON {
            return None;
        }
        let s = v2.perp_dot(v1) / denom;
        let t = v0.perp_dot(v2) / denom;
        const SLACK: f32 = -1e-4;
        if s < SLACK || t < SLACK || s + t > 1.0 - SLACK {
            return None;
        }
        Some(a.z + s * (b.z - a.z) + t * (c.z - a.z))
    }
}

/// Builds the spatial structure for a tile's geometry.
pub trait SpatialIndexBuilder: Send + Sync + 'static {
    fn generate(&self, geometry: &TileGeometry) -> Result<TileBvh, SpatialIndexError>;
}

/// Groups triangles by the square block of grid quads they belong to.
/// Assumes the index layout of [`super::mesh::build_terrain_mesh`]: two
/// triangles per quad, quads in row-major order.
#[derive(Debug, Clone, Copy)]
pub struct GridBvhBuilder {
    pub leaf_quads: u32,
}

impl Default for GridBvhBuilder {
    fn default() -> Self {
        Self {
            leaf_quads: constants::BVH_LEAF_QUADS,
        }
    }
}

impl SpatialIndexBuilder for GridBvhBuilder {
    fn generate(&self, geometry: &TileGeometry) -> Result<TileBvh, SpatialIndexError> {
        let triangle_count = geometry.indices.len() / 3;
        if triangle_count == 0 {
            return Err(SpatialIndexError::EmptyGeometry);
        }
        let vertex_count = geometry.positions.len();
        if let Some(&index) = geometry.indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(SpatialIndexError::MalformedIndices { index, vertex_count });
        }

        // Quads per side; non-grid input degrades to a single leaf.
        let quads = triangle_count / 2;
        let side = (quads as f64).sqrt() as usize;
        let grid = side > 0 && side * side * 2 == triangle_count;
        let leaf_quads = self.leaf_quads.max(1) as usize;
        let blocks = if grid { side.div_ceil(leaf_quads) } else { 1 };

        let mut leaves: Vec<Leaf> = (0..blocks * blocks)
            .map(|_| Leaf {
                bounds: Aabb::empty(),
                triangles: Vec::new(),
            })
            .collect();

        for triangle in 0..triangle_count {
            let leaf = if grid {
                let quad = triangle / 2;
                let (row, col) = (quad / side, quad % side);
                (row / leaf_quads) * blocks + col / leaf_quads
            } else {
                0
            };
            let entry = &mut leaves[leaf];
            for k in 0..3 {
                let vertex = geometry.indices[triangle * 3 + k] as usize;
                entry.bounds.grow(Vec3::from(geometry.positions[vertex]));
            }
            entry.triangles.push(triangle as u32);
        }

        let mut root = Aabb::empty();
        for leaf in &leaves {
            root.merge(&leaf.bounds);
        }

        Ok(TileBvh {
            root,
            leaves,
            positions: geometry.positions.clone(),
            indices: geometry.indices.clone(),
        })
    }
}
