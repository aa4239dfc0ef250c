//! Heightmap + imagery to textured grid mesh.
//!
//! Geometry is built in tile-local Z-up space: `x` east and `y` north over
//! `[0, extent]`, `z` the decoded elevation. Tiles are placed in the Y-up
//! world with [`crate::geo::zup_to_yup_rotation`], which turns the +Z face
//! normals produced here into +Y.

use bevy::asset::RenderAssetUsages;
use bevy::image::{ImageSampler, ImageSamplerDescriptor};
use bevy::mesh::{Indices, PrimitiveTopology};
use bevy::prelude::*;
use bevy::render::render_resource::{Extent3d, TextureDimension, TextureFormat};
use image::imageops::FilterType;
use image::RgbaImage;
use thiserror::Error;

use super::bvh::TileGeometry;
use super::elevation;
use crate::constants;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MeshBuildError {
    #[error("heightmap has no pixels")]
    EmptyHeightmap,
    #[error("imagery has no pixels")]
    EmptyImagery,
    #[error("mesh resolution must be between 1 and {} quads per side", constants::MAX_MESH_RESOLUTION)]
    Resolution,
}

#[derive(Debug, Clone, Copy)]
pub struct MeshSettings {
    /// Quads per tile side
    pub resolution: u32,
    /// Longest allowed texture side after downsampling
    pub texture_max_size: u32,
    pub anisotropy: u16,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            resolution: constants::MESH_RESOLUTION,
            texture_max_size: constants::TEXTURE_MAX_SIZE,
            anisotropy: constants::TEXTURE_ANISOTROPY,
        }
    }
}

/// CPU-side result of a mesh build; converted into Bevy assets on the main
/// thread.
#[derive(Debug, Clone)]
pub struct TerrainMesh {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
    pub texture: RgbaImage,
    pub anisotropy: u16,
}

impl TerrainMesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn geometry(&self) -> TileGeometry {
        TileGeometry {
            positions: self.positions.clone(),
            indices: self.indices.clone(),
        }
    }

    pub fn to_mesh(&self) -> Mesh {
        let mut mesh = Mesh::new(
            PrimitiveTopology::TriangleList,
            RenderAssetUsages::default(),
        );
        mesh.insert_attribute(Mesh::ATTRIBUTE_POSITION, self.positions.clone());
        mesh.insert_attribute(Mesh::ATTRIBUTE_NORMAL, self.normals.clone());
        mesh.insert_attribute(Mesh::ATTRIBUTE_UV_0, self.uvs.clone());
        mesh.insert_indices(Indices::U32(self.indices.clone()));
        mesh
    }

    pub fn to_image(&self) -> Image {
        let (width, height) = self.texture.dimensions();
        let mut image = Image::new(
            Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            TextureDimension::D2,
            self.texture.as_raw().clone(),
            TextureFormat::Rgba8UnormSrgb,
            RenderAssetUsages::default(),
        );
        // Anisotropic filtering requires linear min/mag/mip filters.
        image.sampler = ImageSampler::Descriptor(ImageSamplerDescriptor {
            anisotropy_clamp: self.anisotropy.max(1),
            ..ImageSamplerDescriptor::linear()
        });
        image
    }
}

/// Build the grid mesh for a tile of side `extent` metres.
pub fn build_terrain_mesh(
    extent: f32,
    heightmap: &RgbaImage,
    imagery: &RgbaImage,
    settings: &MeshSettings,
) -> Result<TerrainMesh, MeshBuildError> {
    let res = settings.resolution;
    if res == 0 || res > constants::MAX_MESH_RESOLUTION {
        return Err(MeshBuildError::Resolution);
    }
    let (hm_width, hm_height) = heightmap.dimensions();
    if hm_width == 0 || hm_height == 0 {
        return Err(MeshBuildError::EmptyHeightmap);
    }
    if imagery.width() == 0 || imagery.height() == 0 {
        return Err(MeshBuildError::EmptyImagery);
    }

    let side = res + 1;
    let vertex_count = (side * side) as usize;
    let step = extent / res as f32;

    let mut positions = Vec::with_capacity(vertex_count);
    let mut uvs = Vec::with_capacity(vertex_count);

    // Row j runs south to north; image row 0 is the north edge.
    for j in 0..side {
        let v = j as f32 / res as f32;
        let py = nearest_pixel(1.0 - v, hm_height);
        for i in 0..side {
            let u = i as f32 / res as f32;
            let px = nearest_pixel(u, hm_width);
            let p = heightmap.get_pixel(px, py);
            let height = elevation::decode(p[0], p[1], p[2]);

            positions.push([i as f32 * step, j as f32 * step, height]);
            uvs.push([u, 1.0 - v]);
        }
    }

    let mut indices = Vec::with_capacity((res * res * 6) as usize);
    for j in 0..res {
        for i in 0..res {
            let sw = j * side + i;
            let se = sw + 1;
            let nw = sw + side;
            let ne = nw + 1;
            // Counter-clockwise seen from +Z
            indices.extend_from_slice(&[sw, se, nw, se, ne, nw]);
        }
    }

    let normals = vertex_normals(&positions, &indices);

    Ok(TerrainMesh {
        positions,
        normals,
        uvs,
        indices,
        texture: downsample(imagery, settings.texture_max_size),
        anisotropy: settings.anisotropy,
    })
}

fn nearest_pixel(t: f32, size: u32) -> u32 {
    ((t * size as f32) as u32).min(size - 1)
}

/// Per-vertex average of the unit normals of every adjacent face.
fn vertex_normals(positions: &[[f32; 3]], indices: &[u32]) -> Vec<[f32; 3]> {
    let mut sums = vec![Vec3::ZERO; positions.len()];
    for triangle in indices.chunks_exact(3) {
        let [a, b, c] = [triangle[0], triangle[1], triangle[2]].map(|i| i as usize);
        let pa = Vec3::from(positions[a]);
        let face = (Vec3::from(positions[b]) - pa)
            .cross(Vec3::from(positions[c]) - pa)
            .normalize_or_zero();
        sums[a] += face;
        sums[b] += face;
        sums[c] += face;
    }
    sums.into_iter()
        .map(|n| n.try_normalize().unwrap_or(Vec3::Z).to_array())
        .collect()
}

fn downsample(imagery: &RgbaImage, max_size: u32) -> RgbaImage {
    let (width, height) = imagery.dimensions();
    let max_size = max_size.max(1);
    if width <= max_size && height <= max_size {
        return imagery.clone();
    }
    let scale = max_size as f32 / width.max(height) as f32;
    let new_width = ((width as f32 * scale).round() as u32).clamp(1, max_size);
    let new_height = ((height as f32 * scale).round() as u32).clamp(1, max_size);
    image::imageops::resize(imagery, new_width, new_height, FilterType::Triangle)
}
