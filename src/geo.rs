//! Planar-to-tile coordinate mapping and axis conventions.
//!
//! The simulator works in a projected plane (metres east/north inside one
//! projection zone). Remote data is addressed with slippy-map tile indices,
//! so every tile is mapped once, at construction, to a `z/x/y` triple.
//! The projection is a deliberately approximate linear one; it only needs to
//! pick the right remote tile.

use bevy::math::DVec2;
use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

use crate::constants;

// =============================================================================
// Tile Index
// =============================================================================

/// Address of a tile in the remote power-of-two tiling scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileIndex {
    pub zoom: u8,
    pub col: u32,
    pub row: u32,
}

impl fmt::Display for TileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.col, self.row)
    }
}

// =============================================================================
// Projection
// =============================================================================

/// Strategy converting projected-plane metres into geographic degrees.
pub trait PlanarProjection {
    /// Returns `(longitude, latitude)` in degrees.
    fn planar_to_lon_lat(&self, planar: DVec2) -> (f64, f64);
}

/// Single-zone linear projection: a fixed central meridian, false easting
/// and northing, and a constant metres-per-degree scale on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearZoneProjection {
    pub central_meridian_deg: f64,
    pub false_easting_m: f64,
    pub false_northing_m: f64,
    pub meters_per_degree: f64,
}

impl Default for LinearZoneProjection {
    fn default() -> Self {
        Self {
            central_meridian_deg: constants::ZONE_CENTRAL_MERIDIAN_DEG,
            false_easting_m: constants::ZONE_FALSE_EASTING_M,
            false_northing_m: constants::ZONE_FALSE_NORTHING_M,
            meters_per_degree: constants::METERS_PER_DEGREE,
        }
    }
}

impl PlanarProjection for LinearZoneProjection {
    fn planar_to_lon_lat(&self, planar: DVec2) -> (f64, f64) {
        let lon = self.central_meridian_deg
            + (planar.x - self.false_easting_m) / self.meters_per_degree;
        let lat = (planar.y - self.false_northing_m) / self.meters_per_degree;
        (lon, lat)
    }
}

/// Clamp latitude to valid Mercator projection range
pub fn clamp_latitude(lat: f64) -> f64 {
    lat.clamp(-constants::MERCATOR_LAT_LIMIT, constants::MERCATOR_LAT_LIMIT)
}

/// Clamp longitude to valid range
pub fn clamp_longitude(lon: f64) -> f64 {
    lon.clamp(-180.0, 180.0)
}

/// Standard slippy-tile formula. Out-of-range inputs are clamped onto the
/// edge tiles rather than producing invalid indices.
pub fn lon_lat_to_tile_index(lon: f64, lat: f64, zoom: u8) -> TileIndex {
    let n = 2f64.powi(zoom as i32);
    let max_index = n - 1.0;

    let lon = clamp_longitude(lon);
    let lat_rad = clamp_latitude(lat).to_radians();

    let col = (n * (lon + 180.0) / 360.0).floor();
    let row = (n * (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0).floor();

    TileIndex {
        zoom,
        col: col.clamp(0.0, max_index) as u32,
        row: row.clamp(0.0, max_index) as u32,
    }
}

/// Map a planar coordinate to the remote tile containing it.
pub fn planar_to_tile_index(
    projection: &impl PlanarProjection,
    planar: DVec2,
    zoom: u8,
) -> TileIndex {
    let (lon, lat) = projection.planar_to_lon_lat(planar);
    lon_lat_to_tile_index(lon, lat, zoom)
}

/// [`planar_to_tile_index`] at [`constants::DEFAULT_ZOOM`].
pub fn planar_to_default_tile_index(projection: &impl PlanarProjection, planar: DVec2) -> TileIndex {
    planar_to_tile_index(projection, planar, constants::DEFAULT_ZOOM)
}

// =============================================================================
// Axis Conventions
// =============================================================================

/// Convert a position from Z-up (X=east, Y=north, Z=up) to
/// Y-up (X=east, Y=up, Z=south) coordinate space.
pub fn zup_to_yup(v: Vec3) -> Vec3 {
    Vec3::new(v.x, v.z, -v.y)
}

/// Convert a position from Y-up back to Z-up coordinate space.
pub fn yup_to_zup(v: Vec3) -> Vec3 {
    Vec3::new(v.x, -v.z, v.y)
}

/// Build the rotation quaternion that transforms Z-up to Y-up.
/// This is a -90 degree rotation around the X axis.
pub fn zup_to_yup_rotation() -> Quat {
    Quat::from_rotation_x(-std::f32::consts::FRAC_PI_2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn false_easting_on_equator_maps_to_central_meridian() {
        let projection = LinearZoneProjection::default();
        let (lon, lat) = projection.planar_to_lon_lat(DVec2::new(500_000.0, 0.0));
        assert_eq!(lon, -123.0);
        assert_eq!(lat, 0.0);
    }

    #[test]
    fn central_meridian_tile_at_zoom_12() {
        let projection = LinearZoneProjection::default();
        let index = planar_to_tile_index(&projection, DVec2::new(500_000.0, 0.0), 12);
        // 4096 * 57 / 360 = 648.53
        assert_eq!(index, TileIndex { zoom: 12, col: 648, row: 2048 });
        assert_eq!(index.to_string(), "12/648/2048");
    }

    #[test]
    fn default_zoom_is_used_when_unspecified() {
        let projection = LinearZoneProjection::default();
        let planar = DVec2::new(constants::DEFAULT_ORIGIN_X, constants::DEFAULT_ORIGIN_Y);
        let index = planar_to_default_tile_index(&projection, planar);
        assert_eq!(index.zoom, constants::DEFAULT_ZOOM);
        assert_eq!(index, planar_to_tile_index(&projection, planar, constants::DEFAULT_ZOOM));
    }

    #[test]
    fn east_increases_column_and_north_decreases_row() {
        let projection = LinearZoneProjection::default();
        let base = DVec2::new(constants::DEFAULT_ORIGIN_X, constants::DEFAULT_ORIGIN_Y);
        let here = planar_to_tile_index(&projection, base, 12);
        let east = planar_to_tile_index(&projection, base + DVec2::new(50_000.0, 0.0), 12);
        let north = planar_to_tile_index(&projection, base + DVec2::new(0.0, 50_000.0), 12);

        assert!(east.col > here.col);
        assert_eq!(east.row, here.row);
        assert!(north.row < here.row);
        assert_eq!(north.col, here.col);
    }

    #[test]
    fn extreme_latitudes_clamp_to_edge_tiles() {
        let north = lon_lat_to_tile_index(0.0, 89.9, 4);
        let south = lon_lat_to_tile_index(0.0, -89.9, 4);
        let east = lon_lat_to_tile_index(180.0, 0.0, 4);
        assert_eq!(north.row, 0);
        assert_eq!(south.row, 15);
        assert_eq!(east.col, 15);
    }

    #[test]
    fn zup_and_yup_round_trip() {
        let v = Vec3::new(1.0, 2.0, 3.0);
        assert_eq!(yup_to_zup(zup_to_yup(v)), v);
        let rotated = zup_to_yup_rotation() * v;
        assert!((rotated - zup_to_yup(v)).length() < 1e-5);
    }
}
