use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants;
use crate::geo::LinearZoneProjection;

const CONFIG_FILE: &str = "terrain.toml";

#[derive(Resource, Serialize, Deserialize, Clone, Debug, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub world: WorldConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub projection: LinearZoneProjection,
}

/// Placement of the streamed tile grid in the projected plane.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct WorldConfig {
    /// Planar origin the Bevy world is centered on (metres)
    pub origin_x: f64,
    pub origin_y: f64,
    /// Side length of one tile (metres)
    pub tile_extent: f64,
    /// Tiles spawned in each direction around the origin tile
    pub grid_radius: i32,
    /// Camera far plane, which is also the tile load range
    pub view_distance: f32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct FetchConfig {
    pub terrain_url: String,
    pub imagery_url: String,
    pub access_token: String,
    pub timeout_ms: u64,
    pub max_loads_per_tick: usize,
    pub tick_interval_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct MeshConfig {
    pub zoom: u8,
    pub resolution: u32,
    pub texture_max_size: u32,
    pub anisotropy: u16,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            origin_x: constants::DEFAULT_ORIGIN_X,
            origin_y: constants::DEFAULT_ORIGIN_Y,
            tile_extent: constants::DEFAULT_TILE_EXTENT_M,
            grid_radius: constants::DEFAULT_GRID_RADIUS,
            view_distance: constants::DEFAULT_VIEW_DISTANCE_M,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            terrain_url: constants::TERRAIN_URL_TEMPLATE.to_string(),
            imagery_url: constants::IMAGERY_URL_TEMPLATE.to_string(),
            access_token: String::new(),
            timeout_ms: constants::FETCH_TIMEOUT_MS,
            max_loads_per_tick: constants::MAX_LOADS_PER_TICK,
            tick_interval_ms: constants::LOAD_TICK_INTERVAL_MS,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            zoom: constants::DEFAULT_ZOOM,
            resolution: constants::MESH_RESOLUTION,
            texture_max_size: constants::TEXTURE_MAX_SIZE,
            anisotropy: constants::TEXTURE_ANISOTROPY,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Token from the environment wins over the file so secrets stay out of it.
    pub fn resolved_access_token(&self) -> String {
        std::env::var(constants::ACCESS_TOKEN_ENV)
            .ok()
            .filter(|token| !token.is_empty())
            .unwrap_or_else(|| self.access_token.clone())
    }
}

fn config_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_default()
        .join(CONFIG_FILE)
}

impl AppConfig {
    /// Replace values the terrain pipeline cannot work with. Each correction
    /// is logged.
    pub fn validated(mut self) -> Self {
        let defaults = AppConfig::default();

        let world = &mut self.world;
        if !(world.tile_extent.is_finite() && world.tile_extent > 0.0) {
            warn!("Invalid world.tile_extent {}, using {}", world.tile_extent, defaults.world.tile_extent);
            world.tile_extent = defaults.world.tile_extent;
        }
        if !(world.origin_x.is_finite() && world.origin_y.is_finite()) {
            warn!("Invalid world origin, using defaults");
            world.origin_x = defaults.world.origin_x;
            world.origin_y = defaults.world.origin_y;
        }
        if !(0..=constants::MAX_GRID_RADIUS).contains(&world.grid_radius) {
            let clamped = world.grid_radius.clamp(0, constants::MAX_GRID_RADIUS);
            warn!("world.grid_radius {} out of range, using {}", world.grid_radius, clamped);
            world.grid_radius = clamped;
        }
        if !(world.view_distance.is_finite() && world.view_distance > 0.0) {
            warn!("Invalid world.view_distance {}, using {}", world.view_distance, defaults.world.view_distance);
            world.view_distance = defaults.world.view_distance;
        }

        let mesh = &mut self.mesh;
        if !(1..=constants::MAX_MESH_RESOLUTION).contains(&mesh.resolution) {
            let clamped = mesh.resolution.clamp(1, constants::MAX_MESH_RESOLUTION);
            warn!("mesh.resolution {} out of range, using {}", mesh.resolution, clamped);
            mesh.resolution = clamped;
        }
        if mesh.texture_max_size == 0 {
            warn!("mesh.texture_max_size must be positive, using {}", defaults.mesh.texture_max_size);
            mesh.texture_max_size = defaults.mesh.texture_max_size;
        }
        if mesh.zoom > constants::MAX_ZOOM {
            warn!("mesh.zoom {} out of range, using {}", mesh.zoom, constants::MAX_ZOOM);
            mesh.zoom = constants::MAX_ZOOM;
        }

        let projection = &mut self.projection;
        if !(projection.meters_per_degree.is_finite() && projection.meters_per_degree > 0.0) {
            warn!(
                "Invalid projection.meters_per_degree {}, using {}",
                projection.meters_per_degree, defaults.projection.meters_per_degree
            );
            projection.meters_per_degree = defaults.projection.meters_per_degree;
        }

        self
    }
}

/// Parse and validate a config file body.
pub fn parse_config(contents: &str) -> Result<AppConfig, toml::de::Error> {
    toml::from_str::<AppConfig>(contents).map(AppConfig::validated)
}

pub fn load_config() -> AppConfig {
    let path = config_path();
    if path.exists() {
        match fs::read_to_string(&path) {
            Ok(contents) => match parse_config(&contents) {
                Ok(config) => {
                    info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    warn!("Failed to parse config: {}, using defaults", e);
                    return AppConfig::default();
                }
            },
            Err(e) => {
                warn!("Failed to read config: {}, using defaults", e);
                return AppConfig::default();
            }
        }
    }

    let config = AppConfig::default();
    save_config(&config);
    config
}

pub fn save_config(config: &AppConfig) {
    let path = config_path();
    match toml::to_string_pretty(config) {
        Ok(contents) => {
            if let Err(e) = fs::write(&path, contents) {
                error!("Failed to write config: {}", e);
            } else {
                info!("Saved config to {:?}", path);
            }
        }
        Err(e) => {
            error!("Failed to serialize config: {}", e);
        }
    }
}

/// Loads `terrain.toml` once and exposes it as the [`AppConfig`] resource.
pub struct ConfigPlugin;

impl Plugin for ConfigPlugin {
    fn build(&self, app: &mut App) {
        if !app.world().contains_resource::<AppConfig>() {
            app.insert_resource(load_config());
        }
    }
}
