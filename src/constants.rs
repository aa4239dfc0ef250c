// =============================================================================
// Constants - All magic numbers centralized here
// =============================================================================

// Mercator projection limits
pub const MERCATOR_LAT_LIMIT: f64 = 85.0511;

// Projection zone (UTM zone 10 north, linear approximation)
pub const ZONE_CENTRAL_MERIDIAN_DEG: f64 = -123.0;
pub const ZONE_FALSE_EASTING_M: f64 = 500_000.0;
pub const ZONE_FALSE_NORTHING_M: f64 = 0.0;
pub const METERS_PER_DEGREE: f64 = 111_320.0;

// Remote tiling scheme
pub const DEFAULT_ZOOM: u8 = 12;
pub const MAX_ZOOM: u8 = 22;

// Default world origin (planar metres, near Mount Rainier)
pub const DEFAULT_ORIGIN_X: f64 = 638_000.0;
pub const DEFAULT_ORIGIN_Y: f64 = 5_215_000.0;

// Tile grid
pub const DEFAULT_TILE_EXTENT_M: f64 = 1000.0;
pub const DEFAULT_GRID_RADIUS: i32 = 6;
pub const MAX_GRID_RADIUS: i32 = 64;
pub const DEFAULT_VIEW_DISTANCE_M: f32 = 4000.0;

// Mesh building
pub const MESH_RESOLUTION: u32 = 64;
pub const MAX_MESH_RESOLUTION: u32 = 1024;
pub const TEXTURE_MAX_SIZE: u32 = 512;
pub const TEXTURE_ANISOTROPY: u16 = 16;

// Procedural fallback surfaces
pub const FALLBACK_SIZE: u32 = 256;
pub const FALLBACK_CHECKER_CELL: u32 = 32;

// Fetching
pub const FETCH_TIMEOUT_MS: u64 = 5000;
pub const MAX_LOADS_PER_TICK: usize = 2;
pub const LOAD_TICK_INTERVAL_MS: u64 = 100;
pub const USER_AGENT: &str = "terrain_stream/0.1";

// Remote endpoints (Terrain-RGB elevation and satellite imagery)
pub const TERRAIN_URL_TEMPLATE: &str =
    "https://api.mapbox.com/v4/mapbox.terrain-rgb/{z}/{x}/{y}.pngraw?access_token={token}";
pub const IMAGERY_URL_TEMPLATE: &str =
    "https://api.mapbox.com/v4/mapbox.satellite/{z}/{x}/{y}.jpg?access_token={token}";
pub const ACCESS_TOKEN_ENV: &str = "MAPBOX_ACCESS_TOKEN";

// Spatial index
pub const BVH_LEAF_QUADS: u32 = 8;

// Diagnostics
pub const STATS_LOG_INTERVAL_SECS: f32 = 10.0;

// Viewer camera
pub const CAMERA_START_ALTITUDE_M: f32 = 2500.0;
pub const CAMERA_SPEED_MPS: f32 = 250.0;
pub const CAMERA_BOOST: f32 = 5.0;
pub const CAMERA_TURN_RATE_DEG: f32 = 60.0;
pub const CAMERA_GROUND_CLEARANCE_M: f32 = 30.0;
