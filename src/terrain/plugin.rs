use bevy::ecs::system::SystemParam;
use bevy::math::DVec2;
use bevy::prelude::*;
use std::collections::VecDeque;
use std::time::Duration;

use super::bvh::GridBvhBuilder;
use super::mesh::{MeshSettings, TerrainMesh};
use super::source::{HttpTileSource, SourceUrls};
use super::tile::{CameraView, LoadCounter, TerrainContext, TerrainScene, Tile, TileLoadError, TileTransition};
use super::worker::{TerrainWorker, WorkerEvent};
use crate::config::{AppConfig, WorldConfig};
use crate::constants;
use crate::geo::{yup_to_zup, zup_to_yup, zup_to_yup_rotation};
use crate::tile_cache::TileDataCache;

// =============================================================================
// Components and Resources
// =============================================================================

/// Marker for the camera that drives tile visibility.
#[derive(Component)]
pub struct TerrainCamera;

/// A streamed terrain tile. The entity carries the tile's placement transform;
/// mesh and material components come and go with the tile's state.
#[derive(Component, Deref, DerefMut)]
pub struct TerrainTile(pub Tile<TileRenderHandles>);

/// Assets owned by a loaded tile.
#[derive(Debug)]
pub struct TileRenderHandles {
    pub mesh: Handle<Mesh>,
    pub material: Handle<StandardMaterial>,
    pub texture: Handle<Image>,
}

/// Payload cache, load counter and the background worker. The worker is
/// `None` when it could not be started; queued loads are then dropped and
/// the outage is logged once.
#[derive(Resource)]
pub struct TerrainRuntime {
    pub worker: Option<TerrainWorker>,
    pub cache: TileDataCache,
    pub counter: LoadCounter,
}

/// Rate limiter between visibility checks and the worker.
#[derive(Resource)]
pub struct TileLoadQueue {
    pending: VecDeque<Entity>,
    timer: Timer,
    max_per_tick: usize,
}

impl TileLoadQueue {
    pub fn new(interval: Duration, max_per_tick: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            timer: Timer::new(interval, TimerMode::Repeating),
            max_per_tick: max_per_tick.max(1),
        }
    }

    pub fn push(&mut self, entity: Entity) {
        self.pending.push_back(entity);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Advance the timer and pop at most `max_per_tick` entries per elapsed
    /// tick, oldest first.
    pub fn release(&mut self, delta: Duration) -> Vec<Entity> {
        self.timer.tick(delta);
        let ticks = self.timer.times_finished_this_tick() as usize;
        let count = (ticks * self.max_per_tick).min(self.pending.len());
        self.pending.drain(..count).collect()
    }
}

/// Timer that triggers the periodic terrain stats log line.
#[derive(Resource)]
struct TerrainStatsTimer(Timer);

impl Default for TerrainStatsTimer {
    fn default() -> Self {
        Self(Timer::from_seconds(constants::STATS_LOG_INTERVAL_SECS, TimerMode::Repeating))
    }
}

// =============================================================================
// Scene Adapter
// =============================================================================

#[derive(SystemParam)]
struct TileSceneParams<'w, 's> {
    commands: Commands<'w, 's>,
    meshes: ResMut<'w, Assets<Mesh>>,
    materials: ResMut<'w, Assets<StandardMaterial>>,
    images: ResMut<'w, Assets<Image>>,
}

impl<'w, 's> TileSceneParams<'w, 's> {
    fn for_entity(&mut self, entity: Entity) -> EntityScene<'_, 'w, 's> {
        EntityScene { entity, params: self }
    }
}

/// Renders a tile by attaching mesh components to its own entity.
struct EntityScene<'a, 'w, 's> {
    entity: Entity,
    params: &'a mut TileSceneParams<'w, 's>,
}

impl TerrainScene for EntityScene<'_, '_, '_> {
    type Handle = TileRenderHandles;

    fn add(&mut self, mesh: TerrainMesh) -> TileRenderHandles {
        let texture = self.params.images.add(mesh.to_image());
        let material = self.params.materials.add(StandardMaterial {
            base_color_texture: Some(texture.clone()),
            perceptual_roughness: 0.95,
            metallic: 0.0,
            ..default()
        });
        let mesh = self.params.meshes.add(mesh.to_mesh());

        self.params.commands.entity(self.entity).insert((
            Mesh3d(mesh.clone()),
            MeshMaterial3d(material.clone()),
        ));

        TileRenderHandles { mesh, material, texture }
    }

    fn remove(&mut self, handles: TileRenderHandles) {
        self.params
            .commands
            .entity(self.entity)
            .remove::<(Mesh3d, MeshMaterial3d<StandardMaterial>)>();
        self.params.meshes.remove(&handles.mesh);
        self.params.materials.remove(&handles.material);
        self.params.images.remove(&handles.texture);
    }
}

// =============================================================================
// Plugin
// =============================================================================

pub struct TerrainPlugin;

impl Plugin for TerrainPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<TerrainStatsTimer>()
            .add_systems(Startup, (start_terrain_runtime, spawn_tile_grid))
            .add_systems(
                Update,
                (
                    check_tile_visibility,
                    dispatch_tile_loads,
                    apply_worker_events,
                    log_terrain_stats,
                )
                    .chain(),
            );
    }
}

// =============================================================================
// Setup
// =============================================================================

fn start_terrain_runtime(mut commands: Commands, config: Res<AppConfig>) {
    let fetch = &config.fetch;
    let cache = TileDataCache::new();
    let counter = LoadCounter::default();

    let access_token = fetch.resolved_access_token();
    if access_token.is_empty() {
        warn!(
            "No access token configured (set {}); remote tiles will fall back to procedural terrain",
            constants::ACCESS_TOKEN_ENV
        );
    }

    let worker = HttpTileSource::new()
        .map_err(|e| error!("Failed to create HTTP client for terrain tiles: {}", e))
        .ok()
        .and_then(|source| {
            let ctx = TerrainContext {
                source,
                cache: cache.clone(),
                counter: counter.clone(),
                urls: SourceUrls {
                    terrain: fetch.terrain_url.clone(),
                    imagery: fetch.imagery_url.clone(),
                    access_token,
                },
                mesh: MeshSettings {
                    resolution: config.mesh.resolution,
                    texture_max_size: config.mesh.texture_max_size,
                    anisotropy: config.mesh.anisotropy,
                },
                fetch_timeout: fetch.timeout(),
            };
            TerrainWorker::spawn(ctx, GridBvhBuilder::default())
                .map_err(|e| error!("Failed to start terrain worker thread: {}", e))
                .ok()
        });

    commands.insert_resource(TileLoadQueue::new(fetch.tick_interval(), fetch.max_loads_per_tick));
    commands.insert_resource(TerrainRuntime { worker, cache, counter });
    info!("Terrain runtime started");
}

/// Lower-left corners of the tiles around the world origin, snapped to the
/// tile grid.
pub fn tile_grid_origins(world: &WorldConfig) -> Vec<DVec2> {
    let extent = world.tile_extent;
    let center = (DVec2::new(world.origin_x, world.origin_y) / extent).floor() * extent;
    let radius = world.grid_radius.max(0);

    (-radius..=radius)
        .flat_map(|dy| (-radius..=radius).map(move |dx| (dx, dy)))
        .map(|(dx, dy)| center + DVec2::new(dx as f64, dy as f64) * extent)
        .collect()
}

fn spawn_tile_grid(mut commands: Commands, config: Res<AppConfig>) {
    let world_origin = DVec2::new(config.world.origin_x, config.world.origin_y);
    let origins = tile_grid_origins(&config.world);

    for origin in &origins {
        let tile = Tile::new(*origin, config.world.tile_extent, &config.projection, config.mesh.zoom);
        let local = (*origin - world_origin).as_vec2();
        commands.spawn((
            Name::new(format!("Terrain Tile {}", tile.name())),
            Transform::from_translation(zup_to_yup(local.extend(0.0)))
                .with_rotation(zup_to_yup_rotation()),
            Visibility::default(),
            TerrainTile(tile),
        ));
    }

    info!("Spawned {} terrain tiles", origins.len());
}

// =============================================================================
// Systems
// =============================================================================

/// Planar camera position for a Y-up world translation.
pub fn camera_view(translation: Vec3, far: f32, world: &WorldConfig) -> CameraView {
    let local = yup_to_zup(translation).truncate().as_dvec2();
    CameraView {
        position: DVec2::new(world.origin_x, world.origin_y) + local,
        far: far as f64,
    }
}

fn check_tile_visibility(
    camera_query: Query<(&Transform, &Projection), With<TerrainCamera>>,
    mut tiles: Query<(Entity, &mut TerrainTile)>,
    mut queue: ResMut<TileLoadQueue>,
    runtime: Res<TerrainRuntime>,
    config: Res<AppConfig>,
    mut scene: TileSceneParams,
) {
    let Ok((transform, projection)) = camera_query.single() else {
        return;
    };
    let far = match projection {
        Projection::Perspective(perspective) => perspective.far,
        _ => config.world.view_distance,
    };
    let view = camera_view(transform.translation, far, &config.world);

    for (entity, mut tile) in tiles.iter_mut() {
        let transition = tile.check_visibility(&view, &mut scene.for_entity(entity), &runtime.counter);
        if transition == TileTransition::QueueLoad {
            queue.push(entity);
        }
    }
}

fn dispatch_tile_loads(
    time: Res<Time>,
    mut queue: ResMut<TileLoadQueue>,
    runtime: Res<TerrainRuntime>,
    mut tiles: Query<&mut TerrainTile>,
    mut outage_reported: Local<bool>,
) {
    for entity in queue.release(time.delta()) {
        let Ok(mut tile) = tiles.get_mut(entity) else {
            continue;
        };
        // Skip entries whose tile already left Loading
        let Some(request) = tile.begin_load() else {
            continue;
        };
        let generation = request.generation;

        let submitted = match runtime.worker.as_ref() {
            Some(worker) => worker.submit(entity, request),
            None => Err(TileLoadError::WorkerUnavailable),
        };
        // Reported once; the tile retries on its next visibility check.
        if let Err(e) = submitted {
            if !*outage_reported {
                warn!("Terrain loads paused: {}", e);
                *outage_reported = true;
            }
            tile.abort_load(generation);
        }
    }
}

fn apply_worker_events(
    runtime: Res<TerrainRuntime>,
    mut tiles: Query<&mut TerrainTile>,
    mut scene: TileSceneParams,
) {
    let Some(worker) = runtime.worker.as_ref() else {
        return;
    };

    for event in worker.try_events() {
        match event {
            WorkerEvent::Loaded { entity, generation, result } => {
                let Ok(mut tile) = tiles.get_mut(entity) else {
                    continue;
                };
                if let Err(TileLoadError::Stale { tile: name }) =
                    tile.complete_load(generation, result, &mut scene.for_entity(entity), &runtime.counter)
                {
                    debug!("Discarded stale load result for tile {}", name);
                }
            }
            WorkerEvent::SpatialIndex { entity, generation, result } => match result {
                Ok(bvh) => {
                    if let Ok(mut tile) = tiles.get_mut(entity) {
                        if tile.attach_spatial_index(generation, bvh) {
                            debug!("Attached spatial index to tile {}", tile.name());
                        }
                    }
                }
                Err(e) => warn!("Spatial index build failed for {:?}: {}", entity, e),
            },
        }
    }
}

fn log_terrain_stats(
    time: Res<Time>,
    mut timer: ResMut<TerrainStatsTimer>,
    runtime: Res<TerrainRuntime>,
    queue: Res<TileLoadQueue>,
    tiles: Query<&TerrainTile>,
) {
    if !timer.0.tick(time.delta()).just_finished() {
        return;
    }
    let loading = tiles.iter().filter(|tile| tile.is_loading()).count();
    info!(
        "Terrain: {} tiles loaded, {} loading, {} queued, {} payloads cached",
        runtime.counter.get(),
        loading,
        queue.len(),
        runtime.cache.len()
    );
}
