//! Per-tile lifecycle: visibility-driven load and unload of a terrain mesh.
//!
//! ```text
//!  Unloaded --(in range)--> Loading --(mesh built)--> Loaded
//!     ^                        |                         |
//!     +------(load failed)-----+                         |
//!     +---------------------(out of range)---------------+
//! ```
//!
//! The tile never fetches on its own. Entering `Loading` only asks the caller
//! to queue it; whoever drains that queue performs the load and hands the
//! result back through [`Tile::complete_load`].

use bevy::log::{debug, info, warn};
use bevy::math::{DVec2, DVec3};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::bvh::TileBvh;
use super::mesh::{build_terrain_mesh, MeshBuildError, MeshSettings, TerrainMesh};
use super::procedural;
use super::source::{acquire_within, SourceUrls, TileSource};
use crate::constants;
use crate::geo::{planar_to_tile_index, PlanarProjection, TileIndex};
use crate::tile_cache::{payload_key, PayloadKind, TileDataCache, TilePayload};

#[derive(Debug, Error)]
pub enum TileLoadError {
    #[error("tile {tile} was not queued for loading")]
    NotQueued { tile: String },
    #[error("result for tile {tile} belongs to an earlier load cycle")]
    Stale { tile: String },
    #[error("mesh build failed: {0}")]
    MeshBuild(#[from] MeshBuildError),
    #[error("terrain worker is not running")]
    WorkerUnavailable,
    #[error("load task for tile {tile} aborted: {reason}")]
    TaskFailed { tile: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
}

/// What a visibility check asks of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileTransition {
    Unchanged,
    /// The tile entered `Loading`; push it onto the load queue.
    QueueLoad,
    /// The tile left the scene and released its resources.
    Unloaded,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    pub center: DVec3,
    pub radius: f64,
}

/// Planar camera position plus the maximum visible range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraView {
    pub position: DVec2,
    pub far: f64,
}

/// Number of currently loaded tiles, shared by everything that loads them.
/// Advisory only.
#[derive(Debug, Clone, Default)]
pub struct LoadCounter(Arc<AtomicUsize>);

impl LoadCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }
}

/// Scene graph the tile inserts its mesh into. `remove` consumes the handle,
/// so a released mesh cannot be put back.
pub trait TerrainScene {
    type Handle;

    fn add(&mut self, mesh: TerrainMesh) -> Self::Handle;
    fn remove(&mut self, handle: Self::Handle);
}

/// Where a payload used for a build came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadOrigin {
    Remote,
    Procedural,
}

impl fmt::Display for PayloadOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadOrigin::Remote => f.write_str("remote"),
            PayloadOrigin::Procedural => f.write_str("procedural"),
        }
    }
}

/// A finished load, ready to be installed.
#[derive(Debug)]
pub struct TileBuild {
    pub mesh: TerrainMesh,
    pub terrain: PayloadOrigin,
    pub imagery: PayloadOrigin,
}

/// Everything a load needs besides the tile itself.
pub struct TerrainContext<S> {
    pub source: S,
    pub cache: TileDataCache,
    pub counter: LoadCounter,
    pub urls: SourceUrls,
    pub mesh: MeshSettings,
    pub fetch_timeout: Duration,
}

impl<S: TileSource> TerrainContext<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cache: TileDataCache::new(),
            counter: LoadCounter::default(),
            urls: SourceUrls::default(),
            mesh: MeshSettings::default(),
            fetch_timeout: Duration::from_millis(constants::FETCH_TIMEOUT_MS),
        }
    }
}

/// Owned description of one load attempt, detached from the tile so it can
/// run on another task.
#[derive(Debug, Clone)]
pub struct TileLoadRequest {
    pub name: String,
    pub index: TileIndex,
    pub extent: f64,
    pub generation: u64,
}

impl TileLoadRequest {
    /// Acquire both payloads concurrently, substitute procedural data for
    /// whichever failed or timed out, and build the mesh.
    pub async fn run<S: TileSource>(&self, ctx: &TerrainContext<S>) -> Result<TileBuild, TileLoadError> {
        let terrain_key = payload_key(&self.name, PayloadKind::Terrain);
        let imagery_key = payload_key(&self.name, PayloadKind::Imagery);
        let terrain_url = ctx.urls.terrain_url(self.index);
        let imagery_url = ctx.urls.imagery_url(self.index);

        let (terrain, imagery) = tokio::join!(
            acquire_within(ctx.fetch_timeout, &ctx.source, &ctx.cache, &terrain_url, &terrain_key),
            acquire_within(ctx.fetch_timeout, &ctx.source, &ctx.cache, &imagery_url, &imagery_key),
        );

        let (terrain, terrain_origin) = with_fallback(terrain, || Arc::new(procedural::terrain_fallback()));
        let (imagery, imagery_origin) = with_fallback(imagery, || {
            Arc::new(procedural::texture_fallback(procedural::seed_for_tile(&self.name)))
        });

        let mesh = build_terrain_mesh(self.extent as f32, &terrain, &imagery, &ctx.mesh)?;
        Ok(TileBuild {
            mesh,
            terrain: terrain_origin,
            imagery: imagery_origin,
        })
    }
}

fn with_fallback(
    payload: Option<TilePayload>,
    fallback: impl FnOnce() -> TilePayload,
) -> (TilePayload, PayloadOrigin) {
    match payload {
        Some(payload) => (payload, PayloadOrigin::Remote),
        None => (fallback(), PayloadOrigin::Procedural),
    }
}

/// Name of the tile whose lower-left corner is `origin`.
pub fn tile_name(origin: DVec2) -> String {
    format!("{}-{}", origin.x, origin.y)
}

/// A square of terrain and the mesh that renders it.
#[derive(Debug)]
pub struct Tile<H> {
    name: String,
    origin: DVec2,
    extent: f64,
    index: TileIndex,
    bounds: BoundingSphere,
    state: TileState,
    /// Bumped on every Unloaded -> Loading edge
    generation: u64,
    /// Set once the current cycle's request has been handed out
    dispatched: bool,
    render: Option<H>,
    bvh: Option<TileBvh>,
}

impl<H> Tile<H> {
    pub fn new(origin: DVec2, extent: f64, projection: &impl PlanarProjection, zoom: u8) -> Self {
        let half = extent / 2.0;
        Self {
            name: tile_name(origin),
            origin,
            extent,
            index: planar_to_tile_index(projection, origin, zoom),
            bounds: BoundingSphere {
                center: DVec3::new(origin.x + half, origin.y + half, 0.0),
                radius: extent / std::f64::consts::SQRT_2,
            },
            state: TileState::Unloaded,
            generation: 0,
            dispatched: false,
            render: None,
            bvh: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> DVec2 {
        self.origin
    }

    pub fn extent(&self) -> f64 {
        self.extent
    }

    pub fn index(&self) -> TileIndex {
        self.index
    }

    pub fn bounding_sphere(&self) -> BoundingSphere {
        self.bounds
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    pub fn is_loading(&self) -> bool {
        self.state == TileState::Loading
    }

    pub fn is_loaded(&self) -> bool {
        self.state == TileState::Loaded
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn render_handle(&self) -> Option<&H> {
        self.render.as_ref()
    }

    pub fn spatial_index(&self) -> Option<&TileBvh> {
        self.bvh.as_ref()
    }

    /// Squared planar distance from the tile centre to the camera against
    /// `far²`; height is ignored.
    pub fn is_within_view(&self, camera: &CameraView) -> bool {
        let center = self.bounds.center.truncate();
        center.distance_squared(camera.position) < camera.far * camera.far
    }

    /// Drive the lifecycle from a fresh camera sample.
    pub fn check_visibility<S>(
        &mut self,
        camera: &CameraView,
        scene: &mut S,
        counter: &LoadCounter,
    ) -> TileTransition
    where
        S: TerrainScene<Handle = H>,
    {
        let visible = self.is_within_view(camera);
        if visible && !self.is_loading() && !self.is_loaded() {
            self.state = TileState::Loading;
            self.generation += 1;
            self.dispatched = false;
            debug!("Tile {} in range, queued for loading", self.name);
            TileTransition::QueueLoad
        } else if !visible && self.is_loaded() && !self.is_loading() {
            self.unload(scene, counter);
            TileTransition::Unloaded
        } else {
            TileTransition::Unchanged
        }
    }

    fn unload<S>(&mut self, scene: &mut S, counter: &LoadCounter)
    where
        S: TerrainScene<Handle = H>,
    {
        if let Some(handle) = self.render.take() {
            scene.remove(handle);
        }
        self.bvh = None;
        self.state = TileState::Unloaded;
        counter.decrement();
        debug!("Tile {} out of range, unloaded", self.name);
    }

    /// Hand out the work for the current load cycle. Returns `None` unless the
    /// tile is `Loading` and no request has been issued for this cycle yet.
    pub fn begin_load(&mut self) -> Option<TileLoadRequest> {
        if !self.is_loading() || self.dispatched {
            return None;
        }
        self.dispatched = true;
        Some(TileLoadRequest {
            name: self.name.clone(),
            index: self.index,
            extent: self.extent,
            generation: self.generation,
        })
    }

    /// Install a finished build, or fall back to `Unloaded` so the next
    /// visibility check can retry.
    pub fn complete_load<S>(
        &mut self,
        generation: u64,
        result: Result<TileBuild, TileLoadError>,
        scene: &mut S,
        counter: &LoadCounter,
    ) -> Result<(), TileLoadError>
    where
        S: TerrainScene<Handle = H>,
    {
        if !self.is_loading() || generation != self.generation {
            return Err(TileLoadError::Stale { tile: self.name.clone() });
        }

        self.dispatched = false;
        match result {
            Ok(build) => {
                info!(
                    "Loaded tile {} ({}): terrain {}, imagery {}, {} triangles",
                    self.name,
                    self.index,
                    build.terrain,
                    build.imagery,
                    build.mesh.triangle_count()
                );
                self.render = Some(scene.add(build.mesh));
                self.state = TileState::Loaded;
                counter.increment();
                Ok(())
            }
            Err(e) => {
                warn!("Failed to load tile {}: {}", self.name, e);
                self.state = TileState::Unloaded;
                Err(e)
            }
        }
    }

    /// Return a `Loading` tile to `Unloaded` without a result, for loads that
    /// never started. Nothing is logged; the caller reports the cause.
    pub fn abort_load(&mut self, generation: u64) -> bool {
        if !self.is_loading() || generation != self.generation {
            return false;
        }
        self.state = TileState::Unloaded;
        self.dispatched = false;
        true
    }

    /// Queue-drained entry point: run the load for the current cycle and
    /// install the result.
    pub async fn load<S, T>(&mut self, ctx: &TerrainContext<T>, scene: &mut S) -> Result<(), TileLoadError>
    where
        S: TerrainScene<Handle = H>,
        T: TileSource,
    {
        let request = self.begin_load().ok_or_else(|| TileLoadError::NotQueued {
            tile: self.name.clone(),
        })?;
        let result = request.run(ctx).await;
        self.complete_load(request.generation, result, scene, &ctx.counter)
    }

    /// Attach the spatial index built for `generation`. Late results for an
    /// earlier cycle are dropped.
    pub fn attach_spatial_index(&mut self, generation: u64, bvh: TileBvh) -> bool {
        if self.is_loaded() && generation == self.generation {
            self.bvh = Some(bvh);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::LinearZoneProjection;
    use crate::terrain::bvh::{GridBvhBuilder, SpatialIndexBuilder};
    use crate::terrain::source::tests::{png_bytes, StubReply, StubSource};
    use image::RgbaImage;

    /// Handle that is deliberately not `Clone`.
    #[derive(Debug, PartialEq, Eq)]
    struct RecordedHandle(usize);

    #[derive(Default)]
    struct RecordingScene {
        added: Vec<TerrainMesh>,
        removed: Vec<usize>,
    }

    impl TerrainScene for RecordingScene {
        type Handle = RecordedHandle;

        fn add(&mut self, mesh: TerrainMesh) -> RecordedHandle {
            self.added.push(mesh);
            RecordedHandle(self.added.len() - 1)
        }

        fn remove(&mut self, handle: RecordedHandle) {
            self.removed.push(handle.0);
        }
    }

    fn tile_at(x: f64, y: f64) -> Tile<RecordedHandle> {
        Tile::new(DVec2::new(x, y), 1000.0, &LinearZoneProjection::default(), constants::DEFAULT_ZOOM)
    }

    fn near() -> CameraView {
        CameraView { position: DVec2::new(500.0, 500.0), far: 5000.0 }
    }

    fn far_away() -> CameraView {
        CameraView { position: DVec2::new(50_000.0, 500.0), far: 5000.0 }
    }

    fn context(source: StubSource) -> TerrainContext<StubSource> {
        TerrainContext::new(source)
    }

    fn fallback_build() -> TileBuild {
        TileBuild {
            mesh: build_terrain_mesh(
                1000.0,
                &procedural::terrain_fallback(),
                &procedural::texture_fallback(0),
                &MeshSettings::default(),
            )
            .unwrap(),
            terrain: PayloadOrigin::Procedural,
            imagery: PayloadOrigin::Procedural,
        }
    }

    #[test]
    fn identity_and_bounds_follow_origin() {
        let tile = tile_at(638_000.0, 5_215_000.0);
        assert_eq!(tile.name(), "638000-5215000");
        let sphere = tile.bounding_sphere();
        assert_eq!(sphere.center, DVec3::new(638_500.0, 5_215_500.0, 0.0));
        assert!((sphere.radius - 707.106_78).abs() < 1e-3);
        assert_eq!(tile.index().zoom, constants::DEFAULT_ZOOM);
        assert_eq!(tile.state(), TileState::Unloaded);
    }

    #[test]
    fn visibility_uses_planar_distance_to_centre() {
        let tile = tile_at(0.0, 0.0);
        let edge = CameraView { position: DVec2::new(500.0, 5500.0), far: 5000.0 };
        assert!(!tile.is_within_view(&edge));
        let inside = CameraView { position: DVec2::new(500.0, 5499.0), far: 5000.0 };
        assert!(tile.is_within_view(&inside));
    }

    #[test]
    fn entering_range_queues_without_loading() {
        let mut tile = tile_at(0.0, 0.0);
        let mut scene = RecordingScene::default();
        let counter = LoadCounter::default();

        assert_eq!(tile.check_visibility(&near(), &mut scene, &counter), TileTransition::QueueLoad);
        assert!(tile.is_loading());
        assert!(!tile.is_loaded());
        assert!(scene.added.is_empty());
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn only_one_load_in_flight_across_interleavings() {
        let mut tile = tile_at(0.0, 0.0);
        let mut scene = RecordingScene::default();
        let counter = LoadCounter::default();

        let sequence = [near(), near(), far_away(), near(), far_away(), far_away(), near()];
        let queued = sequence
            .iter()
            .filter(|camera| tile.check_visibility(camera, &mut scene, &counter) == TileTransition::QueueLoad)
            .count();
        assert_eq!(queued, 1);
        assert!(tile.is_loading());

        assert!(tile.begin_load().is_some());
        assert!(tile.begin_load().is_none());
        for camera in &sequence {
            assert_eq!(tile.check_visibility(camera, &mut scene, &counter), TileTransition::Unchanged);
        }
        assert!(scene.removed.is_empty());
    }

    #[test]
    fn full_cycle_adjusts_counter_and_releases_mesh() {
        let mut tile = tile_at(0.0, 0.0);
        let mut scene = RecordingScene::default();
        let counter = LoadCounter::default();

        tile.check_visibility(&near(), &mut scene, &counter);
        let request = tile.begin_load().unwrap();
        tile.complete_load(request.generation, Ok(fallback_build()), &mut scene, &counter)
            .unwrap();
        assert!(tile.is_loaded());
        assert_eq!(counter.get(), 1);
        assert_eq!(tile.render_handle(), Some(&RecordedHandle(0)));

        let bvh = GridBvhBuilder::default().generate(&scene.added[0].geometry()).unwrap();
        assert!(tile.attach_spatial_index(request.generation, bvh));
        assert!(tile.spatial_index().is_some());

        assert_eq!(tile.check_visibility(&far_away(), &mut scene, &counter), TileTransition::Unloaded);
        assert_eq!(tile.state(), TileState::Unloaded);
        assert_eq!(counter.get(), 0);
        assert_eq!(scene.removed, vec![0]);
        assert!(tile.render_handle().is_none());
        assert!(tile.spatial_index().is_none());
    }

    #[test]
    fn failed_load_reverts_to_unloaded_and_can_retry() {
        let mut tile = tile_at(0.0, 0.0);
        let mut scene = RecordingScene::default();
        let counter = LoadCounter::default();

        tile.check_visibility(&near(), &mut scene, &counter);
        let request = tile.begin_load().unwrap();
        let failure = Err(TileLoadError::MeshBuild(MeshBuildError::EmptyHeightmap));
        assert!(tile.complete_load(request.generation, failure, &mut scene, &counter).is_err());
        assert_eq!(tile.state(), TileState::Unloaded);
        assert!(scene.added.is_empty());
        assert_eq!(counter.get(), 0);

        assert_eq!(tile.check_visibility(&near(), &mut scene, &counter), TileTransition::QueueLoad);
        assert_eq!(tile.begin_load().unwrap().generation, request.generation + 1);
    }

    #[test]
    fn aborted_load_can_be_queued_again() {
        let mut tile = tile_at(0.0, 0.0);
        let mut scene = RecordingScene::default();
        let counter = LoadCounter::default();

        tile.check_visibility(&near(), &mut scene, &counter);
        let request = tile.begin_load().unwrap();
        assert!(!tile.abort_load(request.generation + 1));
        assert!(tile.is_loading());

        assert!(tile.abort_load(request.generation));
        assert_eq!(tile.state(), TileState::Unloaded);
        assert!(!tile.abort_load(request.generation));
        assert_eq!(counter.get(), 0);
        assert_eq!(tile.check_visibility(&near(), &mut scene, &counter), TileTransition::QueueLoad);
    }

    #[test]
    fn stale_results_are_discarded() {
        let mut tile = tile_at(0.0, 0.0);
        let mut scene = RecordingScene::default();
        let counter = LoadCounter::default();

        tile.check_visibility(&near(), &mut scene, &counter);
        let request = tile.begin_load().unwrap();
        let stale = tile.complete_load(request.generation + 7, Ok(fallback_build()), &mut scene, &counter);
        assert!(matches!(stale, Err(TileLoadError::Stale { .. })));
        assert!(tile.is_loading());
        assert!(scene.added.is_empty());

        let bvh = GridBvhBuilder::default().generate(&fallback_build().mesh.geometry()).unwrap();
        assert!(!tile.attach_spatial_index(request.generation, bvh));
    }

    #[tokio::test]
    async fn load_requires_a_queued_tile() {
        let mut tile = tile_at(0.0, 0.0);
        let mut scene = RecordingScene::default();
        let ctx = context(StubSource::default());
        let result = tile.load(&ctx, &mut scene).await;
        assert!(matches!(result, Err(TileLoadError::NotQueued { .. })));
        assert_eq!(ctx.source.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn both_sources_timing_out_still_loads_procedural_terrain() {
        let source = StubSource::default()
            .with("terrain-rgb", StubReply::Hang)
            .with("satellite", StubReply::Hang);
        let ctx = context(source);
        let mut tile = tile_at(0.0, 0.0);
        let mut scene = RecordingScene::default();

        tile.check_visibility(&near(), &mut scene, &ctx.counter);
        tile.load(&ctx, &mut scene).await.unwrap();

        assert_eq!(tile.state(), TileState::Loaded);
        assert_eq!(ctx.counter.get(), 1);
        assert_eq!(scene.added.len(), 1);
        assert_eq!(scene.added[0].triangle_count(), 8192);
        assert!(scene.added[0].positions.iter().all(|p| p[2] == 0.0));
        assert!(ctx.cache.is_empty());
    }

    #[tokio::test]
    async fn terrain_unauthorized_falls_back_while_imagery_is_used() {
        let red = RgbaImage::from_pixel(256, 256, image::Rgba([200, 10, 10, 255]));
        let source = StubSource::default()
            .with("terrain-rgb", StubReply::Status(401))
            .with("satellite", StubReply::Bytes(png_bytes(&red)));
        let ctx = context(source);
        let mut tile = tile_at(0.0, 0.0);
        let mut scene = RecordingScene::default();

        tile.check_visibility(&near(), &mut scene, &ctx.counter);
        tile.load(&ctx, &mut scene).await.unwrap();

        assert!(tile.is_loaded());
        let mesh = &scene.added[0];
        assert!(mesh.positions.iter().all(|p| p[2] == 0.0));
        assert_eq!(mesh.texture.get_pixel(17, 93), &image::Rgba([200, 10, 10, 255]));
        assert!(ctx.cache.contains("0-0-imagery"));
        assert!(!ctx.cache.contains("0-0-terrain"));
    }

    #[tokio::test]
    async fn camera_beyond_far_removes_mesh_exactly_once() {
        let ctx = context(StubSource::default());
        let mut tile = tile_at(0.0, 0.0);
        let mut scene = RecordingScene::default();

        tile.check_visibility(&near(), &mut scene, &ctx.counter);
        tile.load(&ctx, &mut scene).await.unwrap();
        assert_eq!(ctx.counter.get(), 1);

        assert_eq!(tile.check_visibility(&far_away(), &mut scene, &ctx.counter), TileTransition::Unloaded);
        assert_eq!(tile.check_visibility(&far_away(), &mut scene, &ctx.counter), TileTransition::Unchanged);
        assert_eq!(scene.removed.len(), 1);
        assert_eq!(ctx.counter.get(), 0);
    }

    #[tokio::test]
    async fn reload_reuses_cached_payloads() {
        let heightmap = RgbaImage::from_pixel(8, 8, image::Rgba([1, 134, 170, 255]));
        let source = StubSource::default()
            .with("terrain-rgb", StubReply::Bytes(png_bytes(&heightmap)))
            .with("satellite", StubReply::Bytes(png_bytes(&procedural::texture_fallback(1))));
        let ctx = context(source);
        let mut tile = tile_at(0.0, 0.0);
        let mut scene = RecordingScene::default();

        tile.check_visibility(&near(), &mut scene, &ctx.counter);
        tile.load(&ctx, &mut scene).await.unwrap();
        tile.check_visibility(&far_away(), &mut scene, &ctx.counter);
        tile.check_visibility(&near(), &mut scene, &ctx.counter);
        tile.load(&ctx, &mut scene).await.unwrap();

        assert_eq!(ctx.source.calls(), 2);
        assert_eq!(scene.added.len(), 2);
        // 10 steps of 0.1 m above sea level
        assert!((scene.added[1].positions[0][2] - 1.0).abs() < 1e-4);
    }
}
