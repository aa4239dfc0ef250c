use bevy::prelude::*;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::bvh::{SpatialIndexBuilder, SpatialIndexError, TileBvh};
use super::source::TileSource;
use super::tile::{TerrainContext, TileBuild, TileLoadError, TileLoadRequest};

/// Results sent back to the Bevy world.
#[derive(Debug)]
pub enum WorkerEvent {
    Loaded {
        entity: Entity,
        generation: u64,
        result: Result<TileBuild, TileLoadError>,
    },
    SpatialIndex {
        entity: Entity,
        generation: u64,
        result: Result<TileBvh, SpatialIndexError>,
    },
}

/// Handle to the background tile loader.
///
/// Loads run on a dedicated thread with its own single-threaded tokio
/// runtime. Every request becomes an independent task, so a slow tile never
/// holds up the others, and nothing here ever blocks the caller.
pub struct TerrainWorker {
    requests: mpsc::UnboundedSender<(Entity, TileLoadRequest)>,
    events: Receiver<WorkerEvent>,
}

impl TerrainWorker {
    pub fn spawn<S, B>(ctx: TerrainContext<S>, builder: B) -> std::io::Result<Self>
    where
        S: TileSource,
        B: SpatialIndexBuilder,
    {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();

        std::thread::Builder::new()
            .name("terrain-fetch".to_string())
            .spawn(move || run(ctx, builder, request_rx, event_tx))?;

        Ok(Self {
            requests: request_tx,
            events: event_rx,
        })
    }

    pub fn submit(&self, entity: Entity, request: TileLoadRequest) -> Result<(), TileLoadError> {
        self.requests
            .send((entity, request))
            .map_err(|_| TileLoadError::WorkerUnavailable)
    }

    /// Drain whatever has finished since the last call.
    pub fn try_events(&self) -> impl Iterator<Item = WorkerEvent> + '_ {
        self.events.try_iter()
    }
}

#[cfg(test)]
impl TerrainWorker {
    /// A worker with no thread behind it; the caller plays the worker side.
    pub(crate) fn detached() -> (
        Self,
        mpsc::UnboundedReceiver<(Entity, TileLoadRequest)>,
        Sender<WorkerEvent>,
    ) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let worker = Self {
            requests: request_tx,
            events: event_rx,
        };
        (worker, request_rx, event_tx)
    }
}

fn run<S, B>(
    ctx: TerrainContext<S>,
    builder: B,
    mut requests: mpsc::UnboundedReceiver<(Entity, TileLoadRequest)>,
    events: Sender<WorkerEvent>,
) where
    S: TileSource,
    B: SpatialIndexBuilder,
{
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime for terrain worker: {}", e);
            return;
        }
    };

    let ctx = Arc::new(ctx);
    let builder = Arc::new(builder);

    rt.block_on(async move {
        info!("Terrain worker started");
        while let Some((entity, request)) = requests.recv().await {
            let ctx = Arc::clone(&ctx);
            let builder = Arc::clone(&builder);
            let events = events.clone();
            tokio::spawn(async move {
                let generation = request.generation;
                let name = request.name.clone();

                // A panicking load must still answer, or the tile stays Loading.
                let load = tokio::spawn(async move { request.run(&ctx).await });
                let result = match load.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Load task for tile {} failed: {}", name, e);
                        Err(TileLoadError::TaskFailed {
                            tile: name.clone(),
                            reason: e.to_string(),
                        })
                    }
                };
                let geometry = result.as_ref().ok().map(|build| build.mesh.geometry());

                if events
                    .send(WorkerEvent::Loaded { entity, generation, result })
                    .is_err()
                {
                    return;
                }

                // Spatial index joins back on its own; nobody waits for it.
                let Some(geometry) = geometry else {
                    return;
                };
                match tokio::task::spawn_blocking(move || builder.generate(&geometry)).await {
                    Ok(result) => {
                        let _ = events.send(WorkerEvent::SpatialIndex { entity, generation, result });
                    }
                    Err(e) => warn!("Spatial index task for {} failed: {}", name, e),
                }
            });
        }
        debug!("Terrain worker request channel closed, exiting");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::TileIndex;
    use crate::terrain::bvh::{GridBvhBuilder, TileGeometry};
    use crate::terrain::source::tests::{StubReply, StubSource};
    use crate::terrain::tile::PayloadOrigin;
    use std::time::Duration;

    struct FailingBuilder;

    impl SpatialIndexBuilder for FailingBuilder {
        fn generate(&self, _geometry: &TileGeometry) -> Result<TileBvh, SpatialIndexError> {
            Err(SpatialIndexError::EmptyGeometry)
        }
    }

    fn request(generation: u64) -> TileLoadRequest {
        TileLoadRequest {
            name: "0-0".to_string(),
            index: TileIndex { zoom: 12, col: 648, row: 2048 },
            extent: 1000.0,
            generation,
        }
    }

    fn next_event(worker: &TerrainWorker) -> WorkerEvent {
        worker
            .events
            .recv_timeout(Duration::from_secs(10))
            .expect("worker event")
    }

    #[test]
    fn load_then_spatial_index_are_reported() {
        let ctx = TerrainContext::new(StubSource::default());
        let worker = TerrainWorker::spawn(ctx, GridBvhBuilder::default()).unwrap();
        worker.submit(Entity::PLACEHOLDER, request(3)).unwrap();

        match next_event(&worker) {
            WorkerEvent::Loaded { entity, generation, result } => {
                assert_eq!(entity, Entity::PLACEHOLDER);
                assert_eq!(generation, 3);
                let build = result.unwrap();
                assert_eq!(build.terrain, PayloadOrigin::Procedural);
                assert_eq!(build.mesh.triangle_count(), 8192);
            }
            other => panic!("unexpected event {:?}", other),
        }

        match next_event(&worker) {
            WorkerEvent::SpatialIndex { generation, result, .. } => {
                assert_eq!(generation, 3);
                assert_eq!(result.unwrap().leaf_count(), 64);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn panicking_load_is_reported_as_failure() {
        let source = StubSource::default().with("terrain-rgb", StubReply::Panic);
        let worker = TerrainWorker::spawn(TerrainContext::new(source), GridBvhBuilder::default()).unwrap();
        worker.submit(Entity::PLACEHOLDER, request(5)).unwrap();

        match next_event(&worker) {
            WorkerEvent::Loaded { generation, result, .. } => {
                assert_eq!(generation, 5);
                assert!(matches!(result, Err(TileLoadError::TaskFailed { ref tile, .. }) if tile == "0-0"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // The worker keeps serving later requests.
        worker.submit(Entity::PLACEHOLDER, request(6)).unwrap();
        worker.submit(Entity::PLACEHOLDER, request(7)).unwrap();
        let failures = (0..2)
            .map(|_| next_event(&worker))
            .filter(|event| matches!(event, WorkerEvent::Loaded { result: Err(_), .. }))
            .count();
        assert_eq!(failures, 2);
    }

    #[test]
    fn spatial_index_failure_is_reported_not_fatal() {
        let ctx = TerrainContext::new(StubSource::default());
        let worker = TerrainWorker::spawn(ctx, FailingBuilder).unwrap();
        worker.submit(Entity::PLACEHOLDER, request(1)).unwrap();
        worker.submit(Entity::PLACEHOLDER, request(2)).unwrap();

        let mut loaded = 0;
        let mut failed = 0;
        for _ in 0..4 {
            match next_event(&worker) {
                WorkerEvent::Loaded { result, .. } => {
                    assert!(result.is_ok());
                    loaded += 1;
                }
                WorkerEvent::SpatialIndex { result, .. } => {
                    assert_eq!(result.unwrap_err(), SpatialIndexError::EmptyGeometry);
                    failed += 1;
                }
            }
        }
        assert_eq!((loaded, failed), (2, 2));
    }
}
