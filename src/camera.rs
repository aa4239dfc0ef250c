use bevy::prelude::*;

use crate::config::AppConfig;
use crate::constants;
use crate::terrain::{TerrainCamera, TerrainTile, TileBvh};

// =============================================================================
// Components
// =============================================================================

/// Keyboard-driven free flight state for the viewer camera.
#[derive(Component)]
pub struct FlyCamera {
    /// Heading in radians, 0 looking north
    pub yaw: f32,
    /// Nose angle in radians, negative looking down
    pub pitch: f32,
}

impl Default for FlyCamera {
    fn default() -> Self {
        Self {
            yaw: 0.0,
            pitch: -0.35,
        }
    }
}

impl FlyCamera {
    fn rotation(&self) -> Quat {
        Quat::from_euler(EulerRot::YXZ, self.yaw, self.pitch, 0.0)
    }
}

// =============================================================================
// Plugin
// =============================================================================

pub struct CameraPlugin;

impl Plugin for CameraPlugin {
    fn build(&self, app: &mut App) {
        app.insert_resource(ClearColor(Color::srgb(0.55, 0.7, 0.9)))
            .add_systems(Startup, setup_camera)
            .add_systems(Update, (fly_camera, keep_above_terrain).chain());
    }
}

fn setup_camera(mut commands: Commands, config: Res<AppConfig>) {
    let fly = FlyCamera::default();
    commands.spawn((
        Camera3d::default(),
        Projection::Perspective(PerspectiveProjection {
            far: config.world.view_distance,
            ..default()
        }),
        Transform::from_xyz(0.0, constants::CAMERA_START_ALTITUDE_M, 0.0)
            .with_rotation(fly.rotation()),
        fly,
        TerrainCamera,
        Name::new("Terrain Camera"),
    ));

    commands.spawn((
        DirectionalLight {
            illuminance: 12_000.0,
            shadows_enabled: false,
            ..default()
        },
        Transform::from_rotation(Quat::from_euler(EulerRot::YXZ, 0.6, -0.9, 0.0)),
        Name::new("Sun"),
    ));
}

// =============================================================================
// Camera Systems
// =============================================================================

fn fly_camera(
    time: Res<Time>,
    keys: Res<ButtonInput<KeyCode>>,
    mut query: Query<(&mut Transform, &mut FlyCamera)>,
) {
    let dt = time.delta_secs();
    let turn = constants::CAMERA_TURN_RATE_DEG.to_radians() * dt;

    for (mut transform, mut fly) in query.iter_mut() {
        if keys.pressed(KeyCode::ArrowLeft) {
            fly.yaw += turn;
        }
        if keys.pressed(KeyCode::ArrowRight) {
            fly.yaw -= turn;
        }
        if keys.pressed(KeyCode::ArrowUp) {
            fly.pitch += turn;
        }
        if keys.pressed(KeyCode::ArrowDown) {
            fly.pitch -= turn;
        }
        fly.pitch = fly.pitch.clamp(-1.5, 1.5);
        transform.rotation = fly.rotation();

        // Ground-relative axes so W/S never change altitude
        let forward = (transform.rotation * Vec3::NEG_Z).with_y(0.0).normalize_or_zero();
        let right = Vec3::new(-forward.z, 0.0, forward.x);

        let mut direction = Vec3::ZERO;
        if keys.pressed(KeyCode::KeyW) {
            direction += forward;
        }
        if keys.pressed(KeyCode::KeyS) {
            direction -= forward;
        }
        if keys.pressed(KeyCode::KeyD) {
            direction += right;
        }
        if keys.pressed(KeyCode::KeyA) {
            direction -= right;
        }
        if keys.pressed(KeyCode::KeyE) {
            direction += Vec3::Y;
        }
        if keys.pressed(KeyCode::KeyQ) {
            direction -= Vec3::Y;
        }

        let mut speed = constants::CAMERA_SPEED_MPS;
        if keys.pressed(KeyCode::ShiftLeft) || keys.pressed(KeyCode::ShiftRight) {
            speed *= constants::CAMERA_BOOST;
        }
        transform.translation += direction.normalize_or_zero() * speed * dt;
    }
}

/// World-space terrain height under `point`, if `point` lies over this tile.
pub fn ground_height(tile_transform: &Transform, bvh: &TileBvh, point: Vec3) -> Option<f32> {
    let local = tile_transform.rotation.inverse() * (point - tile_transform.translation);
    let height = bvh.height_at(local.truncate())?;
    Some(tile_transform.transform_point(local.with_z(height)).y)
}

fn keep_above_terrain(
    mut camera_query: Query<&mut Transform, With<TerrainCamera>>,
    tiles: Query<(&TerrainTile, &Transform), Without<TerrainCamera>>,
) {
    let Ok(mut camera) = camera_query.single_mut() else {
        return;
    };

    let ground = tiles.iter().find_map(|(tile, transform)| {
        tile.spatial_index()
            .and_then(|bvh| ground_height(transform, bvh, camera.translation))
    });

    if let Some(ground) = ground {
        let floor = ground + constants::CAMERA_GROUND_CLEARANCE_M;
        if camera.translation.y < floor {
            camera.translation.y = floor;
        }
    }
}
