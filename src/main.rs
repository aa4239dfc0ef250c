use bevy::prelude::*;

use terrain_stream::camera::CameraPlugin;
use terrain_stream::config::ConfigPlugin;
use terrain_stream::terrain::TerrainPlugin;

fn main() {
    App::new()
        .add_plugins((
            DefaultPlugins.set(WindowPlugin {
                primary_window: Some(Window {
                    title: "Terrain Stream".to_string(),
                    resolution: (1280, 720).into(),
                    ..default()
                }),
                ..default()
            }),
            ConfigPlugin,
        ))
        .add_plugins((CameraPlugin, TerrainPlugin))
        .run();
}
