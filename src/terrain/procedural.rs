//! Procedural stand-ins for remote payloads that failed or took too long.

use image::{Rgba, RgbaImage};

use super::elevation::SEA_LEVEL_RGB;
use crate::constants::{FALLBACK_CHECKER_CELL, FALLBACK_SIZE};

// Ground cover palette for the synthesized texture
const LIGHT_GROUND: [f32; 3] = [118.0, 140.0, 86.0];
const DARK_GROUND: [f32; 3] = [92.0, 112.0, 70.0];
const NOISE_AMPLITUDE: f32 = 18.0;

/// Flat heightmap at exactly 0 m. Every pixel carries the sea-level triple,
/// so decoding can never produce NaN or a spike.
pub fn terrain_fallback() -> RgbaImage {
    let [r, g, b] = SEA_LEVEL_RGB;
    RgbaImage::from_pixel(FALLBACK_SIZE, FALLBACK_SIZE, Rgba([r, g, b, 255]))
}

/// Checkerboard ground cover modulated by low-frequency sinusoidal noise.
/// Identical seeds produce identical images.
pub fn texture_fallback(seed: u32) -> RgbaImage {
    // Derive phases and frequencies from independent bit ranges of the seed.
    let phase_x = (seed & 0xFFFF) as f32 / 65_535.0 * std::f32::consts::TAU;
    let phase_y = (seed >> 16) as f32 / 65_535.0 * std::f32::consts::TAU;
    let freq_x = 0.02 + (seed % 7) as f32 * 0.004;
    let freq_y = 0.02 + (seed % 11) as f32 * 0.003;

    RgbaImage::from_fn(FALLBACK_SIZE, FALLBACK_SIZE, |x, y| {
        let checker = ((x / FALLBACK_CHECKER_CELL) + (y / FALLBACK_CHECKER_CELL)) % 2 == 0;
        let base = if checker { LIGHT_GROUND } else { DARK_GROUND };

        let fx = x as f32;
        let fy = y as f32;
        let noise = (fx * freq_x + phase_x).sin() * (fy * freq_y + phase_y).cos()
            + 0.5 * ((fx + fy) * freq_x * 0.5 + phase_y).sin();
        let offset = noise * NOISE_AMPLITUDE;

        let channel = |c: f32| (c + offset).clamp(0.0, 255.0) as u8;
        Rgba([channel(base[0]), channel(base[1]), channel(base[2]), 255])
    })
}

/// Stable seed for a tile name (32-bit FNV-1a).
pub fn seed_for_tile(name: &str) -> u32 {
    name.bytes().fold(0x811C_9DC5u32, |hash, byte| {
        (hash ^ byte as u32).wrapping_mul(0x0100_0193)
    })
}
