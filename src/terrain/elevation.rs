//! Terrain-RGB elevation codec.
//!
//! `elevation = -10000 + (R * 65536 + G * 256 + B) * 0.1` metres, from
//! -10000 m upward at 0.1 m resolution.

const BASE_ELEVATION_M: f64 = -10_000.0;
const STEP_M: f64 = 0.1;
const MAX_CODE: u32 = 0x00FF_FFFF;

/// The pixel triple that decodes to exactly 0 m (sea level).
pub const SEA_LEVEL_RGB: [u8; 3] = [1, 134, 160];

/// Decode a pixel triple to metres.
pub fn decode(r: u8, g: u8, b: u8) -> f32 {
    let code = (r as u32) << 16 | (g as u32) << 8 | b as u32;
    (BASE_ELEVATION_M + code as f64 * STEP_M) as f32
}

/// Encode metres to the nearest representable pixel triple.
pub fn encode(meters: f64) -> [u8; 3] {
    let code = ((meters - BASE_ELEVATION_M) / STEP_M)
        .round()
        .clamp(0.0, MAX_CODE as f64) as u32;
    [(code >> 16) as u8, (code >> 8) as u8, code as u8]
}
