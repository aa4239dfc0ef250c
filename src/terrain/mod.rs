pub mod bvh;
pub mod elevation;
pub mod mesh;
pub mod plugin;
pub mod procedural;
pub mod source;
pub mod tile;
pub mod worker;

pub use bvh::*;
pub use mesh::*;
pub use plugin::*;
pub use source::*;
pub use tile::*;
pub use worker::*;
