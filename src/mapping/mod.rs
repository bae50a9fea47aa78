//! Background map refinement: scan-window optimization, downstream pose
//! propagation, and world-map rendering.

mod refiner;
mod world_map;

pub use refiner::{MapRefiner, RefinerConfig, RefinerStats, RefinerStatus};
pub use world_map::{render_scan, WorldMap};
