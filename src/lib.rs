pub mod cloud;
pub mod geometry;
pub mod map;
pub mod mapping;
pub mod optimizer;
pub mod relocation;
pub mod system;
