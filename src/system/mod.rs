//! Backend orchestration and cross-thread plumbing.
//!
//! Contains the top-level `SlamBackend` that spawns and coordinates the
//! refiner and relocation threads, the shared state they operate on, and
//! the forward-propagation protocol that keeps live tracking consistent
//! with background rewrites.

pub mod backend;
pub mod propagation;
pub mod shared_state;
pub mod tracking_link;

pub use backend::{BackendConfig, SlamBackend};
pub use propagation::{PropagationReport, Propagator};
pub use shared_state::SharedState;
pub use tracking_link::{TrackingLink, TrackingState};
