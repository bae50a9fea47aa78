//! Loop closure: place indexing, revisit detection, geometric
//! verification, and the history-rewriting correction pipeline.

mod brief;
mod corrector;
mod database;
mod detector;
mod engine;
mod submaps;
mod verifier;

pub use brief::BriefExtractor;
pub use corrector::correct_loop;
pub use database::{EntryId, PlaceDatabase};
pub use detector::{detect_candidate, LoopCandidate, LoopDetectorConfig};
pub use engine::{RelocationConfig, RelocationEngine, RelocationStats};
pub use submaps::{ClaimedAnchor, SubmapLedger, SubmapRecord};
pub use verifier::{verify_loop, VerifyConfig};
