//! Core deterministic primitives.
//!
//! Beat clock arithmetic and state hashing. Nothing here reads the wall
//! clock; every value derives from the elapsed milliseconds it is given.

pub mod clock;
pub mod hash;

// Re-export core types
pub use clock::{get_beat, get_flow_beat, get_phase, get_score, EngineProcess, EngineSettings};
pub use hash::{StateHash, StateHasher};
