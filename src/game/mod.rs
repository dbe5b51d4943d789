//! Game Logic Module
//!
//! All rhythm simulation code. Deterministic for a given sequence of
//! pressures and clock deltas.
//!
//! ## Module Structure
//!
//! - `command`: Drum keys, command definitions, command registry
//! - `matcher`: Pressure ranking and step matching
//! - `combo`: Chain, fever and jinn energy
//! - `ability`: Ability phases and hero mode
//! - `engine`: Per-player rhythm engine
//! - `tick`: Engine world and the parallel tick
//! - `events`: Engine events for collaborators

pub mod command;
pub mod matcher;
pub mod combo;
pub mod ability;
pub mod engine;
pub mod tick;
pub mod events;

// Re-export key types
pub use command::{CommandDefinition, CommandId, CommandRegistry, CommandStep, RhythmKey};
pub use matcher::{FailReason, PressureInput, PressureRank};
pub use engine::{EngineId, EnginePhase, GhostId, PlayerId, PressureOutcome, RhythmEngine};
pub use tick::{EngineInputs, EngineWorld, TickResult};
pub use events::{EngineEvent, EngineEventData};
