//! # Rhythm Engine Server
//!
//! Authoritative timing and scoring for drum-command rhythm gameplay:
//! players press one of four drum keys on the beat, the engine matches the
//! pressures against command patterns and tracks combo, fever and hero mode.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   RHYTHM ENGINE SERVER                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  config.rs       - Server env config, song JSON config      │
//! │                                                             │
//! │  core/           - Deterministic primitives                 │
//! │  ├── clock.rs    - Beat, phase, score, flow beat            │
//! │  └── hash.rs     - State hashing for verification           │
//! │                                                             │
//! │  game/           - Rhythm logic (deterministic)             │
//! │  ├── command.rs  - Drum keys, commands, registry            │
//! │  ├── matcher.rs  - Pressure ranking and step matching       │
//! │  ├── combo.rs    - Chain, fever, jinn energy                │
//! │  ├── ability.rs  - Ability phases, hero mode                │
//! │  ├── engine.rs   - Per-player rhythm engine                 │
//! │  ├── tick.rs     - Engine world, parallel tick              │
//! │  └── events.rs   - Engine events                            │
//! │                                                             │
//! │  network/        - Networking (non-deterministic)           │
//! │  ├── protocol.rs - Binary RPC and JSON messages             │
//! │  ├── reconcile.rs- Server authority over pressures          │
//! │  ├── prediction.rs- Client prediction and replay            │
//! │  ├── session.rs  - Connections, engines, RPC queue          │
//! │  └── server.rs   - WebSocket server and tick loop           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! The `core/` and `game/` modules are deterministic:
//! - Anything iterated is a BTreeMap/BTreeSet; the registry's HashMap is
//!   only used for lookups
//! - No system time dependencies, the clock only moves by given deltas
//! - Engines never read each other's state, so the parallel tick and the
//!   sequential tick produce identical hashes
//!
//! Scores are `f32` but always derived from integer milliseconds the same
//! way on client and server.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, RegisteredSong, ServerConfig, SongConfig};
pub use core::clock::{EngineProcess, EngineSettings};
pub use game::command::{CommandId, CommandRegistry, CommandStep, RhythmKey};
pub use game::engine::{EngineId, GhostId, PlayerId, RhythmEngine};
pub use game::tick::{EngineWorld, TickResult};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server tick rate (Hz)
pub const TICK_RATE: u32 = 60;
