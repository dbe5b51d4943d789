//! Simulation Tick
//!
//! Advances every engine of a world by one fixed step. Engines never touch
//! each other's state, so their updates run on the rayon pool; inputs of one
//! engine are applied in arrival order and events are sorted after the join.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Serialize, Deserialize};

use crate::core::clock::EngineSettings;
use crate::core::hash::{StateHash, StateHasher};
use crate::game::ability::AbilityCommands;
use crate::game::command::CommandRegistry;
use crate::game::engine::{EngineId, GhostId, PressureOutcome, RhythmEngine};
use crate::game::events::{EngineEvent, EngineEventData};
use crate::game::matcher::PressureInput;

/// Ordered pressure queue per engine (BTreeMap for deterministic order).
pub type EngineInputs = BTreeMap<EngineId, Vec<PressureInput>>;

/// Result of a tick.
#[derive(Debug, Default)]
pub struct TickResult {
    /// Tick that was simulated
    pub tick: u32,
    /// Events generated this tick, sorted
    pub events: Vec<EngineEvent>,
    /// Outcome of every applied pressure, per engine in input order
    pub outcomes: Vec<(EngineId, PressureOutcome)>,
}

// =============================================================================
// WORLD
// =============================================================================

/// All engines of a session.
///
/// Uses BTreeMap for deterministic iteration order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineWorld {
    /// Next tick to simulate
    pub tick: u32,
    engines: BTreeMap<EngineId, RhythmEngine>,
    ghosts: BTreeMap<GhostId, EngineId>,
    next_engine_id: u32,
    next_ghost_id: u32,
}

impl EngineWorld {
    /// Create an empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new idle engine.
    pub fn spawn_engine(
        &mut self,
        settings: EngineSettings,
        ability_commands: AbilityCommands,
    ) -> (EngineId, GhostId) {
        let id = EngineId(self.next_engine_id);
        self.next_engine_id += 1;
        // Ghost 0 is reserved for "no ghost" on the wire
        self.next_ghost_id += 1;
        let ghost = GhostId(self.next_ghost_id);

        let mut engine = RhythmEngine::new(id, ghost, settings);
        engine.set_ability_commands(ability_commands);
        self.engines.insert(id, engine);
        self.ghosts.insert(ghost, id);
        (id, ghost)
    }

    /// Remove an engine and its ghost mapping.
    pub fn remove_engine(&mut self, id: EngineId) -> Option<RhythmEngine> {
        let engine = self.engines.remove(&id)?;
        self.ghosts.remove(&engine.ghost());
        Some(engine)
    }

    /// Get an engine by ID.
    pub fn engine(&self, id: EngineId) -> Option<&RhythmEngine> {
        self.engines.get(&id)
    }

    /// Get an engine mutably by ID.
    pub fn engine_mut(&mut self, id: EngineId) -> Option<&mut RhythmEngine> {
        self.engines.get_mut(&id)
    }

    /// Map a replicated id to its engine.
    pub fn resolve_ghost(&self, ghost: GhostId) -> Option<EngineId> {
        self.ghosts.get(&ghost).copied()
    }

    /// All engines in id order.
    pub fn engines(&self) -> impl Iterator<Item = &RhythmEngine> {
        self.engines.values()
    }

    /// Number of engines.
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Whether the world has no engine.
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Compute hash of every engine, in id order.
    pub fn compute_hash(&self) -> StateHash {
        let mut hasher = StateHasher::for_world();
        hasher.update_u32(self.tick);
        hasher.update_u32(self.engines.len() as u32);
        for (id, engine) in &self.engines {
            hasher.update_u32(id.0);
            hasher.update_bytes(&engine.compute_hash());
        }
        hasher.finalize()
    }
}

// =============================================================================
// TICK
// =============================================================================

struct EngineTickOutput {
    id: EngineId,
    outcomes: Vec<PressureOutcome>,
    events: Vec<EngineEventData>,
}

fn run_engine(
    id: EngineId,
    engine: &mut RhythmEngine,
    registry: &CommandRegistry,
    inputs: &[PressureInput],
    delta_ms: i64,
) -> EngineTickOutput {
    let outcomes = inputs
        .iter()
        .map(|input| engine.apply_pressure(registry, *input))
        .collect();
    engine.advance(registry, delta_ms);

    #[cfg(feature = "debug-tracing")]
    tracing::trace!(
        engine = id.0,
        beat = engine.current_beat(),
        phase = ?engine.phase(),
        chain = engine.combo().chain,
        "engine tick"
    );

    EngineTickOutput {
        id,
        outcomes,
        events: engine.take_events(),
    }
}

fn collect_result(tick: u32, outputs: Vec<EngineTickOutput>) -> TickResult {
    let mut result = TickResult {
        tick,
        ..Default::default()
    };

    for output in outputs {
        result
            .outcomes
            .extend(output.outcomes.into_iter().map(|o| (output.id, o)));
        result.events.extend(
            output
                .events
                .into_iter()
                .enumerate()
                .map(|(seq, data)| EngineEvent::new(tick, output.id, seq as u32, data)),
        );
    }

    // Cross-engine order is irrelevant to the simulation, sort for consumers
    result.events.sort();
    result
}

/// Run one simulation tick.
///
/// # Arguments
///
/// * `world` - The engines (will be mutated)
/// * `registry` - Command definitions
/// * `inputs` - Validated pressures for this tick, per engine in arrival order
/// * `delta_ms` - Clock advance
///
/// Inputs are applied before the clock moves. Inputs for unknown engines are
/// dropped.
pub fn tick(
    world: &mut EngineWorld,
    registry: &CommandRegistry,
    inputs: &EngineInputs,
    delta_ms: i64,
) -> TickResult {
    let tick = world.tick;
    let outputs: Vec<EngineTickOutput> = world
        .engines
        .par_iter_mut()
        .map(|(id, engine)| {
            let queue = inputs.get(id).map(Vec::as_slice).unwrap_or(&[]);
            run_engine(*id, engine, registry, queue, delta_ms)
        })
        .collect();

    world.tick += 1;
    collect_result(tick, outputs)
}

/// Single-threaded reference of [`tick`]. Produces identical state.
pub fn tick_sequential(
    world: &mut EngineWorld,
    registry: &CommandRegistry,
    inputs: &EngineInputs,
    delta_ms: i64,
) -> TickResult {
    let tick = world.tick;
    let outputs: Vec<EngineTickOutput> = world
        .engines
        .iter_mut()
        .map(|(id, engine)| {
            let queue = inputs.get(id).map(Vec::as_slice).unwrap_or(&[]);
            run_engine(*id, engine, registry, queue, delta_ms)
        })
        .collect();

    world.tick += 1;
    collect_result(tick, outputs)
}
