//! Rhythm Engine State
//!
//! One rhythm engine per player: its beat clock, the command being entered,
//! the command being executed, combo bookkeeping and the engine phase.
//!
//! ```text
//!            Start                CommandCompleted
//!   Idle ───────────► Active ─────────────────────► Chaining ◄──┐
//!    ▲                 │  ▲                          │  │       │
//!    │ Reset           │  │ BeatReached(until)       │  │ Hero  │ BeatReached(at)
//!    │ (any)  StepFailed  │         StepFailed       │  ▼       │
//!    │                 ▼  │ ◄────────────────────────┘  HeroActivation
//!    └──────────── Recovering { until_beat }
//! ```
//!
//! Gameplay failures never surface as errors: `apply_pressure` always returns
//! a `PressureOutcome`, and the engine is left in a consistent phase.

use std::collections::BTreeSet;
use serde::{Serialize, Deserialize};

use crate::core::clock::{EngineProcess, EngineSettings};
use crate::core::hash::{StateHash, StateHasher};
use crate::game::ability::{AbilityCommands, AbilityState, AbilityTrigger};
use crate::game::combo::{ComboState, JINN_ENERGY_PER_PERFECT};
use crate::game::command::{CommandDefinition, CommandId, CommandRegistry, RhythmKey};
use crate::game::events::{EngineEventData, ResetCause};
use crate::game::matcher::{
    classify, CommandMatcher, FailReason, MatchVerdict, PressureInput, PressureRank,
};

/// Beats during which pressures are ignored after a failure.
pub const RECOVERY_BEATS: i32 = 2;

/// Beats of consumed `(flow_beat, key)` pairs kept for duplicate detection.
const CONSUMED_HISTORY_BEATS: i32 = 4;

// =============================================================================
// IDS
// =============================================================================

/// Engine identifier, unique inside a world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EngineId(pub u32);

/// Replicated (network) identifier of an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GhostId(pub u32);

/// Unique player identifier (UUID as bytes).
///
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub [u8; 16]);

impl PlayerId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Create a random (v4) id.
    pub fn random() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    /// Create from UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s)
            .ok()
            .map(|u| Self(*u.as_bytes()))
    }

    /// Convert to UUID string.
    pub fn to_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.0).to_string()
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First bytes as hex, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

// =============================================================================
// LOCAL & EXECUTING STATE
// =============================================================================

/// Per-engine input bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineLocalState {
    /// Last pressure that reached the engine
    pub last_pressure: Option<PressureInput>,
    /// Pressures credited before this beat are ignored
    pub recovery_activation_beat: i32,
    /// Flow beat of the last pressure
    pub last_pressure_beat: i32,
    /// Mirror of the engine clock
    pub elapsed_ms: i64,
}

impl EngineLocalState {
    /// The clock has started.
    #[inline]
    pub fn can_run_commands(&self) -> bool {
        self.elapsed_ms > 0
    }

    /// `beat` falls inside the recovery window.
    #[inline]
    pub fn is_recovery(&self, beat: i32) -> bool {
        self.recovery_activation_beat > beat
    }

    fn hash_into(&self, hasher: &mut StateHasher) {
        match &self.last_pressure {
            Some(p) => {
                hasher.update_u8(1);
                hasher.update_i32(p.key.as_i32());
                hasher.update_i32(p.flow_beat);
                hasher.update_f32(p.score);
            }
            None => hasher.update_u8(0),
        }
        hasher.update_i32(self.recovery_activation_beat);
        hasher.update_i32(self.last_pressure_beat);
        hasher.update_i64(self.elapsed_ms);
    }
}

/// Command that was completed and is about to run or running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutingCommandState {
    /// Command executed before this one
    pub previous: Option<CommandId>,
    /// Command being executed
    pub target: Option<CommandId>,
    /// First beat of execution (inclusive)
    pub activation_beat_start: i32,
    /// End of execution (exclusive)
    pub activation_beat_end: i32,
    /// Power in `0..=100`
    pub power_integer: i32,
    /// Completed but not yet activated
    pub waiting_for_apply: bool,
}

impl ExecutingCommandState {
    /// Power in `[0, 1]`.
    #[inline]
    pub fn power(&self) -> f64 {
        self.power_integer as f64 * 0.01
    }

    /// Set power from `[0, 1]`, clamped.
    pub fn set_power(&mut self, power: f64) {
        self.power_integer = (power * 100.0).clamp(0.0, 100.0) as i32;
    }

    /// Whether `beat` lies in the execution range.
    #[inline]
    pub fn is_executing_at(&self, beat: i32) -> bool {
        self.target.is_some()
            && beat >= self.activation_beat_start
            && beat < self.activation_beat_end
    }

    /// Drop everything, no partially applied power survives.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn hash_into(&self, hasher: &mut StateHasher) {
        hasher.update_opt_u32(self.previous.map(|c| c.0));
        hasher.update_opt_u32(self.target.map(|c| c.0));
        hasher.update_i32(self.activation_beat_start);
        hasher.update_i32(self.activation_beat_end);
        hasher.update_i32(self.power_integer);
        hasher.update_bool(self.waiting_for_apply);
    }
}

// =============================================================================
// ENGINE PHASE
// =============================================================================

/// Phase of a rhythm engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EnginePhase {
    /// Not started, or reset
    #[default]
    Idle,
    /// Running, no chain
    Active,
    /// Running with a live combo chain
    Chaining,
    /// Failed, pressures before `until_beat` are ignored
    Recovering { until_beat: i32 },
    /// Hero mode starts at `activates_at`
    HeroActivation { activates_at: i32 },
}

/// Event that may move an engine phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseTrigger {
    /// Clock started with a command bound
    Start,
    /// A command was completed
    CommandCompleted,
    /// A command attempt failed on `current_beat`
    StepFailed { current_beat: i32 },
    /// Engine clock reached `beat`
    BeatReached(i32),
    /// Hero mode was granted
    HeroTriggered { activates_at: i32 },
    /// Chain dropped without failure
    ChainBroken,
    /// Death, song end or explicit stop
    Reset,
}

impl EnginePhase {
    /// Transition table. `None` means the trigger does not apply in this phase.
    pub fn transition(self, trigger: PhaseTrigger) -> Option<EnginePhase> {
        use EnginePhase as P;
        use PhaseTrigger as T;

        match (self, trigger) {
            (_, T::Reset) => Some(P::Idle),
            (P::Idle, T::Start) => Some(P::Active),
            (P::Active | P::Chaining, T::CommandCompleted) => Some(P::Chaining),
            (P::Active | P::Chaining | P::HeroActivation { .. }, T::StepFailed { current_beat }) => {
                Some(P::Recovering { until_beat: current_beat + RECOVERY_BEATS })
            }
            (P::Recovering { until_beat }, T::BeatReached(beat)) if beat >= until_beat => {
                Some(P::Active)
            }
            (P::HeroActivation { activates_at }, T::BeatReached(beat)) if beat >= activates_at => {
                Some(P::Chaining)
            }
            (P::Active | P::Chaining, T::HeroTriggered { activates_at }) => {
                Some(P::HeroActivation { activates_at })
            }
            (P::Chaining | P::HeroActivation { .. }, T::ChainBroken) => Some(P::Active),
            _ => None,
        }
    }

    /// Engine clock is running.
    #[inline]
    pub fn is_running(self) -> bool {
        self != EnginePhase::Idle
    }

    fn hash_into(&self, hasher: &mut StateHasher) {
        match *self {
            EnginePhase::Idle => hasher.update_u8(0),
            EnginePhase::Active => hasher.update_u8(1),
            EnginePhase::Chaining => hasher.update_u8(2),
            EnginePhase::Recovering { until_beat } => {
                hasher.update_u8(3);
                hasher.update_i32(until_beat);
            }
            EnginePhase::HeroActivation { activates_at } => {
                hasher.update_u8(4);
                hasher.update_i32(activates_at);
            }
        }
    }
}

// =============================================================================
// OUTCOMES & ERRORS
// =============================================================================

/// Why a pressure had no effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IgnoreReason {
    /// Engine is idle or has no command bound
    NotRunning,
    /// Bound command is missing from the registry
    UnknownCommand,
    /// Same `(flow_beat, key)` was already consumed
    Duplicate,
    /// Pressure fell in the recovery window
    Recovery,
}

/// Result of applying one pressure.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum PressureOutcome {
    /// Nothing changed besides bookkeeping
    Ignored(IgnoreReason),
    /// Step matched
    Progress { step: usize, rank: PressureRank },
    /// Command completed and scheduled for execution
    Completed { command: CommandId, power: u8 },
    /// Attempt failed, engine is recovering
    Failed(FailReason),
}

impl PressureOutcome {
    /// Pressure was consumed by the matcher.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, PressureOutcome::Ignored(_))
    }
}

/// Engine configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Command is not in this engine's allowed set.
    #[error("Command {0:?} is not allowed")]
    CommandNotAllowed(CommandId),

    /// Command id is not registered.
    #[error("Unknown command {0:?}")]
    UnknownCommand(CommandId),
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Read-only view of an engine, published every tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// Engine id
    pub engine_id: EngineId,
    /// Replicated id
    pub ghost_id: GhostId,
    /// Owning player
    pub owner: Option<PlayerId>,
    /// Milliseconds since start
    pub elapsed_ms: i64,
    /// Current beat
    pub beat: i32,
    /// Position in the current beat
    pub beat_phase: f32,
    /// Phase
    pub phase: EnginePhase,
    /// Command being entered
    pub bound_command: Option<CommandId>,
    /// Next expected step
    pub cursor: usize,
    /// Command being executed
    pub executing: ExecutingCommandState,
    /// Combo state
    pub combo: ComboState,
    /// Ability state
    pub ability: AbilityState,
    /// End of the recovery window
    pub recovery_activation_beat: i32,
}

// =============================================================================
// ENGINE
// =============================================================================

/// Complete state of one rhythm engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RhythmEngine {
    id: EngineId,
    ghost: GhostId,
    owner: Option<PlayerId>,
    settings: EngineSettings,
    process: EngineProcess,
    local: EngineLocalState,
    phase: EnginePhase,
    matcher: Option<CommandMatcher>,
    executing: ExecutingCommandState,
    combo: ComboState,
    ability: AbilityState,
    ability_commands: AbilityCommands,
    /// `(flow_beat, key)` pairs already consumed (BTreeSet for deterministic hashing)
    consumed: BTreeSet<(i32, RhythmKey)>,
    /// Events raised since the last `take_events`
    #[serde(skip)]
    pending_events: Vec<EngineEventData>,
}

impl RhythmEngine {
    /// Create an idle engine.
    pub fn new(id: EngineId, ghost: GhostId, settings: EngineSettings) -> Self {
        Self {
            id,
            ghost,
            owner: None,
            settings,
            process: EngineProcess::default(),
            local: EngineLocalState::default(),
            phase: EnginePhase::Idle,
            matcher: None,
            executing: ExecutingCommandState::default(),
            combo: ComboState::default(),
            ability: AbilityState::default(),
            ability_commands: AbilityCommands::default(),
            consumed: BTreeSet::new(),
            pending_events: Vec::new(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Engine id.
    pub fn id(&self) -> EngineId {
        self.id
    }

    /// Replicated id.
    pub fn ghost(&self) -> GhostId {
        self.ghost
    }

    /// Owning player.
    pub fn owner(&self) -> Option<PlayerId> {
        self.owner
    }

    /// Set or clear the owning player.
    pub fn set_owner(&mut self, owner: Option<PlayerId>) {
        self.owner = owner;
    }

    /// Clock settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Clock state.
    pub fn process(&self) -> &EngineProcess {
        &self.process
    }

    /// Input bookkeeping.
    pub fn local(&self) -> &EngineLocalState {
        &self.local
    }

    /// Current phase.
    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// Command being executed.
    pub fn executing(&self) -> &ExecutingCommandState {
        &self.executing
    }

    /// Combo state.
    pub fn combo(&self) -> &ComboState {
        &self.combo
    }

    /// Ability state.
    pub fn ability(&self) -> &AbilityState {
        &self.ability
    }

    /// Command currently being entered.
    pub fn bound_command(&self) -> Option<CommandId> {
        self.matcher.as_ref().map(|m| m.target())
    }

    /// Current beat.
    pub fn current_beat(&self) -> i32 {
        self.process.beat(&self.settings)
    }

    /// Beat a pressure right now would be credited to.
    pub fn flow_beat(&self) -> i32 {
        self.process.flow_beat(&self.settings)
    }

    /// Score a pressure right now would get.
    pub fn score(&self) -> f32 {
        self.process.score(&self.settings)
    }

    /// Whether `(flow_beat, key)` was already consumed.
    pub fn has_consumed(&self, flow_beat: i32, key: RhythmKey) -> bool {
        self.consumed.contains(&(flow_beat, key))
    }

    /// Take events raised since the last call.
    pub fn take_events(&mut self) -> Vec<EngineEventData> {
        std::mem::take(&mut self.pending_events)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Restrict the commands this engine may bind.
    pub fn set_ability_commands(&mut self, commands: AbilityCommands) {
        self.ability_commands = commands;
    }

    /// Select the command the player is entering.
    ///
    /// Rebinding restarts matching from step 0.
    pub fn bind_command(
        &mut self,
        registry: &CommandRegistry,
        command: CommandId,
    ) -> Result<(), EngineError> {
        if registry.get(command).is_none() {
            return Err(EngineError::UnknownCommand(command));
        }
        if !self.ability_commands.allows(command, self.ability.hero_mode) {
            return Err(EngineError::CommandNotAllowed(command));
        }
        if self.bound_command() != Some(command) {
            self.matcher = Some(CommandMatcher::new(command));
        }
        Ok(())
    }

    // =========================================================================
    // Simulation
    // =========================================================================

    /// Advance the engine clock and run beat-driven transitions.
    pub fn advance(&mut self, registry: &CommandRegistry, delta_ms: i64) {
        self.process.advance(delta_ms, &self.settings);
        self.local.elapsed_ms = self.process.elapsed_ms;
        let beat = self.current_beat();

        if self.settings.is_song_over(beat) {
            self.reset(ResetCause::SongEnded);
            return;
        }

        if self.phase == EnginePhase::Idle {
            if !self.local.can_run_commands() || self.matcher.is_none() {
                return;
            }
            if self.fire(PhaseTrigger::Start) {
                self.emit(EngineEventData::Started);
            }
        }

        self.on_beat(registry, beat);

        let floor = self.flow_beat() - CONSUMED_HISTORY_BEATS;
        self.consumed = self.consumed.split_off(&(floor, RhythmKey::Pata));
    }

    fn on_beat(&mut self, registry: &CommandRegistry, beat: i32) {
        let before = self.phase;
        if self.fire(PhaseTrigger::BeatReached(beat)) {
            if let EnginePhase::HeroActivation { .. } = before {
                self.ability.start_hero_mode();
                self.ability.apply(AbilityTrigger::ActivationReached);
                self.emit(EngineEventData::HeroModeStarted);
            }
        }

        // An attempt whose next step is already behind the clock is dropped
        if let Some(matcher) = self.matcher.as_mut() {
            if matcher.in_progress() {
                let expected = registry
                    .get(matcher.target())
                    .and_then(|def| def.steps().get(matcher.cursor()).map(|s| s.beat_offset));
                match expected {
                    Some(offset) if beat <= matcher.start_beat() + offset => {}
                    _ => matcher.reset(),
                }
            }
        }

        let Some(command) = self.executing.target else {
            return;
        };

        if self.executing.waiting_for_apply && beat >= self.executing.activation_beat_start {
            self.executing.waiting_for_apply = false;
            self.ability.apply(AbilityTrigger::ActivationReached);
            self.emit(EngineEventData::CommandActivated {
                command,
                power: self.executing.power_integer as u8,
            });
        }

        let end = self.executing.activation_beat_end;
        if !self.executing.waiting_for_apply && beat >= end {
            self.ability.apply(AbilityTrigger::ExecutionEnded);
        }

        let next_started = self
            .matcher
            .as_ref()
            .map(|m| m.in_progress() && m.start_beat() <= end)
            .unwrap_or(false);
        if beat > end && !next_started {
            self.break_chain();
        }
    }

    /// Apply one pressure.
    ///
    /// `input.score` must come from the authoritative clock when called on
    /// the server.
    pub fn apply_pressure(
        &mut self,
        registry: &CommandRegistry,
        input: PressureInput,
    ) -> PressureOutcome {
        if !self.phase.is_running() {
            return PressureOutcome::Ignored(IgnoreReason::NotRunning);
        }
        let Some(target) = self.bound_command() else {
            return PressureOutcome::Ignored(IgnoreReason::NotRunning);
        };
        let Some(definition) = registry.get(target) else {
            return PressureOutcome::Ignored(IgnoreReason::UnknownCommand);
        };
        if !self.consumed.insert((input.flow_beat, input.key)) {
            return PressureOutcome::Ignored(IgnoreReason::Duplicate);
        }

        self.local.last_pressure = Some(input);
        self.local.last_pressure_beat = input.flow_beat;

        // An early press may end recovery before the clock does
        if let EnginePhase::Recovering { .. } = self.phase {
            self.fire(PhaseTrigger::BeatReached(input.flow_beat));
        }
        if self.local.is_recovery(input.flow_beat) {
            return PressureOutcome::Ignored(IgnoreReason::Recovery);
        }

        if classify(input.score) == PressureRank::Perfect {
            self.combo.add_jinn_energy(JINN_ENERGY_PER_PERFECT);
        } else if self.ability.record_imperfect() {
            self.emit(EngineEventData::HeroModeEnded);
        }

        if self.executing.is_executing_at(input.flow_beat) {
            return self.fail(FailReason::InputDuringExecution {
                flow_beat: input.flow_beat,
            });
        }

        let verdict = match self.matcher.as_mut() {
            Some(matcher) => matcher.feed(&definition, &input, self.local.recovery_activation_beat),
            None => return PressureOutcome::Ignored(IgnoreReason::NotRunning),
        };

        match verdict {
            MatchVerdict::Ignored => PressureOutcome::Ignored(IgnoreReason::Recovery),
            MatchVerdict::Progress { step, rank } => PressureOutcome::Progress { step, rank },
            MatchVerdict::Completed { power, .. } => {
                self.complete(&definition, input.flow_beat, power)
            }
            MatchVerdict::Failed(reason) => self.fail(reason),
        }
    }

    fn complete(
        &mut self,
        definition: &CommandDefinition,
        last_flow_beat: i32,
        power: u8,
    ) -> PressureOutcome {
        let command = definition.id;
        let start = last_flow_beat + 1;

        self.executing = ExecutingCommandState {
            previous: self.executing.target,
            target: Some(command),
            activation_beat_start: start,
            activation_beat_end: start + definition.beat_length(),
            power_integer: power as i32,
            waiting_for_apply: true,
        };

        let fever_started = self.combo.on_command_success(power);
        self.ability.combo = self.combo.chain;
        self.ability.apply(AbilityTrigger::CommandCompleted);
        self.fire(PhaseTrigger::CommandCompleted);

        self.emit(EngineEventData::CommandCompleted {
            command,
            power,
            chain: self.combo.chain,
        });
        if fever_started {
            self.emit(EngineEventData::FeverStarted { chain: self.combo.chain });
        }

        PressureOutcome::Completed { command, power }
    }

    fn fail(&mut self, reason: FailReason) -> PressureOutcome {
        let beat = self.current_beat();

        if let Some(matcher) = self.matcher.as_mut() {
            matcher.reset();
        }
        self.combo.reset_chain();
        self.executing.clear();
        self.end_ability();

        let recovery_until = beat + RECOVERY_BEATS;
        self.local.recovery_activation_beat = recovery_until;
        self.fire(PhaseTrigger::StepFailed { current_beat: beat });

        self.emit(EngineEventData::CommandFailed { reason, recovery_until });
        PressureOutcome::Failed(reason)
    }

    fn break_chain(&mut self) {
        let chain = self.combo.chain;
        self.combo.reset_chain();
        self.executing.clear();
        self.end_ability();
        self.fire(PhaseTrigger::ChainBroken);
        self.emit(EngineEventData::ChainBroken { chain });
    }

    fn end_ability(&mut self) {
        let had_hero_mode = self.ability.hero_mode;
        self.ability.reset();
        if had_hero_mode {
            self.emit(EngineEventData::HeroModeEnded);
        }
    }

    /// Grant hero mode: needs full jinn energy and a perfect last command.
    ///
    /// Hero mode starts one beat later. Returns false if not possible now.
    pub fn trigger_hero_activation(&mut self) -> bool {
        if self.ability.hero_mode || !self.combo.jinn_energy_full() || !self.combo.is_perfect {
            return false;
        }
        let activates_at = self.current_beat() + 1;
        if !self.fire(PhaseTrigger::HeroTriggered { activates_at }) {
            return false;
        }

        self.combo.consume_jinn_energy();
        self.ability.apply(AbilityTrigger::HeroTriggered);
        self.emit(EngineEventData::HeroModeTriggered { activates_at });
        true
    }

    /// Back to idle. Executing state is flushed as a whole.
    pub fn reset(&mut self, cause: ResetCause) {
        let was_running = self.phase.is_running();

        self.process = EngineProcess::default();
        self.local = EngineLocalState::default();
        self.executing.clear();
        if let Some(matcher) = self.matcher.as_mut() {
            matcher.reset();
        }
        self.combo = ComboState::default();
        self.ability.reset();
        self.consumed.clear();
        self.fire(PhaseTrigger::Reset);

        if was_running {
            self.emit(EngineEventData::EngineReset { cause });
        }
    }

    fn fire(&mut self, trigger: PhaseTrigger) -> bool {
        match self.phase.transition(trigger) {
            Some(next) if next != self.phase => {
                self.phase = next;
                true
            }
            _ => false,
        }
    }

    fn emit(&mut self, data: EngineEventData) {
        self.pending_events.push(data);
    }

    // =========================================================================
    // Snapshots & hashing
    // =========================================================================

    /// Read-only view for collaborators.
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            engine_id: self.id,
            ghost_id: self.ghost,
            owner: self.owner,
            elapsed_ms: self.process.elapsed_ms,
            beat: self.current_beat(),
            beat_phase: self.process.phase(&self.settings),
            phase: self.phase,
            bound_command: self.bound_command(),
            cursor: self.matcher.as_ref().map(|m| m.cursor()).unwrap_or(0),
            executing: self.executing,
            combo: self.combo,
            ability: self.ability,
            recovery_activation_beat: self.local.recovery_activation_beat,
        }
    }

    /// Compute hash of the engine state.
    pub fn compute_hash(&self) -> StateHash {
        let mut hasher = StateHasher::for_engine();

        hasher.update_u32(self.id.0);
        hasher.update_u32(self.ghost.0);
        match &self.owner {
            Some(owner) => {
                hasher.update_u8(1);
                hasher.update_uuid(owner.as_bytes());
            }
            None => hasher.update_u8(0),
        }
        hasher.update_i64(self.settings.beat_interval_ms());
        hasher.update_i32(self.settings.max_beat());
        hasher.update_i64(self.process.elapsed_ms);

        self.phase.hash_into(&mut hasher);
        match &self.matcher {
            Some(matcher) => {
                hasher.update_u8(1);
                matcher.hash_into(&mut hasher);
            }
            None => hasher.update_u8(0),
        }
        self.executing.hash_into(&mut hasher);
        self.local.hash_into(&mut hasher);

        hasher.update_u32(self.combo.chain);
        hasher.update_u32(self.combo.score);
        hasher.update_bool(self.combo.is_fever);
        hasher.update_bool(self.combo.is_perfect);
        hasher.update_u32(self.combo.jinn_energy);

        hasher.update_u8(self.ability.phase as u8);
        hasher.update_u32(self.ability.combo);
        hasher.update_bool(self.ability.hero_mode);
        hasher.update_u32(self.ability.hero_mode_imperfect_count);
        hasher.update_u32(self.ability.update_version);
        hasher.update_u32(self.ability.activation_version);

        hasher.update_u32(self.consumed.len() as u32);
        for (beat, key) in &self.consumed {
            hasher.update_i32(*beat);
            hasher.update_i32(key.as_i32());
        }

        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::command::CommandStep;

    const INTERVAL: i64 = 500;

    fn setup() -> (CommandRegistry, CommandId, RhythmEngine) {
        let registry = CommandRegistry::new();
        let march = registry
            .get_or_create(&[
                CommandStep::new(0, RhythmKey::Pata),
                CommandStep::new(1, RhythmKey::Pata),
                CommandStep::new(2, RhythmKey::Pata),
                CommandStep::new(3, RhythmKey::Pon),
            ])
            .unwrap();
        let settings = EngineSettings::new(INTERVAL, 0).unwrap();
        let mut engine = RhythmEngine::new(EngineId(1), GhostId(10), settings);
        engine.bind_command(&registry, march).unwrap();
        // 1 ms past beat 0: every later +INTERVAL lands just after a beat
        engine.advance(&registry, 1);
        (registry, march, engine)
    }

    fn press(engine: &mut RhythmEngine, registry: &CommandRegistry, key: RhythmKey) -> PressureOutcome {
        let input = PressureInput::new(key, engine.flow_beat(), engine.score());
        engine.apply_pressure(registry, input)
    }

    fn play_march(engine: &mut RhythmEngine, registry: &CommandRegistry) -> PressureOutcome {
        let keys = [RhythmKey::Pata, RhythmKey::Pata, RhythmKey::Pata, RhythmKey::Pon];
        let mut outcome = PressureOutcome::Ignored(IgnoreReason::NotRunning);
        for (i, key) in keys.iter().enumerate() {
            if i > 0 {
                engine.advance(registry, INTERVAL);
            }
            outcome = press(engine, registry, *key);
        }
        outcome
    }

    #[test]
    fn test_phase_transition_table() {
        use EnginePhase as P;
        use PhaseTrigger as T;

        assert_eq!(P::Idle.transition(T::Start), Some(P::Active));
        assert_eq!(P::Active.transition(T::CommandCompleted), Some(P::Chaining));
        assert_eq!(
            P::Chaining.transition(T::StepFailed { current_beat: 5 }),
            Some(P::Recovering { until_beat: 7 })
        );
        assert_eq!(P::Recovering { until_beat: 7 }.transition(T::BeatReached(6)), None);
        assert_eq!(P::Recovering { until_beat: 7 }.transition(T::BeatReached(7)), Some(P::Active));
        assert_eq!(
            P::Chaining.transition(T::HeroTriggered { activates_at: 9 }),
            Some(P::HeroActivation { activates_at: 9 })
        );
        assert_eq!(P::HeroActivation { activates_at: 9 }.transition(T::BeatReached(9)), Some(P::Chaining));
        assert_eq!(P::Idle.transition(T::CommandCompleted), None);
        assert_eq!(P::Recovering { until_beat: 7 }.transition(T::Reset), Some(P::Idle));
    }

    #[test]
    fn test_engine_starts_when_clock_runs() {
        let (_registry, _march, mut engine) = setup();
        assert_eq!(engine.phase(), EnginePhase::Active);
        assert!(engine.local().can_run_commands());
        assert_eq!(engine.take_events(), vec![EngineEventData::Started]);
    }

    #[test]
    fn test_idle_without_command() {
        let registry = CommandRegistry::new();
        let mut engine = RhythmEngine::new(EngineId(1), GhostId(1), EngineSettings::default());
        engine.advance(&registry, 100);

        assert_eq!(engine.phase(), EnginePhase::Idle);
        let outcome = engine.apply_pressure(&registry, PressureInput::new(RhythmKey::Pata, 0, 0.0));
        assert_eq!(outcome, PressureOutcome::Ignored(IgnoreReason::NotRunning));
    }

    #[test]
    fn test_perfect_march() {
        let (registry, march, mut engine) = setup();

        let outcome = play_march(&mut engine, &registry);
        assert_eq!(outcome, PressureOutcome::Completed { command: march, power: 100 });

        assert_eq!(engine.phase(), EnginePhase::Chaining);
        assert_eq!(engine.combo().chain, 1);
        assert!(engine.combo().is_perfect);

        let executing = engine.executing();
        assert_eq!(executing.target, Some(march));
        assert_eq!(executing.activation_beat_start, 4);
        assert_eq!(executing.activation_beat_end, 8);
        assert!(executing.waiting_for_apply);
        assert_eq!(executing.power(), 1.0);
    }

    #[test]
    fn test_command_activates_on_start_beat() {
        let (registry, march, mut engine) = setup();
        play_march(&mut engine, &registry);
        engine.take_events();

        engine.advance(&registry, INTERVAL); // beat 4
        assert!(!engine.executing().waiting_for_apply);
        assert!(engine.ability().phase.is_active_or_chaining());
        assert_eq!(
            engine.take_events(),
            vec![EngineEventData::CommandActivated { command: march, power: 100 }]
        );
    }

    #[test]
    fn test_wrong_key_fails_and_clears() {
        let (registry, _march, mut engine) = setup();

        press(&mut engine, &registry, RhythmKey::Pata);
        engine.advance(&registry, INTERVAL);
        press(&mut engine, &registry, RhythmKey::Pata);
        engine.advance(&registry, INTERVAL);
        let outcome = press(&mut engine, &registry, RhythmKey::Pon);

        assert!(matches!(outcome, PressureOutcome::Failed(FailReason::WrongKey { .. })));
        assert_eq!(engine.combo().chain, 0);
        assert_eq!(engine.executing(), &ExecutingCommandState::default());
        assert_eq!(engine.phase(), EnginePhase::Recovering { until_beat: 4 });
        assert_eq!(engine.local().recovery_activation_beat, 4);
    }

    #[test]
    fn test_recovery_window() {
        let (registry, _march, mut engine) = setup();

        // Fail on beat 0: recovery until beat 2
        press(&mut engine, &registry, RhythmKey::Pon);
        assert_eq!(engine.local().recovery_activation_beat, 2);

        engine.advance(&registry, INTERVAL); // beat 1
        let ignored = press(&mut engine, &registry, RhythmKey::Pata);
        assert_eq!(ignored, PressureOutcome::Ignored(IgnoreReason::Recovery));

        engine.advance(&registry, INTERVAL); // beat 2
        assert_eq!(engine.phase(), EnginePhase::Active);
        let accepted = press(&mut engine, &registry, RhythmKey::Pata);
        assert!(matches!(accepted, PressureOutcome::Progress { step: 0, .. }));
    }

    #[test]
    fn test_input_during_execution_fails() {
        let (registry, _march, mut engine) = setup();
        play_march(&mut engine, &registry);

        engine.advance(&registry, 2 * INTERVAL); // beat 5, executing [4, 8)
        let outcome = press(&mut engine, &registry, RhythmKey::Pata);

        assert_eq!(
            outcome,
            PressureOutcome::Failed(FailReason::InputDuringExecution { flow_beat: 5 })
        );
        assert_eq!(engine.combo().chain, 0);
        assert!(engine.executing().target.is_none());
    }

    #[test]
    fn test_chain_continues_into_next_command() {
        let (registry, march, mut engine) = setup();
        play_march(&mut engine, &registry);

        engine.advance(&registry, 5 * INTERVAL); // beat 8
        let outcome = play_march(&mut engine, &registry);

        assert_eq!(outcome, PressureOutcome::Completed { command: march, power: 100 });
        assert_eq!(engine.combo().chain, 2);
        assert_eq!(engine.executing().previous, Some(march));
        assert_eq!(engine.executing().activation_beat_start, 12);
    }

    #[test]
    fn test_chain_breaks_without_input() {
        let (registry, _march, mut engine) = setup();
        play_march(&mut engine, &registry);

        engine.advance(&registry, 5 * INTERVAL); // beat 8, still in time
        assert_eq!(engine.combo().chain, 1);
        engine.take_events();

        engine.advance(&registry, INTERVAL); // beat 9
        assert_eq!(engine.combo().chain, 0);
        assert!(engine.executing().target.is_none());
        assert_eq!(engine.phase(), EnginePhase::Active);
        assert_eq!(engine.local().recovery_activation_beat, 0);
        assert_eq!(engine.take_events(), vec![EngineEventData::ChainBroken { chain: 1 }]);
    }

    #[test]
    fn test_abandoned_attempt_is_dropped() {
        let (registry, _march, mut engine) = setup();
        press(&mut engine, &registry, RhythmKey::Pata);

        engine.advance(&registry, 2 * INTERVAL); // beat 2, step 1 expected on beat 1
        let outcome = press(&mut engine, &registry, RhythmKey::Pata);
        assert!(matches!(outcome, PressureOutcome::Progress { step: 0, .. }));
    }

    #[test]
    fn test_duplicate_pressure_is_ignored() {
        let (registry, _march, mut engine) = setup();

        assert!(press(&mut engine, &registry, RhythmKey::Pata).is_accepted());
        let energy = engine.combo().jinn_energy;
        let hash = engine.compute_hash();

        let again = press(&mut engine, &registry, RhythmKey::Pata);
        assert_eq!(again, PressureOutcome::Ignored(IgnoreReason::Duplicate));
        assert_eq!(engine.combo().jinn_energy, energy);
        assert_eq!(engine.compute_hash(), hash);
    }

    #[test]
    fn test_hero_mode_activation() {
        let (registry, _march, mut engine) = setup();
        play_march(&mut engine, &registry);

        // 4 perfect pressures: 80 energy
        assert_eq!(engine.combo().jinn_energy, 80);
        assert!(!engine.trigger_hero_activation());

        engine.advance(&registry, 5 * INTERVAL); // beat 8
        press(&mut engine, &registry, RhythmKey::Pata);
        assert!(engine.combo().jinn_energy_full());
        engine.take_events();

        assert!(engine.trigger_hero_activation());
        assert_eq!(engine.phase(), EnginePhase::HeroActivation { activates_at: 9 });
        assert_eq!(engine.combo().jinn_energy, 0);

        engine.advance(&registry, INTERVAL); // beat 9
        assert_eq!(engine.phase(), EnginePhase::Chaining);
        assert!(engine.ability().hero_mode);
        assert!(engine
            .take_events()
            .contains(&EngineEventData::HeroModeStarted));
    }

    #[test]
    fn test_song_end_resets() {
        let registry = CommandRegistry::new();
        let march = registry.get_or_create(&[CommandStep::new(0, RhythmKey::Pata)]).unwrap();
        let settings = EngineSettings::new(INTERVAL, 4).unwrap();
        let mut engine = RhythmEngine::new(EngineId(1), GhostId(1), settings);
        engine.bind_command(&registry, march).unwrap();

        engine.advance(&registry, 1);
        engine.advance(&registry, 3 * INTERVAL);
        assert!(engine.phase().is_running());
        engine.take_events();

        engine.advance(&registry, INTERVAL); // beat 4
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert_eq!(engine.process().elapsed_ms, 0);
        assert_eq!(
            engine.take_events(),
            vec![EngineEventData::EngineReset { cause: ResetCause::SongEnded }]
        );
    }

    #[test]
    fn test_reset_flushes_executing_state() {
        let (registry, march, mut engine) = setup();
        play_march(&mut engine, &registry);

        engine.reset(ResetCause::Stopped);
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert_eq!(engine.executing().power_integer, 0);
        assert!(engine.executing().target.is_none());
        assert_eq!(engine.combo(), &ComboState::default());
        assert_eq!(engine.bound_command(), Some(march));
    }

    #[test]
    fn test_bind_respects_allowed_commands() {
        let (registry, march, mut engine) = setup();
        let attack = registry
            .get_or_create(&[CommandStep::new(0, RhythmKey::Pon), CommandStep::new(1, RhythmKey::Pon)])
            .unwrap();

        engine.set_ability_commands(AbilityCommands {
            chaining: Some(march),
            combos: Vec::new(),
            hero_mode_allowed: vec![attack],
        });

        assert!(matches!(
            engine.bind_command(&registry, attack),
            Err(EngineError::CommandNotAllowed(_))
        ));
        assert!(matches!(
            engine.bind_command(&registry, CommandId(99)),
            Err(EngineError::UnknownCommand(_))
        ));
        assert!(engine.bind_command(&registry, march).is_ok());
    }

    #[test]
    fn test_power_setter_clamps() {
        let mut executing = ExecutingCommandState::default();
        executing.set_power(1.7);
        assert_eq!(executing.power_integer, 100);
        executing.set_power(-0.3);
        assert_eq!(executing.power_integer, 0);
        executing.set_power(0.5);
        assert_eq!(executing.power_integer, 50);
    }

    #[test]
    fn test_hash_tracks_state() {
        let (registry, _march, mut a) = setup();
        let (_, _, b) = setup();
        assert_eq!(a.compute_hash(), b.compute_hash());

        press(&mut a, &registry, RhythmKey::Pata);
        assert_ne!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn test_player_id_uuid_roundtrip() {
        let id = PlayerId::random();
        assert_eq!(PlayerId::from_uuid_str(&id.to_uuid_string()), Some(id));
        assert_eq!(id.short().len(), 8);
    }
}
